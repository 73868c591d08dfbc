use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

use crate::raw::capture_response;
use crate::trace::{ConnectInfo, TraceInfo};

/// A fully buffered response together with its attempt's trace summaries.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    connect_info: ConnectInfo,
    trace_info: TraceInfo,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
        connect_info: ConnectInfo,
        trace_info: TraceInfo,
    ) -> Self {
        Self {
            status,
            version,
            headers,
            body,
            connect_info,
            trace_info,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Connection-lifecycle timestamps of the attempt that produced this
    /// response.
    pub fn connect_info(&self) -> &ConnectInfo {
        &self.connect_info
    }

    /// Durations derived from the producing attempt, including the attempt
    /// counter and connection-reuse flags.
    pub fn trace_info(&self) -> &TraceInfo {
        &self.trace_info
    }

    /// Best-effort reconstruction of this response's wire bytes.
    pub fn raw(&self) -> std::io::Result<Bytes> {
        capture_response(self.version, self.status, &self.headers, &self.body)
    }
}

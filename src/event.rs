use std::fmt;
use std::net::SocketAddr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::error;

use crate::trace::ConnectInfo;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Caller-supplied correlation value attached to every dispatched event.
///
/// A closed tagged value rather than an open `Any`: it stays printable for
/// the file report and serializes as-is into the network record.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum IndexValue {
    Text(String),
    Number(i64),
}

impl fmt::Display for IndexValue {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => formatter.write_str(text),
            Self::Number(number) => write!(formatter, "{number}"),
        }
    }
}

impl From<String> for IndexValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for IndexValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<i64> for IndexValue {
    fn from(number: i64) -> Self {
        Self::Number(number)
    }
}

impl From<u32> for IndexValue {
    fn from(number: u32) -> Self {
        Self::Number(i64::from(number))
    }
}

/// The full record describing one completed request: connection summary,
/// best-effort raw wire captures, and the error text (empty on success).
/// Immutable once constructed.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub connect_info: ConnectInfo,
    #[serde(serialize_with = "serialize_base64")]
    pub request_raw: Bytes,
    #[serde(serialize_with = "serialize_base64")]
    pub response_raw: Bytes,
    pub error: String,
}

impl TraceEvent {
    /// Assembles an event from a completed request. Raw-capture failures are
    /// logged and leave the corresponding field empty; they never abort
    /// event construction.
    pub(crate) fn assemble(
        connect_info: ConnectInfo,
        request_raw: std::io::Result<Bytes>,
        response_raw: Option<std::io::Result<Bytes>>,
        error_text: String,
    ) -> Self {
        let request_raw = request_raw.unwrap_or_else(|capture_error| {
            error!(error = %capture_error, "failed to capture raw request bytes");
            Bytes::new()
        });
        let response_raw = match response_raw {
            None => Bytes::new(),
            Some(Ok(raw)) => raw,
            Some(Err(capture_error)) => {
                error!(error = %capture_error, "failed to capture raw response bytes");
                Bytes::new()
            }
        };
        Self {
            connect_info,
            request_raw,
            response_raw,
            error: error_text,
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = &self.connect_info;
        writeln!(formatter, "Connect started:{}", format_time(info.get_connect_time))?;
        writeln!(
            formatter,
            "Connection established / request sent:{}",
            format_time(info.got_connect_time)
        )?;
        writeln!(
            formatter,
            "First response byte:{}",
            format_time(info.receive_response_time)
        )?;
        writeln!(formatter, "Connection closed:{}", format_time(info.connect_done))?;
        writeln!(formatter, "Local address:{}", format_addr(info.local_addr))?;
        writeln!(formatter, "Remote address:{}", format_addr(info.remote_addr))?;
        writeln!(formatter)?;
        writeln!(formatter, "Request raw:")?;
        writeln!(formatter, "\t{}", indent_block(&self.request_raw))?;
        writeln!(formatter, "Response raw:")?;
        writeln!(formatter, "\t{}", indent_block(&self.response_raw))?;
        if !self.error.is_empty() {
            writeln!(formatter, "Error:{}", self.error)?;
        }
        Ok(())
    }
}

/// An event paired with its correlation index, as handed to a sink. Built
/// immediately before the push and not retained afterwards.
#[derive(Clone, Debug, Serialize)]
pub struct TraceEventWithIndex {
    #[serde(flatten)]
    pub event: TraceEvent,
    pub index: IndexValue,
}

fn serialize_base64<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&BASE64.encode(bytes))
}

fn format_time(value: Option<DateTime<Utc>>) -> String {
    match value {
        Some(value) => value.format(TIMESTAMP_FORMAT).to_string(),
        None => "-".to_owned(),
    }
}

fn format_addr(value: Option<SocketAddr>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "-".to_owned(),
    }
}

fn indent_block(raw: &Bytes) -> String {
    String::from_utf8_lossy(raw).replace('\n', "\n\t")
}

use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use tokio_util::sync::CancellationToken;

use crate::client::{Client, RequestOptions};
use crate::error::Error;
use crate::event::IndexValue;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::util::{parse_header_name, parse_header_value};

#[doc(hidden)]
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: Method,
    url: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
    timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
    index: Option<IndexValue>,
    cancel: Option<CancellationToken>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, url: String) -> Self {
        Self {
            client,
            method,
            url,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
            retry_policy: None,
            index: None,
            cancel: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query_pairs.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Per-attempt timeout override for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Correlation index attached to this request's trace event. Defaults to
    /// the request URL when unset.
    pub fn index(mut self, index: impl Into<IndexValue>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// External cancellation signal: when the token fires, the in-flight
    /// attempt is aborted and no further attempts are made.
    pub fn cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn send(self) -> Result<Response, Error> {
        let url = append_query_pairs(&self.url, &self.query_pairs);
        let options = RequestOptions {
            timeout: self.timeout,
            retry_policy: self.retry_policy,
            index: self.index,
            cancel: self.cancel,
        };
        self.client
            .send_request(self.method, url, self.headers, self.body, options)
            .await
    }
}

fn append_query_pairs(url: &str, query_pairs: &[(String, String)]) -> String {
    if query_pairs.is_empty() {
        return url.to_owned();
    }

    let Ok(mut parsed) = url::Url::parse(url) else {
        return url.to_owned();
    };
    parsed
        .query_pairs_mut()
        .extend_pairs(query_pairs.iter().map(|(name, value)| (name, value)));
    parsed.to_string()
}

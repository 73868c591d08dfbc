use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn};

use crate::engine::{EngineConfig, EngineRequest, EngineResponse, HttpEngine, HyperEngine, ensure_host_header};
use crate::error::Error;
use crate::event::{IndexValue, TraceEvent};
use crate::raw::{capture_request, capture_response};
use crate::request::RequestBuilder;
use crate::response::Response;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sink::{EventSink, dispatch_event};
use crate::trace::{ConnectInfo, ConnectionTracer};
use crate::util::{
    is_redirect_status, merge_headers, parse_header_name, parse_header_value, redact_uri_for_logs,
    redirect_location, redirect_method, resolve_redirect_uri, resolve_uri, same_origin,
    sanitize_headers_for_redirect,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_MAX_REDIRECTS: usize = 10;
const DEFAULT_CLIENT_NAME: &str = "reqtrace";

pub struct ClientBuilder {
    default_headers: HeaderMap,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
    follow_redirects: bool,
    max_redirects: usize,
    danger_accept_invalid_certs: bool,
    local_addr: Option<IpAddr>,
    http_proxy: Option<Uri>,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    disable_keep_alive: bool,
    client_name: String,
    engine: Option<Arc<dyn HttpEngine>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            default_headers: HeaderMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_policy: RetryPolicy::disabled(),
            follow_redirects: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            danger_accept_invalid_certs: false,
            local_addr: None,
            http_proxy: None,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            disable_keep_alive: false,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            engine: None,
            sinks: Vec::new(),
        }
    }

    /// Per-attempt timeout.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn follow_redirects(mut self, follow_redirects: bool) -> Self {
        self.follow_redirects = follow_redirects;
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Disables server certificate verification for https targets.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.danger_accept_invalid_certs = accept;
        self
    }

    /// Local address to bind outgoing sockets to.
    pub fn local_address(mut self, local_addr: IpAddr) -> Self {
        self.local_addr = Some(local_addr);
        self
    }

    pub fn http_proxy(mut self, proxy_uri: Uri) -> Self {
        self.http_proxy = Some(proxy_uri);
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host.max(1);
        self
    }

    pub fn disable_keep_alive(mut self, disable: bool) -> Self {
        self.disable_keep_alive = disable;
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    /// Replaces the underlying HTTP engine. Intended for tests and for
    /// callers that bring their own transport.
    pub fn engine(mut self, engine: Arc<dyn HttpEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Registers an event sink. Sinks are only appended at configuration
    /// time; each completed request is pushed to every registered sink in
    /// registration order. The caller keeps ownership of the sink's
    /// resource and is responsible for closing it.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn try_build(self) -> Result<Client, Error> {
        if let Some(proxy) = &self.http_proxy
            && proxy.host().is_none()
        {
            return Err(Error::InvalidUri {
                uri: proxy.to_string(),
            });
        }
        let engine = match self.engine {
            Some(engine) => engine,
            None => Arc::new(HyperEngine::new(EngineConfig {
                danger_accept_invalid_certs: self.danger_accept_invalid_certs,
                local_addr: self.local_addr,
                proxy: self.http_proxy,
                pool_idle_timeout: self.pool_idle_timeout,
                pool_max_idle_per_host: self.pool_max_idle_per_host,
                disable_keep_alive: self.disable_keep_alive,
            })?),
        };
        Ok(Client {
            engine,
            default_headers: self.default_headers,
            request_timeout: self.request_timeout,
            retry_policy: self.retry_policy,
            follow_redirects: self.follow_redirects,
            max_redirects: self.max_redirects,
            client_name: self.client_name,
            sinks: self.sinks.into(),
        })
    }

    pub fn build(self) -> Client {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build reqtrace client: {error}"))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An instrumented HTTP client.
///
/// Each request records per-phase connection timestamps and may be retried
/// within a bounded attempt budget. Once settled, success or failure, it is
/// reported as one [`TraceEvent`] to every registered sink.
#[derive(Clone)]
pub struct Client {
    engine: Arc<dyn HttpEngine>,
    default_headers: HeaderMap,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
    follow_redirects: bool,
    max_redirects: usize,
    client_name: String,
    sinks: Arc<[Arc<dyn EventSink>]>,
}

#[derive(Default)]
pub(crate) struct RequestOptions {
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) index: Option<IndexValue>,
    pub(crate) cancel: Option<CancellationToken>,
}

struct CompletedRequest {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    connect_info: ConnectInfo,
    trace_info: crate::trace::TraceInfo,
    sent: EngineRequest,
}

struct FailedRequest {
    error: Error,
    connect_info: ConnectInfo,
    sent: EngineRequest,
    response: Option<EngineResponse>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub(crate) async fn send_request(
        &self,
        method: Method,
        url: String,
        headers: HeaderMap,
        body: Bytes,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        let uri = resolve_uri(&url)?;
        let index = options
            .index
            .unwrap_or_else(|| IndexValue::from(url.as_str()));
        let cancel = options.cancel.unwrap_or_else(CancellationToken::new);
        let timeout_value = options
            .timeout
            .unwrap_or(self.request_timeout)
            .max(Duration::from_millis(1));
        let retry_policy = options
            .retry_policy
            .unwrap_or_else(|| self.retry_policy.clone());
        let mut merged_headers = merge_headers(&self.default_headers, &headers);
        if !merged_headers.contains_key(USER_AGENT)
            && let Ok(value) = HeaderValue::from_str(&self.client_name)
        {
            merged_headers.insert(USER_AGENT, value);
        }

        let outcome = self
            .execute_with_retry(method, uri, merged_headers, body, timeout_value, retry_policy, &cancel)
            .await;

        if !self.sinks.is_empty() {
            let event = match &outcome {
                Ok(completed) => assemble_event(
                    completed.connect_info,
                    &completed.sent,
                    Some((completed.version, completed.status, &completed.headers, &completed.body)),
                    String::new(),
                ),
                Err(failed) => assemble_event(
                    failed.connect_info,
                    &failed.sent,
                    failed
                        .response
                        .as_ref()
                        .map(|response| (response.version, response.status, &response.headers, &response.body)),
                    failed.error.to_string(),
                ),
            };
            dispatch_event(&self.sinks, &index, &event);
        }

        match outcome {
            Ok(completed) => Ok(Response::new(
                completed.status,
                completed.version,
                completed.headers,
                completed.body,
                completed.connect_info,
                completed.trace_info,
            )),
            Err(failed) => Err(failed.error),
        }
    }

    async fn execute_with_retry(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        timeout_value: Duration,
        retry_policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<CompletedRequest, Box<FailedRequest>> {
        let max_attempts = retry_policy.configured_max_attempts();
        let mut attempt = 1_usize;
        let mut redirect_count = 0_usize;
        let mut current_method = method;
        let mut current_uri = uri;
        let mut current_headers = headers;
        let mut current_body = body;

        loop {
            let redacted_uri = redact_uri_for_logs(&current_uri);
            let span = info_span!(
                "reqtrace.request",
                client = %self.client_name,
                method = %current_method,
                uri = %redacted_uri,
                attempt = attempt,
                max_attempts = max_attempts
            );
            let _enter = span.enter();

            let mut attempt_headers = current_headers.clone();
            ensure_host_header(&mut attempt_headers, &current_uri);
            if !current_body.is_empty() && !attempt_headers.contains_key(CONTENT_LENGTH) {
                attempt_headers.insert(CONTENT_LENGTH, HeaderValue::from(current_body.len()));
            }
            let sent = EngineRequest {
                method: current_method.clone(),
                uri: current_uri.clone(),
                headers: attempt_headers,
                body: current_body.clone(),
            };

            // Cancellation is observed before every dispatch; a canceled
            // request must not start another attempt even with budget left.
            if cancel.is_cancelled() {
                return Err(Box::new(FailedRequest {
                    error: Error::Canceled {
                        method: current_method,
                        uri: redacted_uri,
                    },
                    connect_info: ConnectInfo::default(),
                    sent,
                    response: None,
                }));
            }

            debug!("sending request");
            let mut tracer = ConnectionTracer::start();
            let attempt_result = self
                .execute_attempt(sent.clone(), &redacted_uri, timeout_value, cancel, &mut tracer)
                .await;

            match attempt_result {
                Ok(response) => {
                    if is_redirect_status(response.status) {
                        if !self.follow_redirects {
                            return Err(Box::new(FailedRequest {
                                error: Error::RedirectDisabled {
                                    status: response.status.as_u16(),
                                    method: current_method,
                                    uri: redacted_uri,
                                },
                                connect_info: tracer.connect_info(),
                                sent,
                                response: Some(response),
                            }));
                        }
                        match self.next_redirect_target(
                            &response,
                            &current_method,
                            &current_uri,
                            &redacted_uri,
                            redirect_count,
                        ) {
                            Ok((next_method, next_uri)) => {
                                let method_changed_to_get =
                                    next_method == Method::GET && current_method != Method::GET;
                                sanitize_headers_for_redirect(
                                    &mut current_headers,
                                    method_changed_to_get,
                                    same_origin(&current_uri, &next_uri),
                                );
                                if method_changed_to_get {
                                    current_body = Bytes::new();
                                }
                                debug!(
                                    status = response.status.as_u16(),
                                    location = %redact_uri_for_logs(&next_uri),
                                    "following redirect"
                                );
                                current_method = next_method;
                                current_uri = next_uri;
                                redirect_count += 1;
                                continue;
                            }
                            Err(error) => {
                                return Err(Box::new(FailedRequest {
                                    error,
                                    connect_info: tracer.connect_info(),
                                    sent,
                                    response: Some(response),
                                }));
                            }
                        }
                    }

                    debug!(status = response.status.as_u16(), "request completed");
                    return Ok(CompletedRequest {
                        status: response.status,
                        version: response.version,
                        headers: response.headers,
                        body: response.body,
                        connect_info: tracer.connect_info(),
                        trace_info: tracer.trace_info(attempt),
                        sent,
                    });
                }
                Err(attempt_error) => {
                    // Tie-break: a cancellation pending at failure time wins
                    // over whatever transport error the attempt produced.
                    let attempt_error = if !attempt_error.is_canceled() && cancel.is_cancelled() {
                        Error::Canceled {
                            method: current_method.clone(),
                            uri: redacted_uri.clone(),
                        }
                    } else {
                        attempt_error
                    };
                    if attempt_error.is_canceled() {
                        return Err(Box::new(FailedRequest {
                            error: attempt_error,
                            connect_info: tracer.connect_info(),
                            sent,
                            response: None,
                        }));
                    }

                    let decision = RetryDecision {
                        attempt,
                        max_attempts,
                        method: current_method.clone(),
                        uri: redacted_uri.clone(),
                        transport_error_kind: attempt_error.transport_error_kind(),
                        timed_out: attempt_error.is_timeout(),
                    };
                    let retry_eligible = retry_policy.should_retry_decision(&decision);
                    if attempt < max_attempts && retry_eligible {
                        let retry_delay = retry_policy.backoff_for_retry(attempt);
                        warn!(
                            delay_ms = retry_delay.as_millis() as u64,
                            error = %attempt_error,
                            "retrying request after failed attempt"
                        );
                        if !retry_delay.is_zero() {
                            // A cancellation during the backoff wakes the
                            // loop immediately instead of after the delay.
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    return Err(Box::new(FailedRequest {
                                        error: Error::Canceled {
                                            method: current_method,
                                            uri: redacted_uri,
                                        },
                                        connect_info: tracer.connect_info(),
                                        sent,
                                        response: None,
                                    }));
                                }
                                _ = sleep(retry_delay) => {}
                            }
                        }
                        attempt += 1;
                        continue;
                    }

                    let error = if retry_eligible && max_attempts > 1 && attempt >= max_attempts {
                        Error::RetriesExhausted {
                            attempts: attempt,
                            method: current_method,
                            uri: redacted_uri,
                            source: Box::new(attempt_error),
                        }
                    } else {
                        attempt_error
                    };
                    return Err(Box::new(FailedRequest {
                        error,
                        connect_info: tracer.connect_info(),
                        sent,
                        response: None,
                    }));
                }
            }
        }
    }

    /// Runs one attempt: binds the fresh tracer to the engine call and races
    /// it against the cancellation signal and the per-attempt timeout.
    /// Dropping the engine future aborts the in-flight connection attempt.
    async fn execute_attempt(
        &self,
        sent: EngineRequest,
        redacted_uri: &str,
        timeout_value: Duration,
        cancel: &CancellationToken,
        tracer: &mut ConnectionTracer,
    ) -> Result<EngineResponse, Error> {
        let method = sent.method.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Canceled {
                method,
                uri: redacted_uri.to_owned(),
            }),
            result = timeout(timeout_value, self.engine.execute(sent, tracer)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_elapsed) => Err(Error::Timeout {
                        timeout_ms: timeout_value.as_millis(),
                        method,
                        uri: redacted_uri.to_owned(),
                    }),
                }
            }
        }
    }

    fn next_redirect_target(
        &self,
        response: &EngineResponse,
        current_method: &Method,
        current_uri: &Uri,
        redacted_uri: &str,
        redirect_count: usize,
    ) -> Result<(Method, Uri), Error> {
        if redirect_count >= self.max_redirects {
            return Err(Error::RedirectLimitExceeded {
                max_redirects: self.max_redirects,
                method: current_method.clone(),
                uri: redacted_uri.to_owned(),
            });
        }
        let Some(location) = redirect_location(&response.headers) else {
            return Err(Error::MissingRedirectLocation {
                status: response.status.as_u16(),
                method: current_method.clone(),
                uri: redacted_uri.to_owned(),
            });
        };
        let Some(next_uri) = resolve_redirect_uri(current_uri, &location) else {
            return Err(Error::InvalidRedirectLocation {
                location,
                method: current_method.clone(),
                uri: redacted_uri.to_owned(),
            });
        };
        Ok((redirect_method(current_method, response.status), next_uri))
    }
}

fn assemble_event(
    connect_info: ConnectInfo,
    sent: &EngineRequest,
    response: Option<(Version, StatusCode, &HeaderMap, &Bytes)>,
    error_text: String,
) -> TraceEvent {
    let request_raw = capture_request(&sent.method, &sent.uri, &sent.headers, &sent.body);
    let response_raw = response.map(|(version, status, headers, body)| {
        capture_response(version, status, headers, body)
    });
    TraceEvent::assemble(connect_info, request_raw, response_raw, error_text)
}

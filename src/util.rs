use std::sync::Mutex;

use http::header::{AUTHORIZATION, COOKIE, HeaderName, HeaderValue, PROXY_AUTHORIZATION};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::{Error, TransportErrorKind};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    for (name, value) in request_headers {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn resolve_uri(uri_text: &str) -> Result<Uri, Error> {
    let uri: Uri = uri_text.parse().map_err(|_| Error::InvalidUri {
        uri: uri_text.to_owned(),
    })?;
    let scheme_supported = uri.scheme_str().is_some_and(|scheme| {
        scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
    });
    if !scheme_supported || uri.host().is_none() {
        return Err(Error::InvalidUri {
            uri: uri_text.to_owned(),
        });
    }
    Ok(uri)
}

pub(crate) fn redact_uri_for_logs(uri: &Uri) -> String {
    let scheme = uri.scheme_str().unwrap_or("http");
    let host = uri.host().unwrap_or_default();
    let port = uri
        .port_u16()
        .map(|port| format!(":{port}"))
        .unwrap_or_default();
    format!("{scheme}://{host}{port}{}", uri.path())
}

pub(crate) fn default_port(uri: &Uri) -> u16 {
    match uri.port_u16() {
        Some(port) => port,
        None if is_https(uri) => 443,
        None => 80,
    }
}

pub(crate) fn is_https(uri: &Uri) -> bool {
    uri.scheme_str()
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"))
}

pub(crate) fn classify_hyper_error(error: &hyper::Error) -> TransportErrorKind {
    if error.is_incomplete_message() || error.is_body_write_aborted() {
        return TransportErrorKind::Read;
    }
    if error.is_parse() || error.is_parse_status() || error.is_parse_too_large() {
        return TransportErrorKind::Read;
    }
    let text = error.to_string().to_ascii_lowercase();
    if text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
        || text.contains("closed")
    {
        return TransportErrorKind::Read;
    }
    TransportErrorKind::Other
}

pub(crate) fn classify_io_error(error: &std::io::Error) -> TransportErrorKind {
    match error.kind() {
        std::io::ErrorKind::NotFound => TransportErrorKind::Dns,
        std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::AddrNotAvailable
        | std::io::ErrorKind::AddrInUse => TransportErrorKind::Connect,
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::TimedOut
        | std::io::ErrorKind::WouldBlock => TransportErrorKind::Read,
        _ => TransportErrorKind::Other,
    }
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

pub(crate) fn redirect_method(method: &Method, status: StatusCode) -> Method {
    match status.as_u16() {
        303 => Method::GET,
        301 | 302 if *method == Method::POST => Method::GET,
        _ => method.clone(),
    }
}

pub(crate) fn redirect_location(headers: &HeaderMap) -> Option<String> {
    headers
        .get(http::header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}

pub(crate) fn resolve_redirect_uri(current: &Uri, location: &str) -> Option<Uri> {
    let base = url::Url::parse(&current.to_string()).ok()?;
    let resolved = base.join(location).ok()?;
    resolved.as_str().parse().ok()
}

pub(crate) fn same_origin(left: &Uri, right: &Uri) -> bool {
    left.scheme_str().map(str::to_ascii_lowercase)
        == right.scheme_str().map(str::to_ascii_lowercase)
        && left.host().map(str::to_ascii_lowercase) == right.host().map(str::to_ascii_lowercase)
        && default_port(left) == default_port(right)
}

pub(crate) fn sanitize_headers_for_redirect(
    headers: &mut HeaderMap,
    method_changed_to_get: bool,
    same_origin_redirect: bool,
) {
    if !same_origin_redirect {
        headers.remove(AUTHORIZATION);
        headers.remove(PROXY_AUTHORIZATION);
        headers.remove(COOKIE);
    }
    if method_changed_to_get {
        headers.remove(http::header::CONTENT_LENGTH);
        headers.remove(http::header::CONTENT_TYPE);
    }
}

use std::io::Write;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};

fn version_text(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap) -> std::io::Result<()> {
    for (name, value) in headers {
        out.write_all(name.as_str().as_bytes())?;
        out.write_all(b": ")?;
        out.write_all(value.as_bytes())?;
        out.write_all(b"\r\n")?;
    }
    out.write_all(b"\r\n")
}

/// Serializes an outgoing request to its literal HTTP/1.1 wire form.
pub(crate) fn capture_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> std::io::Result<Bytes> {
    let target = uri
        .path_and_query()
        .map(|item| item.as_str())
        .unwrap_or("/");
    let mut out = Vec::with_capacity(128 + body.len());
    write!(out, "{method} {target} HTTP/1.1\r\n")?;
    write_headers(&mut out, headers)?;
    out.write_all(body)?;
    Ok(Bytes::from(out))
}

/// Serializes a received response to its literal wire form.
pub(crate) fn capture_response(
    version: Version,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> std::io::Result<Bytes> {
    let reason = status.canonical_reason().unwrap_or("");
    let mut out = Vec::with_capacity(128 + body.len());
    write!(out, "{} {} {reason}\r\n", version_text(version), status.as_u16())?;
    write_headers(&mut out, headers)?;
    out.write_all(body)?;
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use http::header::{HOST, USER_AGENT};
    use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};

    use super::{capture_request, capture_response};

    #[test]
    fn request_capture_includes_request_line_headers_and_body() {
        let uri: Uri = "http://example.test/items?a=1".parse().expect("uri");
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("example.test"));
        headers.insert(USER_AGENT, HeaderValue::from_static("reqtrace"));

        let raw = capture_request(&Method::POST, &uri, &headers, b"payload").expect("capture");
        let text = String::from_utf8(raw.to_vec()).expect("utf8");
        assert!(text.starts_with("POST /items?a=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: example.test\r\n"));
        assert!(text.ends_with("\r\n\r\npayload"));
    }

    #[test]
    fn response_capture_includes_status_line() {
        let headers = HeaderMap::new();
        let raw = capture_response(Version::HTTP_11, StatusCode::NOT_FOUND, &headers, b"missing")
            .expect("capture");
        let text = String::from_utf8(raw.to_vec()).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with("missing"));
    }
}

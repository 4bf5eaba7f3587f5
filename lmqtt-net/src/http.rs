//! Minimal HTTP/1.x support for non-MQTT requests arriving on an MQTT port.
//!
//! Only one request per connection is served: the response is written and the
//! connection is closed afterwards.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::{MqttError, Result};

///Upper bound for the request head (request line + headers).
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;
const MAX_HEADERS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl HttpRequest {
    #[inline]
    pub fn new(method: Method, uri: Uri) -> Self {
        Self { method, uri, version: Version::HTTP_11, headers: HeaderMap::new() }
    }

    #[inline]
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new<B: Into<Bytes>>(status: StatusCode, content_type: &'static str, body: B) -> Self {
        let mut resp = http::Response::new(body.into());
        *resp.status_mut() = status;
        resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self::from(resp)
    }

    #[inline]
    pub fn ok<B: Into<Bytes>>(body: B) -> Self {
        Self::new(StatusCode::OK, "application/json", body)
    }

    #[inline]
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "text/plain", Bytes::new())
    }

    #[inline]
    pub fn method_not_allowed() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, "text/plain", Bytes::new())
    }

    /// Serializes the status line, headers and body.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + self.body.len());
        buf.put_slice(b"HTTP/1.1 ");
        buf.put_slice(self.status.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.status.canonical_reason().unwrap_or_default().as_bytes());
        buf.put_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf
    }
}

///Content-Length always matches the body and the connection is always closed after the reply.
impl From<http::Response<Bytes>> for HttpResponse {
    fn from(resp: http::Response<Bytes>) -> Self {
        let (parts, body) = resp.into_parts();
        let mut headers = parts.headers;
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        Self { status: parts.status, headers, body }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpPacket {
    Request(HttpRequest),
    Response(HttpResponse),
}

///HTTP requests start with an upper-case method token, MQTT control packets never
///start with a printable ASCII letter.
#[inline]
pub fn is_http_start(first_byte: u8) -> bool {
    first_byte.is_ascii_uppercase()
}

#[inline]
fn bad_request<E: ToString>(e: E) -> crate::Error {
    MqttError::HttpRequest(e.to_string()).into()
}

/// Parses a request head. Returns `Ok(None)` while the head is incomplete, otherwise the
/// request and the number of bytes consumed.
pub fn parse_request(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let consumed = match req.parse(buf).map_err(bad_request)? {
        httparse::Status::Complete(consumed) => consumed,
        httparse::Status::Partial if buf.len() > MAX_REQUEST_HEAD => {
            return Err(bad_request("request head too large"))
        }
        httparse::Status::Partial => return Ok(None),
    };

    let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes()).map_err(bad_request)?;
    let uri = req.path.unwrap_or("/").parse::<Uri>().map_err(bad_request)?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut header_map = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(bad_request)?;
        let value = HeaderValue::from_bytes(h.value).map_err(bad_request)?;
        header_map.append(name, value);
    }

    Ok(Some((HttpRequest { method, uri, version, headers: header_map }, consumed)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_health_check() {
        let raw = b"GET /health?verbose=1 HTTP/1.1\r\nHost: localhost\r\nUser-Agent: curl\r\n\r\n";
        let (req, consumed) = parse_request(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.path(), "/health");
        assert_eq!(req.version, Version::HTTP_11);
        assert_eq!(req.header("host"), Some("localhost"));
    }

    #[test]
    fn parse_incomplete_and_invalid() {
        assert!(parse_request(b"GET /health HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
        assert!(parse_request(b"GET\r\n\r\n").is_err());
        assert!(parse_request(b"GET / SMTP\r\n\r\n").is_err());
        let big = vec![b'A'; MAX_REQUEST_HEAD + 1];
        assert!(parse_request(&big).is_err());
    }

    #[test]
    fn sniff_first_byte() {
        assert!(is_http_start(b'G'));
        assert!(is_http_start(b'P'));
        //CONNECT fixed header
        assert!(!is_http_start(0x10));
    }

    #[test]
    fn encode_response() {
        let resp = HttpResponse::ok(r#"{"status":"UP"}"#);
        let raw = resp.encode();
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 15\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with(r#"{"status":"UP"}"#));
    }

    #[test]
    fn response_from_http_builder() {
        let resp = http::Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header(CONTENT_TYPE, "text/plain")
            .body(Bytes::from_static(b"down"))
            .unwrap();
        let resp = HttpResponse::from(resp);
        assert_eq!(resp.status, 503);
        assert_eq!(resp.headers.get(CONTENT_LENGTH).unwrap(), "4");
        let raw = resp.encode();
        assert!(std::str::from_utf8(&raw).unwrap().starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    }
}

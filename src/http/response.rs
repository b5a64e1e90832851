//! The response model: a tagged union over regular HTTP responses and
//! WebSocket upgrades, decided once at construction time.
//!
//! Regular responses carry a [`Body`] variant chosen explicitly by the
//! handler; the dispatcher never sniffs a body's runtime shape. Header
//! defaults derived from the body variant are computed only for headers the
//! caller has not set.

use std::fmt;
use std::io;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::Stream;

use super::{Cookie, Headers, StatusCode};
use crate::ws::WebSocketBody;

/// A streamed response body: byte chunks pulled lazily, each possibly failing.
///
/// `Sync` is required because cleanups may borrow the response across await
/// points after dispatch.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// The body of a regular HTTP response.
pub enum Body {
    Empty,
    Text(String),
    Binary(Bytes),
    Stream(BodyStream),
}

impl Body {
    /// Returns the known byte length, or `None` for streamed bodies.
    pub fn known_len(&self) -> Option<usize> {
        match self {
            Self::Empty => Some(0),
            Self::Text(s) => Some(s.len()),
            Self::Binary(b) => Some(b.len()),
            Self::Stream(_) => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Text(s) => write!(f, "Body::Text({} bytes)", s.len()),
            Self::Binary(b) => write!(f, "Body::Binary({} bytes)", b.len()),
            Self::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

/// A response to be dispatched onto the transport.
///
/// # Examples
///
/// ```
/// use strand::http::{Response, StatusCode};
///
/// let response = Response::from(
///     strand::http::RegularResponse::new(StatusCode::Ok).text("hello"),
/// );
/// assert!(matches!(response, Response::Regular(_)));
/// ```
#[derive(Debug)]
pub enum Response {
    Regular(RegularResponse),
    WebSocket(WebSocketResponse),
}

impl Response {
    /// A `200 OK` plain-text response.
    pub fn text(body: impl Into<String>) -> Self {
        Self::Regular(RegularResponse::new(StatusCode::Ok).text(body))
    }

    /// An empty response with the given status.
    pub fn empty(status: StatusCode) -> Self {
        Self::Regular(RegularResponse::new(status))
    }

    /// A WebSocket upgrade response driven by the given callbacks.
    pub fn websocket(body: WebSocketBody) -> Self {
        Self::WebSocket(WebSocketResponse::new(body))
    }

    /// Returns the status code this response will carry on the wire.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Regular(r) => r.status(),
            Self::WebSocket(_) => StatusCode::SwitchingProtocols,
        }
    }
}

impl From<RegularResponse> for Response {
    fn from(response: RegularResponse) -> Self {
        Self::Regular(response)
    }
}

impl From<WebSocketResponse> for Response {
    fn from(response: WebSocketResponse) -> Self {
        Self::WebSocket(response)
    }
}

/// A regular HTTP response: status, headers, cookies, and a [`Body`].
#[derive(Debug)]
pub struct RegularResponse {
    status: StatusCode,
    headers: Headers,
    cookies: Vec<Cookie>,
    body: Body,
}

impl RegularResponse {
    /// Creates a response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            cookies: Vec::new(),
            body: Body::Empty,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place, for code that receives a response from
    /// elsewhere and needs to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Attaches a cookie, serialized as its own `Set-Cookie` header line.
    #[must_use]
    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    /// Sets a UTF-8 text body.
    #[must_use]
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Text(body.into());
        self
    }

    /// Sets a binary body.
    #[must_use]
    pub fn binary(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Binary(body.into());
        self
    }

    /// Sets a streamed body. Chunks are pulled lazily during dispatch.
    #[must_use]
    pub fn stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
    {
        self.body = Body::Stream(Box::pin(stream));
        self
    }

    /// Returns the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the header map.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the attached cookies.
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Returns the body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Takes the body out, leaving `Body::Empty` in its place.
    pub(crate) fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::Empty)
    }

    /// Fills in headers derived from the body variant, without overriding
    /// anything the caller set explicitly.
    pub(crate) fn apply_body_defaults(&mut self) {
        match &self.body {
            Body::Empty => {
                if !self.headers.contains("content-length") {
                    self.headers.insert("Content-Length", "0");
                }
            }
            Body::Text(s) => {
                if !self.headers.contains("content-type") {
                    self.headers
                        .insert("Content-Type", "text/plain; charset=utf-8");
                }
                if !self.headers.contains("content-length") {
                    self.headers.insert("Content-Length", s.len().to_string());
                }
            }
            Body::Binary(b) => {
                if !self.headers.contains("content-type") {
                    self.headers
                        .insert("Content-Type", "application/octet-stream");
                }
                if !self.headers.contains("content-length") {
                    self.headers.insert("Content-Length", b.len().to_string());
                }
            }
            Body::Stream(_) => {
                if !self.headers.contains("content-type") {
                    self.headers
                        .insert("Content-Type", "application/octet-stream");
                }
                // Without a caller-declared length the wire needs chunk framing.
                if !self.headers.contains("content-length")
                    && !self.headers.contains("transfer-encoding")
                {
                    self.headers.insert("Transfer-Encoding", "chunked");
                }
            }
        }
    }

    /// Serializes the status line, headers, and cookies into HTTP/1.1 wire
    /// format, up to and including the blank separator line.
    pub(crate) fn head_bytes(&self) -> BytesMut {
        let estimated = 64 + (self.headers.len() + self.cookies.len()) * 64;
        let mut buf = BytesMut::with_capacity(estimated);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        for cookie in &self.cookies {
            buf.put(format!("Set-Cookie: {cookie}\r\n").as_bytes());
        }

        buf.put(&b"\r\n"[..]);
        buf
    }
}

impl Default for RegularResponse {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// A WebSocket upgrade: fixed status 101, no regular headers or cookies.
///
/// The handshake headers are derived from the request during dispatch; the
/// payload is the set of connection callbacks in [`WebSocketBody`].
#[derive(Debug)]
pub struct WebSocketResponse {
    body: Option<WebSocketBody>,
}

impl WebSocketResponse {
    /// Creates an upgrade response driven by the given callbacks.
    pub fn new(body: WebSocketBody) -> Self {
        Self { body: Some(body) }
    }

    /// Takes the callbacks out; the dispatcher consumes them exactly once.
    pub(crate) fn take_body(&mut self) -> Option<WebSocketBody> {
        self.body.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn head_string(response: &mut RegularResponse) -> String {
        response.apply_body_defaults();
        String::from_utf8(response.head_bytes().to_vec()).unwrap()
    }

    #[test]
    fn text_body_defaults() {
        let mut r = RegularResponse::new(StatusCode::Ok).text("hello");
        let head = head_string(&mut r);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn explicit_content_type_wins() {
        let mut r = RegularResponse::new(StatusCode::Ok)
            .header("Content-Type", "application/json")
            .text("{}");
        let head = head_string(&mut r);
        assert!(head.contains("Content-Type: application/json\r\n"));
        assert!(!head.contains("text/plain"));
        // Length was not set explicitly, so it is still computed.
        assert!(head.contains("Content-Length: 2\r\n"));
    }

    #[test]
    fn empty_body_gets_zero_length() {
        let mut r = RegularResponse::new(StatusCode::NoContent);
        let head = head_string(&mut r);
        assert!(head.contains("Content-Length: 0\r\n"));
        assert!(!head.contains("Content-Type"));
    }

    #[test]
    fn binary_body_defaults() {
        let mut r = RegularResponse::new(StatusCode::Ok).binary(Bytes::from_static(b"\x00\x01"));
        let head = head_string(&mut r);
        assert!(head.contains("Content-Type: application/octet-stream\r\n"));
        assert!(head.contains("Content-Length: 2\r\n"));
    }

    #[test]
    fn stream_body_defaults_to_chunked() {
        let mut r = RegularResponse::new(StatusCode::Ok)
            .stream(stream::iter([Ok(Bytes::from_static(b"chunk"))]));
        let head = head_string(&mut r);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!head.contains("Content-Length"));
    }

    #[test]
    fn stream_with_explicit_length_is_not_chunked() {
        let mut r = RegularResponse::new(StatusCode::Ok)
            .header("Content-Length", "5")
            .stream(stream::iter([Ok(Bytes::from_static(b"chunk"))]));
        let head = head_string(&mut r);
        assert!(!head.contains("Transfer-Encoding"));
        assert!(head.contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn cookies_serialized_as_set_cookie_lines() {
        let mut r = RegularResponse::new(StatusCode::Ok)
            .cookie(Cookie::new("a", "1"))
            .cookie(Cookie::new("b", "2").path("/"));
        let head = head_string(&mut r);
        assert!(head.contains("Set-Cookie: a=1\r\n"));
        assert!(head.contains("Set-Cookie: b=2; Path=/\r\n"));
    }
}

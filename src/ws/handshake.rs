//! The HTTP → WebSocket upgrade handshake (RFC 6455 §4).
//!
//! Validation is typed and returned, never thrown: [`negotiate`] inspects an
//! upgrade request and either produces a [`Handshake`] ready to be written as
//! a `101 Switching Protocols` head, or an [`UpgradeError`] the caller can
//! translate into an HTTP error response. A failed negotiation never writes
//! a partial handshake.

use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::{Method, Request};

/// RFC 6455 GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket protocol versions this toolkit accepts.
const SUPPORTED_VERSIONS: [&str; 2] = ["8", "13"];

/// A rejected upgrade request.
///
/// Failures of the `Connection: Upgrade` requirement are reported through
/// the upgrade-header variants, which cover both halves of the upgrade
/// negotiation header pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    #[error("upgrade requests must use GET, got {0}")]
    NonGetMethod(String),

    #[error("missing Connection/Upgrade header")]
    MissingUpgradeHeader,

    #[error("invalid Connection/Upgrade header: {0}")]
    InvalidUpgradeHeader(String),

    #[error("missing Sec-WebSocket-Key header")]
    MissingKeyHeader,

    #[error("invalid Sec-WebSocket-Key header: {0}")]
    InvalidKeyHeader(String),

    #[error("missing Sec-WebSocket-Version header")]
    MissingVersionHeader,

    #[error("invalid or unsupported Sec-WebSocket-Version: {0}")]
    UnsupportedVersionHeader(String),
}

/// A successfully negotiated upgrade, ready to be written to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    accept: String,
    protocol: Option<String>,
}

impl Handshake {
    /// The computed `Sec-WebSocket-Accept` value.
    pub fn accept(&self) -> &str {
        &self.accept
    }

    /// The negotiated subprotocol, if the client offered any.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Serializes the raw `HTTP/1.1 101 Switching Protocols` head.
    ///
    /// This is written directly to the underlying socket, bypassing the
    /// regular response machinery, since the connection is about to leave
    /// HTTP for WebSocket framing.
    pub fn response_bytes(&self) -> Vec<u8> {
        let mut response = String::from(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n",
        );

        response.push_str("Sec-WebSocket-Accept: ");
        response.push_str(&self.accept);
        response.push_str("\r\n");

        if let Some(protocol) = &self.protocol {
            response.push_str("Sec-WebSocket-Protocol: ");
            response.push_str(protocol);
            response.push_str("\r\n");
        }

        response.push_str("\r\n");
        response.into_bytes()
    }
}

/// Computes the `Sec-WebSocket-Accept` value for a client key
/// (RFC 6455 §4.2.2): base64(SHA-1(key + GUID)).
///
/// # Examples
///
/// ```
/// use strand::ws::accept_key;
///
/// assert_eq!(
///     accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

// A syntactically valid client key is 16 bytes of base64: exactly 22
// alphabet characters followed by "==".
fn is_valid_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 24
        && &bytes[22..] == b"=="
        && bytes[..22]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
}

/// Validates an upgrade request and computes the handshake.
///
/// Checks, in order: the method is `GET`, `Connection` contains the
/// `Upgrade` token, `Upgrade` is `websocket`, `Sec-WebSocket-Key` is
/// syntactically valid, and `Sec-WebSocket-Version` is supported. The first
/// offered `Sec-WebSocket-Protocol` token, if any, is selected.
///
/// # Errors
///
/// Returns the [`UpgradeError`] for the first failing check.
pub fn negotiate(request: &Request) -> Result<Handshake, UpgradeError> {
    if request.method() != &Method::Get {
        return Err(UpgradeError::NonGetMethod(
            request.method().as_str().to_owned(),
        ));
    }

    let connection = request
        .headers()
        .get("connection")
        .ok_or(UpgradeError::MissingUpgradeHeader)?;
    let mentions_upgrade = connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !mentions_upgrade {
        return Err(UpgradeError::InvalidUpgradeHeader(connection.to_owned()));
    }

    let upgrade = request
        .headers()
        .get("upgrade")
        .ok_or(UpgradeError::MissingUpgradeHeader)?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(UpgradeError::InvalidUpgradeHeader(upgrade.to_owned()));
    }

    let key = request
        .headers()
        .get("sec-websocket-key")
        .ok_or(UpgradeError::MissingKeyHeader)?;
    if !is_valid_key(key) {
        return Err(UpgradeError::InvalidKeyHeader(key.to_owned()));
    }

    let version = request
        .headers()
        .get("sec-websocket-version")
        .ok_or(UpgradeError::MissingVersionHeader)?;
    if !SUPPORTED_VERSIONS.contains(&version.trim()) {
        return Err(UpgradeError::UnsupportedVersionHeader(version.to_owned()));
    }

    let protocol = request
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|offered| offered.split(',').next())
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty());

    Ok(Handshake {
        accept: accept_key(key),
        protocol,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn upgrade_request(extra: &str) -> Request {
        let raw = format!(
            "GET /chat HTTP/1.1\r\n\
             Host: example.com\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             {extra}\r\n"
        );
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        request
    }

    fn request_from(raw: &str) -> Request {
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        request
    }

    #[test]
    fn rfc_accept_key_vector() {
        assert_eq!(accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn negotiate_happy_path() {
        let handshake = negotiate(&upgrade_request("")).unwrap();
        assert_eq!(handshake.accept(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(handshake.protocol(), None);
    }

    #[test]
    fn valid_sample_key_passes_and_short_key_fails() {
        assert!(is_valid_key(SAMPLE_KEY));
        let request = request_from(
            "GET / HTTP/1.1\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Key: short\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
        );
        assert_eq!(
            negotiate(&request),
            Err(UpgradeError::InvalidKeyHeader("short".into()))
        );
    }

    #[test]
    fn non_get_method_rejected() {
        let request = request_from(
            "POST /chat HTTP/1.1\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\r\n",
        );
        assert_eq!(
            negotiate(&request),
            Err(UpgradeError::NonGetMethod("POST".into()))
        );
    }

    #[test]
    fn missing_connection_header_rejected() {
        let request = request_from(
            "GET /chat HTTP/1.1\r\n\
             Upgrade: websocket\r\n\r\n",
        );
        assert_eq!(negotiate(&request), Err(UpgradeError::MissingUpgradeHeader));
    }

    #[test]
    fn keep_alive_connection_header_rejected() {
        let request = request_from(
            "GET /chat HTTP/1.1\r\n\
             Connection: keep-alive\r\n\
             Upgrade: websocket\r\n\r\n",
        );
        assert_eq!(
            negotiate(&request),
            Err(UpgradeError::InvalidUpgradeHeader("keep-alive".into()))
        );
    }

    #[test]
    fn connection_header_token_list_accepted() {
        let request = request_from(&format!(
            "GET /chat HTTP/1.1\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        ));
        assert!(negotiate(&request).is_ok());
    }

    #[test]
    fn wrong_upgrade_target_rejected() {
        let request = request_from(
            "GET /chat HTTP/1.1\r\n\
             Connection: Upgrade\r\n\
             Upgrade: h2c\r\n\r\n",
        );
        assert_eq!(
            negotiate(&request),
            Err(UpgradeError::InvalidUpgradeHeader("h2c".into()))
        );
    }

    #[test]
    fn missing_key_rejected() {
        let request = request_from(
            "GET /chat HTTP/1.1\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
        );
        assert_eq!(negotiate(&request), Err(UpgradeError::MissingKeyHeader));
    }

    #[test]
    fn version_8_supported_version_7_rejected() {
        let request = request_from(&format!(
            "GET /chat HTTP/1.1\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
             Sec-WebSocket-Version: 8\r\n\r\n"
        ));
        assert!(negotiate(&request).is_ok());

        let request = request_from(&format!(
            "GET /chat HTTP/1.1\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
             Sec-WebSocket-Version: 7\r\n\r\n"
        ));
        assert_eq!(
            negotiate(&request),
            Err(UpgradeError::UnsupportedVersionHeader("7".into()))
        );
    }

    #[test]
    fn missing_version_rejected() {
        let request = request_from(&format!(
            "GET /chat HTTP/1.1\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\r\n"
        ));
        assert_eq!(negotiate(&request), Err(UpgradeError::MissingVersionHeader));
    }

    #[test]
    fn first_offered_protocol_selected() {
        let handshake =
            negotiate(&upgrade_request("Sec-WebSocket-Protocol: chat, superchat\r\n")).unwrap();
        assert_eq!(handshake.protocol(), Some("chat"));
    }

    #[test]
    fn response_bytes_shape() {
        let handshake =
            negotiate(&upgrade_request("Sec-WebSocket-Protocol: chat\r\n")).unwrap();
        let text = String::from_utf8(handshake.response_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}

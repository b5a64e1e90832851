//! WebSocket support: message model, connection wrapper, handshake, frame
//! codec, and the shared connection registry.
//!
//! An upgraded connection is driven by three application callbacks bundled in
//! a [`WebSocketBody`]: `on_open` runs once after the handshake, `on_message`
//! runs per inbound message, and `on_close` runs exactly once when the
//! connection ends. `on_open`/`on_message` return a [`MessageSource`] — a
//! lazily pulled stream of [`Outbound`] items — and each returned source is
//! drained by its own independent send loop.

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::Stream;
use thiserror::Error;
use uuid::Uuid;

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod registry;

pub use connection::{ConnectionHandle, send_messages};
pub use handshake::{Handshake, UpgradeError, accept_key, negotiate};
pub use registry::SocketMap;

/// One application-level WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    /// Creates a text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Creates a binary message.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Close code and reason attached to a connection shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    /// Creates a close record with the given code and reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Normal closure (1000) with an empty reason.
    pub fn normal() -> Self {
        Self::new(close_code::NORMAL, "")
    }
}

/// RFC 6455 §7.4.1 close codes the toolkit emits or synthesizes.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Protocol error (bad frame sequence, reserved bits, bad opcode).
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Synthesized when a close frame carried no status code. Never sent on
    /// the wire.
    pub const NO_STATUS: u16 = 1005;
    /// Synthesized when the transport dropped without a close frame. Never
    /// sent on the wire.
    pub const ABNORMAL: u16 = 1006;
    /// Text message payload was not valid UTF-8.
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Message exceeded the maximum accepted size.
    pub const TOO_LARGE: u16 = 1009;
}

/// One item pulled from an outbound [`MessageSource`].
///
/// `Close` is the terminating sentinel: the send loop stops pulling and
/// closes the connection with the given code/reason (or a normal close when
/// `None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(Message),
    Close(Option<CloseInfo>),
}

impl Outbound {
    /// An outbound text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Message(Message::text(text))
    }

    /// An outbound binary message.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Message(Message::binary(data))
    }

    /// The close sentinel with an explicit code and reason.
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseInfo::new(code, reason)))
    }
}

/// A lazily pulled, possibly infinite stream of outbound items.
///
/// Sources are pulled one item at a time and never materialized as a whole;
/// a send loop that observes the connection leaving the `Open` state simply
/// stops pulling.
pub type MessageSource = Pin<Box<dyn Stream<Item = Outbound> + Send>>;

/// Boxes any outbound stream into a [`MessageSource`].
///
/// # Examples
///
/// ```
/// use futures_util::stream;
/// use strand::ws::{self, Outbound};
///
/// let source = ws::source(stream::iter([
///     Outbound::text("hello"),
///     Outbound::close(1000, "done"),
/// ]));
/// drop(source);
/// ```
pub fn source(stream: impl Stream<Item = Outbound> + Send + 'static) -> MessageSource {
    Box::pin(stream)
}

/// Lifecycle phase of a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Handshake in progress.
    Connecting,
    /// Handshake complete, messages may flow.
    Open,
    /// A close frame has been sent; waiting for the transport to finish.
    Closing,
    /// The transport is gone.
    Closed,
}

/// A failed attempt to deliver one outbound message.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection is no longer accepting messages.
    #[error("connection is closed")]
    Closed,

    /// The transport write failed.
    #[error("transport write failed: {0}")]
    Io(#[from] io::Error),
}

/// Callback invoked once after the handshake completes.
pub type OpenCallback = Box<dyn Fn(Uuid) -> MessageSource + Send + Sync>;

/// Callback invoked for every inbound message.
pub type MessageCallback = Box<dyn Fn(Message, Uuid) -> MessageSource + Send + Sync>;

/// Callback invoked exactly once when the connection ends.
pub type CloseCallback = Box<dyn FnOnce(CloseInfo, Uuid) + Send + Sync>;

/// Callback invoked when delivery of one message fails.
pub type SendErrorCallback = Arc<dyn Fn(&Message, &SendError, Uuid) + Send + Sync>;

/// The application side of an upgraded connection.
///
/// `on_message` is required; the rest are optional. When no `on_send_error`
/// is supplied, failures are logged with `tracing::warn!`.
///
/// # Examples
///
/// ```
/// use futures_util::stream;
/// use strand::ws::{self, Outbound, WebSocketBody};
///
/// let body = WebSocketBody::new(|message, _id| {
///     // Echo every message straight back.
///     ws::source(stream::iter([Outbound::Message(message)]))
/// })
/// .on_close(|info, _id| {
///     println!("closed: {} {}", info.code, info.reason);
/// });
/// drop(body);
/// ```
pub struct WebSocketBody {
    pub(crate) on_open: Option<OpenCallback>,
    pub(crate) on_message: MessageCallback,
    pub(crate) on_close: Option<CloseCallback>,
    pub(crate) on_send_error: Option<SendErrorCallback>,
}

impl WebSocketBody {
    /// Creates a body from the required inbound-message callback.
    pub fn new<F>(on_message: F) -> Self
    where
        F: Fn(Message, Uuid) -> MessageSource + Send + Sync + 'static,
    {
        Self {
            on_open: None,
            on_message: Box::new(on_message),
            on_close: None,
            on_send_error: None,
        }
    }

    /// Sets the callback run once after the upgrade completes.
    #[must_use]
    pub fn on_open<F>(mut self, on_open: F) -> Self
    where
        F: Fn(Uuid) -> MessageSource + Send + Sync + 'static,
    {
        self.on_open = Some(Box::new(on_open));
        self
    }

    /// Sets the callback run exactly once when the connection ends.
    #[must_use]
    pub fn on_close<F>(mut self, on_close: F) -> Self
    where
        F: FnOnce(CloseInfo, Uuid) + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(on_close));
        self
    }

    /// Overrides the default send-failure callback.
    #[must_use]
    pub fn on_send_error<F>(mut self, on_send_error: F) -> Self
    where
        F: Fn(&Message, &SendError, Uuid) + Send + Sync + 'static,
    {
        self.on_send_error = Some(Arc::new(on_send_error));
        self
    }
}

impl std::fmt::Debug for WebSocketBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketBody")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_send_error", &self.on_send_error.is_some())
            .finish()
    }
}

/// Default send-failure behavior: a structured warning.
pub(crate) fn default_send_error_callback() -> SendErrorCallback {
    Arc::new(|message, error, connection_id| {
        tracing::warn!(
            connection = %connection_id,
            bytes = message.len(),
            error = %error,
            "failed to send WebSocket message"
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_constructors() {
        assert_eq!(
            Outbound::text("hi"),
            Outbound::Message(Message::Text("hi".into()))
        );
        assert_eq!(
            Outbound::close(1000, "bye"),
            Outbound::Close(Some(CloseInfo::new(1000, "bye")))
        );
    }

    #[test]
    fn message_len() {
        assert_eq!(Message::text("abc").len(), 3);
        assert!(Message::binary(Bytes::new()).is_empty());
    }

    #[test]
    fn body_builder_records_callbacks() {
        let body = WebSocketBody::new(|_, _| source(futures_util::stream::empty()))
            .on_open(|_| source(futures_util::stream::empty()))
            .on_close(|_, _| {});
        assert!(body.on_open.is_some());
        assert!(body.on_close.is_some());
        assert!(body.on_send_error.is_none());
    }
}

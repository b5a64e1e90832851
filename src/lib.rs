//! # strand
//!
//! A composable async HTTP/WebSocket request-handling toolkit.
//!
//! strand is not a server: the host owns the accept loop and hands each
//! parsed request plus its transport to a [`RequestListener`]. The toolkit
//! provides the rest of the request lifecycle — a handler-composition
//! pipeline with reverse-order cleanup, a response dispatcher over the raw
//! transport, and RFC 6455 WebSocket upgrades with per-connection message
//! loops and a shared connection registry.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::convert::Infallible;
//! use strand::{RequestListener, Response, handler::{Step, handler}};
//!
//! # async fn serve(request: strand::Request, stream: tokio::net::TcpStream) {
//! let listener = RequestListener::new(handler::<Infallible, _, _>(
//!     |_request, state| async move {
//!         Ok(Step::next(state.with(Response::text("Hello, World!"))))
//!     },
//! ));
//! listener.respond(request, stream).await;
//! # }
//! ```

pub mod dispatch;
pub mod handler;
pub mod http;
pub mod ws;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use dispatch::{ExceptionListener, Fault, RequestListener};
pub use http::{
    Body, Cookie, Headers, Method, RegularResponse, Request, Response, SameSite, StatusCode,
    WebSocketResponse,
};
pub use ws::{Message, SocketMap, WebSocketBody};

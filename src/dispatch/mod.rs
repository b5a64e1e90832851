//! The request listener: runs the handler chain, dispatches the resulting
//! [`Response`] onto the transport, and guarantees that a response is always
//! attempted, cleanup always runs, and nothing escapes to the caller.
//!
//! The per-request lifecycle is `handler chain → dispatch → cleanup`. Typed
//! handler errors, panics anywhere in the lifecycle, transport write
//! failures, and body-stream failures are all caught here, forwarded to an
//! injectable exception listener, and answered — when still possible — with
//! a fixed default `500` response. [`RequestListener::respond`] never panics
//! outward and never returns an error: one request's crash must not take
//! down the host process or sibling connections.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::handler::{Handler, State};
use crate::http::{Body, RegularResponse, Request, Response, StatusCode, WebSocketResponse};
use crate::ws::{SocketMap, UpgradeError, connection, handshake};

/// A fault caught by the request boundary.
///
/// Faults are reported to the exception listener; they never propagate to
/// the caller of [`RequestListener::respond`].
#[derive(Debug, Error)]
pub enum Fault {
    /// The handler chain returned its typed error.
    #[error("handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The handler chain, dispatch, or a cleanup panicked.
    #[error("panic: {0}")]
    Panic(String),

    /// The handler chain completed without storing a [`Response`] in its
    /// final state.
    #[error("handler chain produced no response")]
    MissingResponse,

    /// Writing the response head or body to the transport failed.
    #[error("response write failed: {0}")]
    Write(#[source] io::Error),

    /// A streamed body's source failed mid-stream.
    #[error("body stream failed: {0}")]
    Stream(#[source] io::Error),

    /// The combined cleanup reported an error.
    #[error("cleanup failed: {0}")]
    Cleanup(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Observer for every caught fault: `(fault, request, response-if-known)`.
pub type ExceptionListener = Arc<dyn Fn(&Fault, &Request, Option<&Response>) + Send + Sync>;

fn default_exception_listener() -> ExceptionListener {
    Arc::new(|fault, request, _response| {
        error!(
            method = %request.method(),
            path = %request.path(),
            fault = %fault,
            "request fault"
        );
    })
}

/// The top-level per-request entry point of the toolkit.
///
/// Owns the root handler, the exception listener, and the shared
/// [`SocketMap`] that upgraded connections are registered in.
///
/// # Examples
///
/// ```no_run
/// use std::convert::Infallible;
/// use strand::dispatch::RequestListener;
/// use strand::handler::{Step, handler};
/// use strand::http::{Request, Response};
///
/// # async fn serve(request: Request, stream: tokio::net::TcpStream) {
/// let listener = RequestListener::new(handler::<Infallible, _, _>(|_request, state| async move {
///     Ok(Step::next(state.with(Response::text("hello"))))
/// }));
/// listener.respond(request, stream).await;
/// # }
/// ```
pub struct RequestListener<E> {
    handler: Handler<E>,
    exception_listener: ExceptionListener,
    sockets: SocketMap,
}

impl<E> RequestListener<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Creates a listener around the given root handler, with the default
    /// (logging) exception listener and a fresh connection registry.
    pub fn new(handler: Handler<E>) -> Self {
        Self {
            handler,
            exception_listener: default_exception_listener(),
            sockets: SocketMap::new(),
        }
    }

    /// Replaces the exception listener.
    #[must_use]
    pub fn with_exception_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&Fault, &Request, Option<&Response>) + Send + Sync + 'static,
    {
        self.exception_listener = Arc::new(listener);
        self
    }

    /// Uses an existing registry instead of a fresh one, so handlers built
    /// before this listener can hold a clone for broadcasting.
    #[must_use]
    pub fn with_sockets(mut self, sockets: SocketMap) -> Self {
        self.sockets = sockets;
        self
    }

    /// The connection registry shared with upgraded connections.
    pub fn sockets(&self) -> &SocketMap {
        &self.sockets
    }

    /// Runs the whole lifecycle for one request on the given transport.
    ///
    /// Always resolves; every fault is routed through the exception listener
    /// and answered with the default error response when the transport still
    /// allows it. For WebSocket upgrades this future runs until the
    /// connection has fully closed.
    pub async fn respond<S>(&self, request: Request, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let request = Arc::new(request);
        let mut stream = stream;

        debug!(method = %request.method(), path = %request.path(), "dispatching request");

        let outcome = AssertUnwindSafe((self.handler)(Arc::clone(&request), State::new()))
            .catch_unwind()
            .await;

        let (mut state, cleanup) = match outcome {
            Ok(Ok(step)) => (step.state, step.cleanup),
            Ok(Err(handler_error)) => {
                self.notify(&Fault::Handler(Box::new(handler_error)), &request, None);
                let _ = write_error_response(&mut stream).await;
                return;
            }
            Err(payload) => {
                self.notify(&Fault::Panic(panic_message(payload.as_ref())), &request, None);
                let _ = write_error_response(&mut stream).await;
                return;
            }
        };

        let mut response = match state.remove::<Response>() {
            Some(response) => response,
            None => {
                // Same safe fallback as an exhausted chain: answer with the
                // default error response, but keep the cleanup contract.
                self.notify(&Fault::MissingResponse, &request, None);
                Response::Regular(default_error_response())
            }
        };

        let dispatched = match &mut response {
            Response::Regular(regular) => {
                AssertUnwindSafe(dispatch_regular(regular, &mut stream))
                    .catch_unwind()
                    .await
            }
            Response::WebSocket(upgrade) => {
                AssertUnwindSafe(self.dispatch_websocket(&request, upgrade, stream))
                    .catch_unwind()
                    .await
            }
        };
        match dispatched {
            Ok(Ok(())) => {}
            Ok(Err(fault)) => self.notify(&fault, &request, Some(&response)),
            Err(payload) => self.notify(
                &Fault::Panic(panic_message(payload.as_ref())),
                &request,
                Some(&response),
            ),
        }

        if let Some(cleanup) = cleanup {
            match AssertUnwindSafe(cleanup(Some(&response))).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(cleanup_error)) => self.notify(
                    &Fault::Cleanup(Box::new(cleanup_error)),
                    &request,
                    Some(&response),
                ),
                Err(payload) => self.notify(
                    &Fault::Panic(panic_message(payload.as_ref())),
                    &request,
                    Some(&response),
                ),
            }
        }
    }

    // Performs the upgrade handshake and runs the connection to completion.
    // Negotiation failures are expected, typed outcomes: they are answered
    // with an HTTP error before any handshake byte is written, and are not
    // reported as faults.
    async fn dispatch_websocket<S>(
        &self,
        request: &Request,
        upgrade: &mut WebSocketResponse,
        mut stream: S,
    ) -> Result<(), Fault>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let handshake = match handshake::negotiate(request) {
            Ok(handshake) => handshake,
            Err(negotiation_error) => {
                debug!(error = %negotiation_error, "WebSocket negotiation failed");
                let mut reply = negotiation_failure_response(&negotiation_error);
                return dispatch_regular(&mut reply, &mut stream).await;
            }
        };

        stream
            .write_all(&handshake.response_bytes())
            .await
            .map_err(Fault::Write)?;
        stream.flush().await.map_err(Fault::Write)?;

        let Some(body) = upgrade.take_body() else {
            // The body is consumed exactly once per response; a missing body
            // means this response was already dispatched.
            return Err(Fault::MissingResponse);
        };
        connection::run_session(stream, body, self.sockets.clone()).await;
        Ok(())
    }

    fn notify(&self, fault: &Fault, request: &Request, response: Option<&Response>) {
        (self.exception_listener)(fault, request, response);
    }
}

// Writes a regular response: materialized head first, then the body variant.
async fn dispatch_regular<S>(response: &mut RegularResponse, stream: &mut S) -> Result<(), Fault>
where
    S: AsyncWrite + Unpin,
{
    response.apply_body_defaults();
    let chunked = response
        .headers()
        .get("transfer-encoding")
        .is_some_and(|value| value.eq_ignore_ascii_case("chunked"));

    let head = response.head_bytes();
    stream.write_all(&head).await.map_err(Fault::Write)?;

    match response.take_body() {
        Body::Empty => {}
        Body::Text(text) => {
            stream.write_all(text.as_bytes()).await.map_err(Fault::Write)?;
        }
        Body::Binary(data) => {
            stream.write_all(&data).await.map_err(Fault::Write)?;
        }
        Body::Stream(mut chunks) => {
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(data) => {
                        // An empty chunk would read as the chunked terminator.
                        if data.is_empty() {
                            continue;
                        }
                        if chunked {
                            let size = format!("{:X}\r\n", data.len());
                            stream.write_all(size.as_bytes()).await.map_err(Fault::Write)?;
                            stream.write_all(&data).await.map_err(Fault::Write)?;
                            stream.write_all(b"\r\n").await.map_err(Fault::Write)?;
                        } else {
                            stream.write_all(&data).await.map_err(Fault::Write)?;
                        }
                    }
                    Err(source_error) => {
                        // End the response instead of leaving it hanging; the
                        // fault goes to the exception listener, not the caller.
                        if chunked {
                            let _ = stream.write_all(b"0\r\n\r\n").await;
                        }
                        let _ = stream.flush().await;
                        return Err(Fault::Stream(source_error));
                    }
                }
            }
            if chunked {
                stream.write_all(b"0\r\n\r\n").await.map_err(Fault::Write)?;
            }
        }
    }

    stream.flush().await.map_err(Fault::Write)
}

// The fixed default error response written for any unhandled fault.
fn default_error_response() -> RegularResponse {
    RegularResponse::new(StatusCode::InternalServerError).text("Internal Server Error")
}

async fn write_error_response<S>(stream: &mut S) -> Result<(), Fault>
where
    S: AsyncWrite + Unpin,
{
    dispatch_regular(&mut default_error_response(), stream).await
}

// Translates a typed negotiation failure into the HTTP reply written before
// any upgrade is attempted: version problems advertise the supported version
// with 426, everything else is a plain 400.
fn negotiation_failure_response(negotiation_error: &UpgradeError) -> RegularResponse {
    match negotiation_error {
        UpgradeError::MissingVersionHeader | UpgradeError::UnsupportedVersionHeader(_) => {
            RegularResponse::new(StatusCode::UpgradeRequired)
                .header("Sec-WebSocket-Version", "13")
                .text(negotiation_error.to_string())
        }
        _ => RegularResponse::new(StatusCode::BadRequest).text(negotiation_error.to_string()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

//! A minimal host: accepts TCP connections, parses one request per
//! connection, and hands it to a `RequestListener`. `GET /` answers with
//! text; `GET /ws` upgrades to a WebSocket that echoes every message and
//! greets the connection on open.
//!
//! Try it with a browser console:
//!
//! ```text
//! cargo run --example echo_ws
//! ws = new WebSocket("ws://127.0.0.1:8080/ws")
//! ws.onmessage = (e) => console.log(e.data)
//! ws.send("hello")
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::stream;
use strand::handler::{Step, handler};
use strand::http::request::RequestError;
use strand::ws::{self, Outbound};
use strand::{RequestListener, Request, Response, WebSocketBody};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,strand=debug".into()),
        )
        .init();

    let sockets = ws::SocketMap::new();
    let broadcast_sockets = sockets.clone();

    let root = handler::<Infallible, _, _>(move |request, state| {
        let peers = broadcast_sockets.clone();
        async move {
            let response = match request.path() {
                "/ws" => Response::websocket(
                    WebSocketBody::new(|message, _id| {
                        ws::source(stream::iter([Outbound::Message(message)]))
                    })
                    .on_open(move |id| {
                        info!(connection = %id, peers = peers.len(), "peer joined");
                        ws::source(stream::iter([Outbound::text("welcome")]))
                    })
                    .on_close(|info, id| {
                        info!(connection = %id, code = info.code, "peer left");
                    }),
                ),
                "/" => Response::text("echo_ws: connect a WebSocket to /ws\n"),
                _ => Response::empty(strand::StatusCode::NotFound),
            };
            Ok(Step::next(state.with(response)))
        }
    });

    let listener = Arc::new(RequestListener::new(root).with_sockets(sockets));

    let tcp = TcpListener::bind("127.0.0.1:8080").await?;
    info!(address = %tcp.local_addr()?, "echo_ws listening");

    loop {
        let (stream, peer_addr) = match tcp.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            match read_request(stream).await {
                Ok((request, stream)) => listener.respond(request, stream).await,
                Err(e) => warn!(peer = %peer_addr, error = %e, "bad request"),
            }
        });
    }
}

/// Buffers one request head (plus any declared body) off the stream.
async fn read_request(
    mut stream: tokio::net::TcpStream,
) -> Result<(Request, tokio::net::TcpStream), RequestError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if stream.read_buf(&mut buf).await.unwrap_or(0) == 0 {
            return Err(RequestError::Incomplete);
        }
        match Request::parse(&buf) {
            Ok((request, body_offset)) => {
                let needed = body_offset + request.content_length().unwrap_or(0);
                if buf.len() < needed {
                    continue;
                }
                return Ok((request, stream));
            }
            Err(RequestError::Incomplete) => continue,
            Err(e) => return Err(e),
        }
    }
}

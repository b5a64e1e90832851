//! The live connection wrapper: a writer task owning the transport's write
//! half, cloneable handles for sending, the per-source outbound send loop,
//! and the session driver that reads frames until the connection closes.
//!
//! Concurrency model: any number of send loops (one from `on_open`, one per
//! `on_message` invocation) share one bounded command channel into the
//! writer task. Within one loop, frames are enqueued in pull order; the loop
//! does not await each delivery individually but joins all in-flight sends
//! before finishing. Ordering across loops is unspecified.

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use super::frame::{self, Frame, FrameDecoder, FrameError, Opcode};
use super::registry::SocketMap;
use super::{
    CloseInfo, Message, MessageCallback, MessageSource, Outbound, ReadyState, SendError,
    SendErrorCallback, WebSocketBody, close_code, default_send_error_callback,
};

/// Bound on queued outbound commands; enqueueing past this applies
/// backpressure to send loops.
const COMMAND_BUFFER: usize = 32;

/// Initial read/encode buffer capacity.
const BUFFER_CAPACITY: usize = 4096;

/// A command for the writer task.
pub(crate) enum Command {
    /// Send a data frame and acknowledge the write attempt.
    Message(Message, oneshot::Sender<Result<(), SendError>>),
    /// Send a close frame (normal closure when `None`) and acknowledge.
    Close(Option<CloseInfo>, oneshot::Sender<Result<(), SendError>>),
    /// Answer a ping. Fire-and-forget.
    Pong(Bytes),
}

/// A cloneable handle to one live WebSocket connection.
///
/// Handles are what the registry stores and what send loops drive; they stay
/// valid after the connection closes, at which point sends fail with
/// [`SendError::Closed`].
#[derive(Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ReadyState>,
}

impl ConnectionHandle {
    /// The connection identifier, assigned at upgrade time.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The connection's current lifecycle phase.
    pub fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    /// Sends one message, resolving once the transport write was attempted.
    ///
    /// # Errors
    ///
    /// [`SendError::Closed`] when the connection is not open;
    /// [`SendError::Io`] when the transport write failed.
    pub async fn send(&self, message: Message) -> Result<(), SendError> {
        let ack = self.enqueue(message).await?;
        match ack.await {
            Ok(result) => result,
            Err(_) => Err(SendError::Closed),
        }
    }

    /// Closes the connection, resolving once the close sequence has fully
    /// completed (the transport reached [`ReadyState::Closed`]).
    ///
    /// `None` closes with a normal-closure code and empty reason.
    pub async fn close(&self, info: Option<CloseInfo>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Close(info, ack_tx))
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ReadyState::Closed).await;
    }

    // Reserves a command slot (ordered, applies backpressure) and enqueues
    // the message, returning the delivery acknowledgment to await later.
    pub(crate) async fn enqueue(
        &self,
        message: Message,
    ) -> Result<oneshot::Receiver<Result<(), SendError>>, SendError> {
        if self.ready_state() != ReadyState::Open {
            return Err(SendError::Closed);
        }
        let permit = self
            .commands
            .reserve()
            .await
            .map_err(|_| SendError::Closed)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        permit.send(Command::Message(message, ack_tx));
        Ok(ack_rx)
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<ReadyState> {
        self.state.clone()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

/// Drives one outbound [`MessageSource`] over a connection.
///
/// Items are pulled one at a time. Before each pull the loop checks that the
/// connection is still open — and races the pull against the ready-state
/// watch, so a source that stays pending cannot outlive the connection.
/// Messages are enqueued in pull order without awaiting each delivery; all
/// in-flight deliveries are joined before the loop returns. A delivery
/// failure is reported through `on_send_error` and does not stop the loop.
/// The [`Outbound::Close`] sentinel stops pulling and closes the connection
/// with its code/reason.
pub async fn send_messages(
    handle: &ConnectionHandle,
    mut source: MessageSource,
    on_send_error: &SendErrorCallback,
) {
    let mut state = handle.state_watch();
    let mut in_flight = FuturesUnordered::new();
    let mut close_directive: Option<Option<CloseInfo>> = None;

    loop {
        if handle.ready_state() != ReadyState::Open {
            break;
        }
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                // Loop back around; the top-of-loop check decides.
            }
            item = source.next() => match item {
                None => break,
                Some(Outbound::Close(info)) => {
                    close_directive = Some(info);
                    break;
                }
                Some(Outbound::Message(message)) => {
                    match handle.enqueue(message.clone()).await {
                        Ok(ack) => in_flight.push(async move {
                            match ack.await {
                                Ok(result) => (message, result),
                                Err(_) => (message, Err(SendError::Closed)),
                            }
                        }),
                        Err(error) => on_send_error(&message, &error, handle.id()),
                    }
                }
            },
            Some((message, result)) = in_flight.next(), if !in_flight.is_empty() => {
                if let Err(error) = result {
                    on_send_error(&message, &error, handle.id());
                }
            }
        }
    }

    // Join every delivery already issued before returning.
    while let Some((message, result)) = in_flight.next().await {
        if let Err(error) = result {
            on_send_error(&message, &error, handle.id());
        }
    }

    if let Some(info) = close_directive {
        handle.close(info).await;
    }
}

// The writer task: sole owner of the transport's write half. Encodes and
// writes one frame per command; after a close frame has been written, data
// commands are refused. Exits when the connection reaches Closed or every
// command sender is gone.
pub(crate) async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut commands: mpsc::Receiver<Command>,
    state: Arc<watch::Sender<ReadyState>>,
) {
    let mut closing = false;
    let mut buf = BytesMut::with_capacity(BUFFER_CAPACITY);
    let mut state_rx = state.subscribe();

    loop {
        let command = tokio::select! {
            _ = state_rx.wait_for(|s| *s == ReadyState::Closed) => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::Message(message, ack) => {
                if closing {
                    let _ = ack.send(Err(SendError::Closed));
                    continue;
                }
                let frame = match message {
                    Message::Text(text) => Frame::text(Bytes::from(text.into_bytes())),
                    Message::Binary(data) => Frame::binary(data),
                };
                let result = write_frame(&mut writer, &frame, &mut buf).await;
                let _ = ack.send(result.map_err(SendError::Io));
            }
            Command::Pong(payload) => {
                if !closing {
                    let _ = write_frame(&mut writer, &Frame::pong(payload), &mut buf).await;
                }
            }
            Command::Close(info, ack) => {
                if !closing {
                    closing = true;
                    state.send_if_modified(|s| {
                        if *s == ReadyState::Open {
                            *s = ReadyState::Closing;
                            true
                        } else {
                            false
                        }
                    });
                    let info = info.unwrap_or_else(CloseInfo::normal);
                    let _ = write_frame(&mut writer, &Frame::close(&info), &mut buf).await;
                }
                let _ = ack.send(Ok(()));
            }
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    buf: &mut BytesMut,
) -> io::Result<()> {
    buf.clear();
    frame::encode(frame, buf);
    writer.write_all(buf).await?;
    writer.flush().await
}

/// Runs one upgraded connection to completion: spawns the writer task and
/// the `on_open` send loop, reads inbound frames (spawning one independent
/// send loop per `on_message` invocation), and runs the close sequence.
///
/// The close sequence deregisters the connection first, marks it `Closed`
/// (which stops every send loop at its next pull), joins all loops and the
/// writer, and only then invokes `on_close` — the connection's last
/// observable action.
pub(crate) async fn run_session<S>(stream: S, body: WebSocketBody, sockets: SocketMap)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (state_tx, state_rx) = watch::channel(ReadyState::Open);
    let state_tx = Arc::new(state_tx);
    let id = Uuid::new_v4();
    let handle = ConnectionHandle {
        id,
        commands: command_tx.clone(),
        state: state_rx,
    };

    sockets.insert(handle.clone());
    debug!(connection = %id, "WebSocket connection open");

    let writer_task = tokio::spawn(write_loop(writer, command_rx, Arc::clone(&state_tx)));

    let WebSocketBody {
        on_open,
        on_message,
        on_close,
        on_send_error,
    } = body;
    let on_send_error = on_send_error.unwrap_or_else(default_send_error_callback);

    let mut loops = JoinSet::new();
    if let Some(on_open) = on_open {
        let source = on_open(id);
        let handle = handle.clone();
        let callback = Arc::clone(&on_send_error);
        loops.spawn(async move { send_messages(&handle, source, &callback).await });
    }

    let close_info = read_loop(
        &mut reader,
        &command_tx,
        &on_message,
        &handle,
        &on_send_error,
        &mut loops,
        id,
    )
    .await;

    // Deregister before anything else, so a broadcast issued from within
    // on_close never targets this connection.
    sockets.remove(id);
    state_tx.send_replace(ReadyState::Closed);
    drop(command_tx);
    drop(handle);
    while loops.join_next().await.is_some() {}
    let _ = writer_task.await;

    debug!(connection = %id, code = close_info.code, "WebSocket connection closed");
    if let Some(on_close) = on_close {
        on_close(close_info, id);
    }
}

// What to do with one decoded frame.
enum FrameAction {
    None,
    Message(Message),
    Ping(Bytes),
    Close(CloseInfo),
    Violation(CloseInfo),
}

#[allow(clippy::too_many_arguments)]
async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    commands: &mpsc::Sender<Command>,
    on_message: &MessageCallback,
    handle: &ConnectionHandle,
    on_send_error: &SendErrorCallback,
    loops: &mut JoinSet<()>,
    id: Uuid,
) -> CloseInfo {
    let decoder = FrameDecoder::server();
    let mut buf = BytesMut::with_capacity(BUFFER_CAPACITY);
    let mut fragments: Option<(Opcode, BytesMut)> = None;

    loop {
        // Drain every complete frame already buffered.
        loop {
            let frame = match decoder.decode(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    warn!(connection = %id, error = %error, "WebSocket protocol violation");
                    let info = close_info_for(&error);
                    send_close(commands, info.clone()).await;
                    return info;
                }
            };

            match handle_frame(frame, &mut fragments) {
                FrameAction::None => {}
                FrameAction::Ping(payload) => {
                    let _ = commands.send(Command::Pong(payload)).await;
                }
                FrameAction::Message(message) => {
                    let source = on_message(message, id);
                    let handle = handle.clone();
                    let callback = Arc::clone(on_send_error);
                    loops.spawn(async move { send_messages(&handle, source, &callback).await });
                }
                FrameAction::Close(info) => {
                    // Echo the peer's close frame, then stop reading.
                    send_close(commands, info.clone()).await;
                    return info;
                }
                FrameAction::Violation(info) => {
                    warn!(connection = %id, code = info.code, reason = %info.reason,
                        "WebSocket protocol violation");
                    send_close(commands, info.clone()).await;
                    return info;
                }
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return CloseInfo::new(close_code::ABNORMAL, ""),
            Ok(_) => {}
        }
    }
}

async fn send_close(commands: &mpsc::Sender<Command>, info: CloseInfo) {
    let (ack_tx, ack_rx) = oneshot::channel();
    if commands
        .send(Command::Close(Some(info), ack_tx))
        .await
        .is_ok()
    {
        let _ = ack_rx.await;
    }
}

fn handle_frame(frame: Frame, fragments: &mut Option<(Opcode, BytesMut)>) -> FrameAction {
    match frame.opcode {
        Opcode::Ping => FrameAction::Ping(frame.payload),
        Opcode::Pong => FrameAction::None,
        Opcode::Close => FrameAction::Close(frame::parse_close_payload(&frame.payload)),
        Opcode::Text | Opcode::Binary => {
            if fragments.is_some() {
                return FrameAction::Violation(CloseInfo::new(
                    close_code::PROTOCOL_ERROR,
                    "data frame interleaved with fragmented message",
                ));
            }
            if frame.fin {
                complete_message(frame.opcode, frame.payload)
            } else {
                let mut partial = BytesMut::with_capacity(frame.payload.len() * 2);
                partial.extend_from_slice(&frame.payload);
                *fragments = Some((frame.opcode, partial));
                FrameAction::None
            }
        }
        Opcode::Continuation => match fragments.take() {
            None => FrameAction::Violation(CloseInfo::new(
                close_code::PROTOCOL_ERROR,
                "continuation frame without a message start",
            )),
            Some((opcode, mut partial)) => {
                partial.extend_from_slice(&frame.payload);
                if frame.fin {
                    complete_message(opcode, partial.freeze())
                } else {
                    *fragments = Some((opcode, partial));
                    FrameAction::None
                }
            }
        },
    }
}

fn complete_message(opcode: Opcode, payload: Bytes) -> FrameAction {
    match opcode {
        Opcode::Text => match String::from_utf8(payload.to_vec()) {
            Ok(text) => FrameAction::Message(Message::Text(text)),
            Err(_) => FrameAction::Violation(CloseInfo::new(
                close_code::INVALID_PAYLOAD,
                "text message is not valid UTF-8",
            )),
        },
        _ => FrameAction::Message(Message::Binary(payload)),
    }
}

fn close_info_for(error: &FrameError) -> CloseInfo {
    match error {
        FrameError::PayloadTooLarge { .. } | FrameError::ControlFrameTooLarge(_) => {
            CloseInfo::new(close_code::TOO_LARGE, "message too large")
        }
        _ => CloseInfo::new(close_code::PROTOCOL_ERROR, "protocol error"),
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use futures_util::stream;

    use super::test_support::loopback_handle;
    use super::*;
    use crate::ws::source;

    fn quiet_send_errors() -> SendErrorCallback {
        Arc::new(|_, _, _| {})
    }

    #[tokio::test]
    async fn send_loop_delivers_in_pull_order_and_closes_on_sentinel() {
        let (handle, mut rig) = loopback_handle(ReadyState::Open);
        rig.ack_all();

        let outbound = source(stream::iter([
            Outbound::text("a"),
            Outbound::text("b"),
            Outbound::close(close_code::NORMAL, "bye"),
        ]));
        send_messages(&handle, outbound, &quiet_send_errors()).await;

        assert_eq!(
            rig.sent().await,
            vec![Message::text("a"), Message::text("b")]
        );
        assert_eq!(handle.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn send_loop_without_sentinel_leaves_connection_open() {
        let (handle, mut rig) = loopback_handle(ReadyState::Open);
        rig.ack_all();

        send_messages(
            &handle,
            source(stream::iter([Outbound::text("only")])),
            &quiet_send_errors(),
        )
        .await;

        assert_eq!(rig.sent().await, vec![Message::text("only")]);
        assert_eq!(handle.ready_state(), ReadyState::Open);
    }

    #[tokio::test]
    async fn send_loop_stops_pulling_when_connection_closes() {
        let (handle, mut rig) = loopback_handle(ReadyState::Open);
        rig.ack_all();

        // Three items, but the second pull never resolves; the loop must
        // notice the close and return without waiting for it.
        let outbound = source(stream::iter([Outbound::text("one")]).chain(stream::pending()));

        let loop_handle = {
            let handle = handle.clone();
            let callback = quiet_send_errors();
            tokio::spawn(async move {
                send_messages(&handle, outbound, &callback).await;
            })
        };

        // Wait for the first frame to be delivered, then close.
        for _ in 0..200 {
            if !rig.sent().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        rig.set_state(ReadyState::Closed);

        loop_handle.await.unwrap();
        assert_eq!(rig.sent().await, vec![Message::text("one")]);
    }

    #[tokio::test]
    async fn send_failures_reach_callback_and_do_not_stop_loop() {
        let (handle, mut rig) = loopback_handle(ReadyState::Open);
        rig.fail_all();

        let failures: Arc<Mutex<Vec<Message>>> = Arc::default();
        let seen = Arc::clone(&failures);
        let callback: SendErrorCallback = Arc::new(move |message, _error, _id| {
            seen.lock().unwrap().push(message.clone());
        });

        send_messages(
            &handle,
            source(stream::iter([Outbound::text("x"), Outbound::text("y")])),
            &callback,
        )
        .await;

        let mut failed: Vec<String> = failures
            .lock()
            .unwrap()
            .iter()
            .map(|m| match m {
                Message::Text(text) => text.clone(),
                Message::Binary(_) => String::new(),
            })
            .collect();
        failed.sort();
        assert_eq!(failed, vec!["x".to_string(), "y".to_string()]);
    }

    #[tokio::test]
    async fn close_resolves_once_state_is_closed() {
        let (handle, mut rig) = loopback_handle(ReadyState::Open);
        rig.ack_all();
        handle.close(Some(CloseInfo::new(close_code::NORMAL, "done"))).await;
        assert_eq!(handle.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn send_on_closed_connection_fails() {
        let (handle, _rig) = loopback_handle(ReadyState::Closed);
        let error = handle.send(Message::text("nope")).await.unwrap_err();
        assert!(matches!(error, SendError::Closed));
    }

    #[tokio::test]
    async fn writer_encodes_frames_and_refuses_after_close() {
        let (near, far) = tokio::io::duplex(BUFFER_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, _state_rx) = watch::channel(ReadyState::Open);
        let state_tx = Arc::new(state_tx);
        let writer = tokio::spawn(write_loop(near, command_rx, Arc::clone(&state_tx)));

        let (ack_tx, ack_rx) = oneshot::channel();
        assert!(
            command_tx
                .send(Command::Message(Message::text("hi"), ack_tx))
                .await
                .is_ok()
        );
        ack_rx.await.unwrap().unwrap();

        let (ack_tx, ack_rx) = oneshot::channel();
        assert!(
            command_tx
                .send(Command::Close(
                    Some(CloseInfo::new(close_code::NORMAL, "bye")),
                    ack_tx,
                ))
                .await
                .is_ok()
        );
        ack_rx.await.unwrap().unwrap();

        // A send after the close frame is refused.
        let (ack_tx, ack_rx) = oneshot::channel();
        assert!(
            command_tx
                .send(Command::Message(Message::text("late"), ack_tx))
                .await
                .is_ok()
        );
        assert!(matches!(ack_rx.await.unwrap(), Err(SendError::Closed)));

        // The wire carries exactly the text frame then the close frame.
        let decoder = FrameDecoder::client();
        let mut buf = BytesMut::new();
        let mut far = far;
        let text = loop {
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                break frame;
            }
            far.read_buf(&mut buf).await.unwrap();
        };
        assert_eq!(text.opcode, Opcode::Text);
        assert_eq!(text.payload.as_ref(), b"hi");

        let close = loop {
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                break frame;
            }
            far.read_buf(&mut buf).await.unwrap();
        };
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(
            frame::parse_close_payload(&close.payload),
            CloseInfo::new(close_code::NORMAL, "bye")
        );

        state_tx.send_replace(ReadyState::Closed);
        writer.await.unwrap();
    }

    #[test]
    fn fragmented_text_reassembles() {
        let mut fragments = None;
        let first = Frame {
            fin: false,
            opcode: Opcode::Text,
            mask: None,
            payload: Bytes::from_static(b"hel"),
        };
        assert!(matches!(
            handle_frame(first, &mut fragments),
            FrameAction::None
        ));

        let last = Frame {
            fin: true,
            opcode: Opcode::Continuation,
            mask: None,
            payload: Bytes::from_static(b"lo"),
        };
        match handle_frame(last, &mut fragments) {
            FrameAction::Message(Message::Text(text)) => assert_eq!(text, "hello"),
            other => panic!("expected text message, got {}", action_name(&other)),
        }
    }

    #[test]
    fn stray_continuation_is_a_violation() {
        let mut fragments = None;
        let stray = Frame {
            fin: true,
            opcode: Opcode::Continuation,
            mask: None,
            payload: Bytes::new(),
        };
        match handle_frame(stray, &mut fragments) {
            FrameAction::Violation(info) => assert_eq!(info.code, close_code::PROTOCOL_ERROR),
            other => panic!("expected violation, got {}", action_name(&other)),
        }
    }

    #[test]
    fn invalid_utf8_text_is_a_violation() {
        let mut fragments = None;
        let bad = Frame {
            fin: true,
            opcode: Opcode::Text,
            mask: None,
            payload: Bytes::from_static(&[0xFF, 0xFE]),
        };
        match handle_frame(bad, &mut fragments) {
            FrameAction::Violation(info) => assert_eq!(info.code, close_code::INVALID_PAYLOAD),
            other => panic!("expected violation, got {}", action_name(&other)),
        }
    }

    fn action_name(action: &FrameAction) -> &'static str {
        match action {
            FrameAction::None => "None",
            FrameAction::Message(_) => "Message",
            FrameAction::Ping(_) => "Ping",
            FrameAction::Close(_) => "Close",
            FrameAction::Violation(_) => "Violation",
        }
    }
}

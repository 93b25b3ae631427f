//! WebSocket connector.
//!
//! Each `connect` opens at most one socket. A spawned task owns the socket
//! and runs a `tokio::select!` loop over incoming frames and outgoing
//! commands.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──connect()──► Connecting ──handshake ok──► Open
//!   ▲                     │                          │
//!   └──── error / disconnect() ◄──────── close / error
//! ```
//!
//! Every `connect` bumps a generation counter. A socket task whose
//! generation is no longer current never emits events, so a closed socket
//! cannot report into a newer connection.
//!
//! Only `ws://` URLs are supported with the default `tokio-tungstenite`
//! features.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, trace, warn};

use crate::error::Error;

use super::{
    ConnectionType, Connector, ConnectorContext, ConnectorEvent, EventSink, Frame, PathProvider,
};

// ============================================================================
// Constants
// ============================================================================

/// Code reported when the socket ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Open,
}

/// Commands for the socket task.
enum SocketCommand {
    /// Write a frame.
    Send(Message),
    /// Send a close frame and stop.
    Close { code: u16, reason: String },
}

struct SocketState {
    generation: u64,
    phase: Phase,
    commands: Option<mpsc::UnboundedSender<SocketCommand>>,
    task: Option<JoinHandle<()>>,
}

type SharedState = Arc<Mutex<SocketState>>;

// ============================================================================
// WebSocketConnector
// ============================================================================

/// Persistent duplex transport.
pub struct WebSocketConnector {
    events: EventSink,
    path: PathProvider,
    state: SharedState,
}

impl WebSocketConnector {
    /// Creates an idle connector.
    #[must_use]
    pub fn new(context: ConnectorContext) -> Self {
        Self {
            events: context.events,
            path: context.path,
            state: Arc::new(Mutex::new(SocketState {
                generation: 0,
                phase: Phase::Idle,
                commands: None,
                task: None,
            })),
        }
    }

    /// Socket task: handshake, then pump frames until either side closes.
    async fn run(
        url: String,
        generation: u64,
        state: SharedState,
        events: EventSink,
        mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
    ) {
        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                let mut guard = state.lock();
                if guard.generation == generation {
                    guard.phase = Phase::Idle;
                    guard.commands = None;
                    guard.task = None;
                    events.emit(ConnectorEvent::Error(Error::WebSocket(e)));
                }
                return;
            }
        };

        {
            let mut guard = state.lock();
            if guard.generation != generation {
                return;
            }
            guard.phase = Phase::Open;
            events.emit(ConnectorEvent::Open);
        }
        debug!(%url, "WebSocket connected");

        let (mut ws_write, mut ws_read) = stream.split();
        let mut close_code = ABNORMAL_CLOSURE;
        let mut close_reason = String::new();

        loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            trace!(len = text.len(), "Text frame received");
                            Self::emit_current(&state, generation, &events, ConnectorEvent::Message(
                                Frame::Text(text.as_str().to_string()),
                            ));
                        }

                        Some(Ok(Message::Binary(data))) => {
                            trace!(len = data.len(), "Binary frame received");
                            Self::emit_current(&state, generation, &events, ConnectorEvent::Message(
                                Frame::Binary(data.to_vec()),
                            ));
                        }

                        Some(Ok(Message::Close(frame))) => {
                            if let Some(frame) = frame {
                                close_code = u16::from(frame.code);
                                close_reason = frame.reason.as_str().to_string();
                            }
                            debug!(code = close_code, reason = %close_reason, "WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket error");
                            Self::emit_current(&state, generation, &events, ConnectorEvent::Error(
                                Error::WebSocket(e),
                            ));
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break;
                        }

                        // Ping / Pong are answered by tungstenite
                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(SocketCommand::Send(message)) => {
                            if let Err(e) = ws_write.send(message).await {
                                warn!(error = %e, "Failed to write frame");
                            }
                        }

                        Some(SocketCommand::Close { code, reason }) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            };
                            let _ = ws_write.send(Message::Close(Some(frame))).await;
                            let _ = ws_write.close().await;
                            return;
                        }

                        None => {
                            let _ = ws_write.close().await;
                            return;
                        }
                    }
                }
            }
        }

        let mut guard = state.lock();
        if guard.generation == generation {
            guard.phase = Phase::Idle;
            guard.commands = None;
            guard.task = None;
            events.emit(ConnectorEvent::Disconnect {
                code: close_code,
                reason: close_reason,
            });
        }
    }

    fn emit_current(state: &SharedState, generation: u64, events: &EventSink, event: ConnectorEvent) {
        if state.lock().generation == generation {
            events.emit(event);
        }
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) {
        let mut state = self.state.lock();
        if state.phase != Phase::Idle {
            debug!(phase = ?state.phase, "WebSocket connect ignored");
            return;
        }

        let url = match (self.path)() {
            Ok(url) => url,
            Err(e) => {
                self.events.emit(ConnectorEvent::Error(e));
                return;
            }
        };

        state.generation += 1;
        state.phase = Phase::Connecting;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        state.commands = Some(command_tx);
        state.task = Some(tokio::spawn(Self::run(
            url,
            state.generation,
            Arc::clone(&self.state),
            self.events.clone(),
            command_rx,
        )));
    }

    fn disconnect(&self, code: u16, reason: &str) {
        let mut state = self.state.lock();
        let phase = state.phase;
        if phase == Phase::Idle {
            return;
        }

        state.generation += 1;
        state.phase = Phase::Idle;
        let commands = state.commands.take();
        let task = state.task.take();

        match phase {
            Phase::Open => {
                if let Some(commands) = commands {
                    let _ = commands.send(SocketCommand::Close {
                        code,
                        reason: reason.to_string(),
                    });
                }
                self.events.emit(ConnectorEvent::Disconnect {
                    code,
                    reason: reason.to_string(),
                });
            }
            Phase::Connecting => {
                if let Some(task) = task {
                    task.abort();
                }
            }
            Phase::Idle => {}
        }

        debug!(code, reason, "WebSocket disconnected");
    }

    fn send(&self, frame: Frame) -> bool {
        let state = self.state.lock();
        if state.phase != Phase::Open {
            return false;
        }
        let Some(commands) = &state.commands else {
            return false;
        };

        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
        };
        commands.send(SocketCommand::Send(message)).is_ok()
    }

    fn connected(&self) -> bool {
        self.state.lock().phase == Phase::Open
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::WebSocket
    }
}

impl Drop for WebSocketConnector {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.commands = None;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

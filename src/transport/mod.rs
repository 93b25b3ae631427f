//! Transport layer.
//!
//! Two interchangeable connectors carry frames between the client and the
//! push-server. The orchestrator only sees the [`Connector`] trait and the
//! event stream.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   connect / send / disconnect   ┌────────────────────┐
//! │                  │────────────────────────────────►│ WebSocketConnector │
//! │   Event loop     │                                 ├────────────────────┤
//! │  (orchestrator)  │◄────────────────────────────────│ LongPollingConnector│
//! └──────────────────┘   TransportEvent (mpsc)         └────────────────────┘
//! ```
//!
//! # Event Semantics
//!
//! | Event | Meaning |
//! |-------|---------|
//! | `Open` | Connector transitioned to connected |
//! | `Message` | One frame received |
//! | `Error` | Transport failure; never returned synchronously |
//! | `Disconnect` | Connected connector closed (remote close or `disconnect`) |
//! | `LastMessageId` | Long-polling "not modified" answer with resume id |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `websocket` | Persistent duplex socket |
//! | `long_polling` | Serialized HTTP GET / POST cycle |
//! | `http` | HTTP client abstraction used by long-polling |

// ============================================================================
// Submodules
// ============================================================================

/// HTTP client abstraction.
pub mod http;

/// Long-polling connector.
pub mod long_polling;

/// WebSocket connector.
pub mod websocket;

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

// ============================================================================
// Re-exports
// ============================================================================

pub use http::{HttpClient, HttpResponse, ReqwestHttpClient};
pub use long_polling::LongPollingConnector;
pub use websocket::WebSocketConnector;

// ============================================================================
// Close Codes
// ============================================================================

/// Close codes understood by the push-server.
pub mod close_code {
    /// Regular shutdown.
    pub const NORMAL_CLOSURE: u16 = 1000;
    /// Server went away.
    pub const SERVER_DIE: u16 = 1001;
    /// Channel replaced in place; reconnect with the new one.
    pub const CONFIG_REPLACED: u16 = 3000;
    /// Channel expired; configuration must be refetched.
    pub const CHANNEL_EXPIRED: u16 = 3001;
    /// Server restarted.
    pub const SERVER_RESTARTED: u16 = 3002;
    /// Configuration expired.
    pub const CONFIG_EXPIRED: u16 = 3003;
    /// Closed on request of the host application.
    pub const MANUAL: u16 = 3004;
    /// Keep-alive watchdog fired.
    pub const STUCK: u16 = 3005;
    /// Server rejected the channel id.
    pub const WRONG_CHANNEL_ID: u16 = 4010;
}

// ============================================================================
// ConnectionType
// ============================================================================

/// Transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionType {
    /// Persistent duplex socket.
    WebSocket,
    /// Serialized HTTP request cycle.
    LongPolling,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => f.write_str("webSocket"),
            Self::LongPolling => f.write_str("longPolling"),
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A payload-agnostic transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl Frame {
    /// Returns the raw bytes of the frame.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    /// Returns the frame as text, replacing invalid UTF-8.
    #[must_use]
    pub fn to_text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text),
            Self::Binary(data) => String::from_utf8_lossy(data),
        }
    }

    /// Returns `true` if the frame carries no payload.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

// ============================================================================
// Events
// ============================================================================

/// Something a connector observed.
#[derive(Debug)]
pub enum ConnectorEvent {
    /// Connector is connected.
    Open,
    /// A frame arrived.
    Message(Frame),
    /// Transport failure.
    Error(Error),
    /// Connected connector closed.
    Disconnect {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Server reported the last message id without new data.
    LastMessageId(String),
}

/// A connector event tagged with its origin.
#[derive(Debug)]
pub struct TransportEvent {
    /// Which connector emitted the event.
    pub source: ConnectionType,
    /// The event.
    pub event: ConnectorEvent,
    /// Dropped by the consumer once the event is processed.
    pub(crate) done: Option<oneshot::Sender<()>>,
}

/// Sending half of the transport event stream, bound to one connector.
#[derive(Debug, Clone)]
pub struct EventSink {
    source: ConnectionType,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    /// Creates a sink emitting events tagged with `source`.
    #[must_use]
    pub fn new(source: ConnectionType, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { source, tx }
    }

    /// Connector kind this sink is bound to.
    #[inline]
    #[must_use]
    pub fn source(&self) -> ConnectionType {
        self.source
    }

    /// Emits an event. Events sent after the consumer is gone are dropped.
    pub fn emit(&self, event: ConnectorEvent) {
        let _ = self.tx.send(TransportEvent {
            source: self.source,
            event,
            done: None,
        });
    }

    /// Emits an event and returns a receiver that completes once the
    /// consumer has processed it.
    pub fn emit_tracked(&self, event: ConnectorEvent) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self.tx.send(TransportEvent {
            source: self.source,
            event,
            done: Some(done_tx),
        });
        done_rx
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Computes a URL at the moment it is needed.
pub type PathProvider = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// Common contract of the transports.
///
/// All methods return immediately. Failures surface as
/// [`ConnectorEvent::Error`] on the event stream.
pub trait Connector: Send + Sync {
    /// Starts connecting. No-op while connecting or connected.
    fn connect(&self);

    /// Closes the connection. Emits [`ConnectorEvent::Disconnect`] if it
    /// was connected.
    fn disconnect(&self, code: u16, reason: &str);

    /// Sends a frame. Returns `false` if the frame could not be queued.
    fn send(&self, frame: Frame) -> bool;

    /// Returns `true` while connected.
    fn connected(&self) -> bool;

    /// Transport kind.
    fn connection_type(&self) -> ConnectionType;
}

/// Everything a connector needs from its owner.
#[derive(Clone)]
pub struct ConnectorContext {
    /// Event stream.
    pub events: EventSink,
    /// Subscription URL.
    pub path: PathProvider,
    /// Publication URL.
    pub publish_path: PathProvider,
    /// HTTP client for request-based transports.
    pub http: Arc<dyn HttpClient>,
}

/// Builds a connector for a context.
pub type ConnectorFactory = Arc<dyn Fn(ConnectorContext) -> Arc<dyn Connector> + Send + Sync>;

/// Factory for [`WebSocketConnector`].
#[must_use]
pub fn websocket_factory() -> ConnectorFactory {
    Arc::new(|context: ConnectorContext| {
        Arc::new(WebSocketConnector::new(context)) as Arc<dyn Connector>
    })
}

/// Factory for [`LongPollingConnector`].
#[must_use]
pub fn long_polling_factory() -> ConnectorFactory {
    Arc::new(|context: ConnectorContext| {
        Arc::new(LongPollingConnector::new(context)) as Arc<dyn Connector>
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_text_views() {
        let text = Frame::Text("ping".to_string());
        assert_eq!(text.as_bytes(), b"ping");
        assert_eq!(text.to_text(), "ping");

        let binary = Frame::Binary(b"pong".to_vec());
        assert_eq!(binary.to_text(), "pong");
        assert!(Frame::Binary(Vec::new()).is_empty());
    }

    #[test]
    fn test_connection_type_display() {
        assert_eq!(ConnectionType::WebSocket.to_string(), "webSocket");
        assert_eq!(ConnectionType::LongPolling.to_string(), "longPolling");
    }

    #[tokio::test]
    async fn test_tracked_event_completes_when_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(ConnectionType::LongPolling, tx);

        let done = sink.emit_tracked(ConnectorEvent::Open);
        let event = rx.recv().await.expect("event");
        assert_eq!(event.source, ConnectionType::LongPolling);
        assert!(matches!(event.event, ConnectorEvent::Open));

        drop(event);
        assert!(done.await.is_err());
    }
}

//! Push Client - resilient client for a push-server.
//!
//! This library keeps a realtime connection to a push-server and delivers
//! application events to subscribers.
//!
//! # Architecture
//!
//! The client follows an actor model:
//!
//! - **Handle**: [`PushClient`] is cheap to clone and sends commands
//! - **Actor**: one task owns configuration, reconnects and failover
//! - **Connectors**: WebSocket and long polling share one contract
//!
//! Key design principles:
//!
//! - The frame format follows the server version (text, binary or JSON-RPC)
//! - WebSocket falls back to long polling and is restored later
//! - Clients sharing a [`KeyValueStore`] share transport-health flags
//! - Event-driven architecture (no polling of internal state)
//!
//! # Quick Start
//!
//! ```no_run
//! use push_client::{Notification, PushClient, RestApi, Result, Subscription};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = PushClient::builder()
//!         .user_id(42)
//!         .site_id("s1")
//!         .rest_api(RestApi::new("https://portal.example/rest"))
//!         .build()?;
//!
//!     let _handle = client.subscribe(Subscription::server("crm"), |notification| {
//!         if let Notification::Message(body) = notification {
//!             println!("{}: {}", body.command, body.params);
//!         }
//!     });
//!
//!     client.start(None).await?;
//!     client
//!         .send_message(&[7], "crm", "ping", serde_json::json!({}), 0)
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`channel`] | Session bookkeeping and public channel lookup |
//! | [`client`] | [`PushClient`], builder and subscriptions |
//! | [`config`] | Server configuration and the REST backend |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`logging`] | Host logger integration |
//! | [`protocol`] | Text, binary and JSON-RPC codecs |
//! | [`rpc`] | JSON-RPC correlation |
//! | [`storage`] | Shared key-value storage and flags |
//! | [`transport`] | WebSocket and long-polling connectors |

// ============================================================================
// Modules
// ============================================================================

/// Channels: session pointer and public channel resolution.
pub mod channel;

/// Client handle, builder, subscriptions and the orchestrating actor.
///
/// Use [`PushClient::builder()`] to create a client.
pub mod client;

/// Server configuration and configuration sources.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Host logging.
pub mod logging;

/// Frame codecs.
///
/// Text units, protobuf batches and JSON-RPC envelopes.
pub mod protocol;

/// JSON-RPC request correlation.
pub mod rpc;

/// Key-value storage shared between clients.
pub mod storage;

/// Transport layer.
///
/// WebSocket and long-polling connectors behind one trait.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    DebugInfo, Notification, NotificationHandler, PublishMessage, PullStatus, PushClient,
    PushClientBuilder, Subscription, SubscriptionHandle, SubscriptionKind,
};

// Configuration types
pub use config::{ConfigSource, Configuration, FetchedConfig, Protocol, RestApi};

// Channel types
pub use channel::{PublicChannel, PublicIdSource};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{RequestId, SubscriptionId, UserId};

// Logging types
pub use logging::{LogLevel, Logger, NoopLogger, TracingLogger};

// Message types
pub use protocol::{EventBody, PushMessage};

// Storage types
pub use storage::{KeyValueStore, MemoryStore};

// Transport types
pub use transport::{ConnectionType, Connector, Frame};

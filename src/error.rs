//! Error types for the push client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use push_client::{PushClient, Result};
//!
//! async fn example(client: &PushClient) -> Result<()> {
//!     client.start(None).await?;
//!     client.send_message(&[42], "crm", "fieldUpdated", json!({"id": 1}), 0).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::ConfigStale`] |
//! | Transport | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::NotConnected`] |
//! | Protocol | [`Error::Protocol`], [`Error::Decode`] |
//! | RPC | [`Error::RpcTimeout`], [`Error::Rpc`], [`Error::MethodNotFound`] |
//! | Lifecycle | [`Error::Auth`], [`Error::RevisionMismatch`], [`Error::Disabled`] |
//! | Publishing | [`Error::PublishingDisabled`], [`Error::PublishingUnsupported`], [`Error::UnresolvedReceivers`], [`Error::Unsupported`] |
//! | External | [`Error::Json`], [`Error::WebSocket`], [`Error::Http`], [`Error::Url`], [`Error::Base64`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{RequestId, UserId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client options or the fetched configuration are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Configuration is no longer actual.
    ///
    /// Handled by restarting the client.
    #[error("Configuration is stale")]
    ConfigStale,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport failure (socket or HTTP).
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection closed while a call was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Active connector refused the frame.
    #[error("Not connected: {message}")]
    NotConnected {
        /// What could not be sent.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected frame.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Binary frame could not be decoded.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the decoding failure.
        message: String,
    },

    // ========================================================================
    // RPC Errors
    // ========================================================================
    /// JSON-RPC call was not answered in time.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RpcTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Remote side answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// No local handler registered for an incoming method.
    #[error("Method not found: {method}")]
    MethodNotFound {
        /// The unknown method name.
        method: String,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Server refused the credentials (HTTP 401/403 on configuration fetch).
    #[error("Authorization failed ({status}): {message}")]
    Auth {
        /// HTTP status (401 or 403).
        status: u16,
        /// Server-provided description.
        message: String,
    },

    /// Server protocol revision differs from the client revision.
    #[error("Revision mismatch: server={server}, client={client}")]
    RevisionMismatch {
        /// Revision reported by the server.
        server: u32,
        /// Revision compiled into the client.
        client: u32,
    },

    /// Client cannot be started.
    #[error("Client disabled: {message}")]
    Disabled {
        /// Why the client is disabled.
        message: String,
    },

    // ========================================================================
    // Publishing Errors
    // ========================================================================
    /// Publishing is switched off in the server configuration.
    #[error("Client publishing is disabled")]
    PublishingDisabled,

    /// Server version does not support client publishing.
    #[error("Client publishing is not supported by server version {version}")]
    PublishingUnsupported {
        /// Server protocol version.
        version: u32,
    },

    /// Some receivers have no resolvable public channel.
    #[error("Cannot address users: {user_ids:?}")]
    UnresolvedReceivers {
        /// Users that could not be resolved.
        user_ids: Vec<UserId>,
    },

    /// Operation requires a capability the negotiated protocol lacks.
    #[error("Unsupported operation: {operation}")]
    Unsupported {
        /// The unsupported operation.
        operation: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Base64 decode error.
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a not-connected error.
    #[inline]
    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::NotConnected {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates an RPC timeout error.
    #[inline]
    pub fn rpc_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RpcTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates an RPC error from a remote error object.
    #[inline]
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Creates a method-not-found error.
    #[inline]
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            method: method.into(),
        }
    }

    /// Creates an authorization error.
    #[inline]
    pub fn auth(status: u16, message: impl Into<String>) -> Self {
        Self::Auth {
            status,
            message: message.into(),
        }
    }

    /// Creates a revision mismatch error.
    #[inline]
    pub fn revision_mismatch(server: u32, client: u32) -> Self {
        Self::RevisionMismatch { server, client }
    }

    /// Creates a disabled-client error.
    #[inline]
    pub fn disabled(message: impl Into<String>) -> Self {
        Self::Disabled {
            message: message.into(),
        }
    }

    /// Creates an unsupported-operation error.
    #[inline]
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RpcTimeout { .. })
    }

    /// Returns `true` if this is a transport-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::NotConnected { .. }
                | Self::WebSocket(_)
                | Self::Http(_)
        )
    }

    /// Returns `true` if this error ends the session until the host intervenes.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::RevisionMismatch { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors are retried by reconnect or restart.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RpcTimeout { .. }
                | Self::ConfigStale
                | Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::NotConnected { .. }
                | Self::WebSocket(_)
                | Self::Http(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

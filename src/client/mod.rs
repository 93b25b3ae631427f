//! Client orchestrator.
//!
//! [`PushClient`] is a cheap handle over a single actor task that owns the
//! connection lifecycle. Getters read shared snapshots directly; lifecycle
//! operations are sent to the actor as commands.
//!
//! # Architecture
//!
//! ```text
//!  PushClient ──Command──►┌────────────┐◄──TransportEvent── connectors
//!                         │ event loop │◄──Internal──────── timers, config
//!  subscribers ◄──────────└────────────┘                    fetch, storage
//! ```
//!
//! # State Machine
//!
//! ```text
//! Offline ──connect──► Connecting ──open──► Online
//!    ▲                     │                  │
//!    └──── error ──────────┴──── disconnect ──┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `builder` | [`PushClientBuilder`] |
//! | `core` | [`PushClient`] public API and publishing |
//! | `event_loop` | The actor |
//! | `status` | [`PullStatus`] and reconnect backoff |
//! | `subscribers` | Subscriber registry |

// ============================================================================
// Submodules
// ============================================================================

/// Client builder.
pub mod builder;

/// Client handle.
pub mod core;

/// Orchestrator actor.
mod event_loop;

/// Status and backoff.
pub mod status;

/// Subscriber registry.
pub mod subscribers;

#[cfg(test)]
mod testing;

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::PushClientBuilder;
pub use core::{DebugInfo, PublishMessage, PushClient};
pub use status::PullStatus;
pub use subscribers::{
    Notification, NotificationHandler, Subscription, SubscriptionHandle, SubscriptionKind,
};

// ============================================================================
// Constants
// ============================================================================

/// Interval between configuration actuality checks.
pub const CONFIG_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between WebSocket restore attempts while long-polling.
pub const RESTORE_WEBSOCKET_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Delay before an `Offline` status reaches subscribers.
pub const OFFLINE_STATUS_DELAY: Duration = Duration::from_secs(5);

/// Server ping period in JSON-RPC mode. The connection counts as stuck
/// after twice this long without a ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay of [`PushClient::reconnect`].
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound of the random delay after a server restart.
pub const SERVER_RESTART_MAX_DELAY: Duration = Duration::from_secs(15);

/// Presence messages older than this are not delivered.
pub const ONLINE_MAX_AGE_SECS: f64 = 240.0;

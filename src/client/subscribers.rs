//! Subscriber registry and fan-out.
//!
//! Registrations are kept in registration order. Server and client
//! subscriptions filter by module id (case-insensitive) and, optionally, by
//! command.
//!
//! | Kind | Receives |
//! |------|----------|
//! | `Server` | Messages published by the backend |
//! | `Client` | Messages published by other clients |
//! | `Online` | Presence messages (`online` module) |
//! | `Status` | Connection status changes |
//! | `Revision` | Revision mismatch (fatal) |
//! | `Error` | Authorization failures without a waiting caller |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

use crate::identifiers::SubscriptionId;
use crate::protocol::EventBody;
use crate::transport::ConnectionType;

use super::status::PullStatus;

// ============================================================================
// Types
// ============================================================================

/// Callback invoked for every matching notification.
pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Category of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Backend messages.
    Server,
    /// Messages from other clients.
    Client,
    /// Presence messages.
    Online,
    /// Connection status.
    Status,
    /// Revision mismatch.
    Revision,
    /// Terminal errors.
    Error,
}

/// What a subscriber is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    kind: SubscriptionKind,
    module_id: Option<String>,
    command: Option<String>,
}

impl Subscription {
    fn of(kind: SubscriptionKind, module_id: Option<String>) -> Self {
        Self {
            kind,
            module_id: module_id.map(|id| id.to_lowercase()),
            command: None,
        }
    }

    /// Backend messages of `module_id`.
    #[must_use]
    pub fn server(module_id: impl Into<String>) -> Self {
        Self::of(SubscriptionKind::Server, Some(module_id.into()))
    }

    /// Client messages of `module_id`.
    #[must_use]
    pub fn client(module_id: impl Into<String>) -> Self {
        Self::of(SubscriptionKind::Client, Some(module_id.into()))
    }

    /// Presence messages.
    #[must_use]
    pub fn online() -> Self {
        Self::of(SubscriptionKind::Online, None)
    }

    /// Status changes.
    #[must_use]
    pub fn status() -> Self {
        Self::of(SubscriptionKind::Status, None)
    }

    /// Revision mismatch.
    #[must_use]
    pub fn revision() -> Self {
        Self::of(SubscriptionKind::Revision, None)
    }

    /// Terminal errors.
    #[must_use]
    pub fn error() -> Self {
        Self::of(SubscriptionKind::Error, None)
    }

    /// Narrows a message subscription to one command.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Subscription kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    fn matches(&self, kind: SubscriptionKind, notification: &Notification) -> bool {
        if self.kind != kind {
            return false;
        }
        let Notification::Message(body) = notification else {
            return true;
        };
        let module_ok = self
            .module_id
            .as_deref()
            .is_none_or(|module_id| module_id == body.module_id.to_lowercase());
        let command_ok = self
            .command
            .as_deref()
            .is_none_or(|command| command == body.command);
        module_ok && command_ok
    }
}

// ============================================================================
// Notification
// ============================================================================

/// Payload handed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A delivered message.
    Message(EventBody),
    /// Connection status changed.
    Status {
        /// New status.
        status: PullStatus,
        /// Active transport.
        connection_type: ConnectionType,
    },
    /// Server revision differs; the client disabled itself.
    RevisionMismatch {
        /// Server revision.
        server: u32,
        /// Client revision.
        client: u32,
    },
    /// The backend refused the session.
    AuthFailed {
        /// HTTP status.
        status: u16,
        /// Backend description.
        message: String,
    },
}

// ============================================================================
// SubscriberRegistry
// ============================================================================

struct Entry {
    id: SubscriptionId,
    subscription: Subscription,
    handler: NotificationHandler,
}

/// Ordered subscriber list.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl SubscriberRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` and returns its handle.
    pub(crate) fn add(
        self: &Arc<Self>,
        subscription: Subscription,
        handler: NotificationHandler,
    ) -> SubscriptionHandle {
        let id = SubscriptionId::next();
        trace!(%id, kind = ?subscription.kind, "Subscriber added");
        self.entries.write().push(Entry {
            id,
            subscription,
            handler,
        });
        SubscriptionHandle {
            id,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.read().iter().any(|entry| entry.id == id)
    }

    /// Number of registrations.
    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Invokes every matching handler in registration order and returns how
    /// many ran. Handlers run outside the lock and may subscribe or
    /// unsubscribe.
    pub(crate) fn emit(&self, kind: SubscriptionKind, notification: &Notification) -> usize {
        let handlers: Vec<NotificationHandler> = self
            .entries
            .read()
            .iter()
            .filter(|entry| entry.subscription.matches(kind, notification))
            .map(|entry| Arc::clone(&entry.handler))
            .collect();

        for handler in &handlers {
            handler(notification);
        }
        handlers.len()
    }
}

// ============================================================================
// SubscriptionHandle
// ============================================================================

/// Cancels one registration.
///
/// Dropping the handle keeps the subscription alive.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    registry: Weak<SubscriberRegistry>,
}

impl SubscriptionHandle {
    /// Registration id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns `true` while the registration exists.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.contains(self.id))
    }

    /// Removes exactly this registration. Returns `false` if it was already
    /// gone.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.id))
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Cross-tab flags.
//!
//! Flags are stored as expiry timestamps (unix milliseconds) under
//! `bx-pull-<userId>-<siteId>-<flag>`. A flag is set while its timestamp is
//! in the future; clearing writes `0`.
//!
//! | Flag | Key suffix | Effect |
//! |------|------------|--------|
//! | [`SharedFlag::WebSocketBlocked`] | `websocket-blocked` | use long-polling |
//! | [`SharedFlag::LongPollingBlocked`] | `longpolling-blocked` | never fall back |
//! | [`SharedFlag::LoggingEnabled`] | `logging-enabled` | write to the host logger |
//!
//! The last fetched configuration is cached under
//! `bx-pull-<userId>-<siteId>-config`.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::identifiers::UserId;

use super::KeyValueStore;

// ============================================================================
// Constants
// ============================================================================

/// Prefix of every key written by the client.
pub const STORAGE_PREFIX: &str = "bx-pull";

/// Key suffix of the cached configuration.
pub const CONFIG_CACHE_SUFFIX: &str = "config";

/// Lifetime of a set flag.
pub const FLAG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Types
// ============================================================================

/// Called with the new value when another tab flips the WebSocket-blocked
/// flag.
pub type BlockChangedHandler = Box<dyn Fn(bool) + Send + Sync>;

/// A cross-tab flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedFlag {
    /// WebSocket failed repeatedly; use long-polling.
    WebSocketBlocked,
    /// Long-polling is unavailable.
    LongPollingBlocked,
    /// Host-facing logging is on.
    LoggingEnabled,
}

impl SharedFlag {
    /// Key suffix of the flag.
    #[inline]
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::WebSocketBlocked => "websocket-blocked",
            Self::LongPollingBlocked => "longpolling-blocked",
            Self::LoggingEnabled => "logging-enabled",
        }
    }
}

// ============================================================================
// SharedConfig
// ============================================================================

/// Flags shared between every client of one user on one site.
#[derive(Clone)]
pub struct SharedConfig {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl SharedConfig {
    /// Creates a view over `store` namespaced by user and site.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, user_id: UserId, site_id: &str) -> Self {
        Self {
            store,
            prefix: format!("{STORAGE_PREFIX}-{user_id}-{site_id}"),
        }
    }

    /// Storage key of a flag.
    #[must_use]
    pub fn key(&self, flag: SharedFlag) -> String {
        format!("{}-{}", self.prefix, flag.suffix())
    }

    /// Storage key of the cached configuration.
    #[must_use]
    pub fn config_key(&self) -> String {
        format!("{}-{CONFIG_CACHE_SUFFIX}", self.prefix)
    }

    /// Returns `true` if the flag is set and unexpired.
    #[must_use]
    pub fn is_set(&self, flag: SharedFlag) -> bool {
        is_active(self.store.get(&self.key(flag)).as_deref())
    }

    /// Sets or clears a flag.
    pub fn set(&self, flag: SharedFlag, value: bool) {
        let stamp = if value {
            Utc::now().timestamp_millis() + FLAG_TTL.as_millis() as i64
        } else {
            0
        };
        self.store.set(&self.key(flag), &stamp.to_string());
    }

    /// WebSocket-blocked flag.
    #[inline]
    #[must_use]
    pub fn is_websocket_blocked(&self) -> bool {
        self.is_set(SharedFlag::WebSocketBlocked)
    }

    /// Sets the WebSocket-blocked flag.
    #[inline]
    pub fn set_websocket_blocked(&self, value: bool) {
        self.set(SharedFlag::WebSocketBlocked, value);
    }

    /// Long-polling-blocked flag.
    #[inline]
    #[must_use]
    pub fn is_long_polling_blocked(&self) -> bool {
        self.is_set(SharedFlag::LongPollingBlocked)
    }

    /// Sets the long-polling-blocked flag.
    #[inline]
    pub fn set_long_polling_blocked(&self, value: bool) {
        self.set(SharedFlag::LongPollingBlocked, value);
    }

    /// Logging-enabled flag.
    #[inline]
    #[must_use]
    pub fn is_logging_enabled(&self) -> bool {
        self.is_set(SharedFlag::LoggingEnabled)
    }

    /// Sets the logging-enabled flag.
    #[inline]
    pub fn set_logging_enabled(&self, value: bool) {
        self.set(SharedFlag::LoggingEnabled, value);
    }

    // ========================================================================
    // Configuration Cache
    // ========================================================================

    /// Returns the cached configuration, if any parses.
    #[must_use]
    pub fn load_config(&self) -> Option<Configuration> {
        let key = self.config_key();
        let raw = self.store.get(&key)?;
        match serde_json::from_str(&raw) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %e, "Dropping unreadable cached configuration");
                self.store.remove(&key);
                None
            }
        }
    }

    /// Caches a configuration.
    pub fn store_config(&self, config: &Configuration) {
        match serde_json::to_string(config) {
            Ok(json) => self.store.set(&self.config_key(), &json),
            Err(e) => warn!(error = %e, "Failed to cache configuration"),
        }
    }

    /// Drops the cached configuration.
    pub fn clear_config(&self) {
        self.store.remove(&self.config_key());
    }

    // ========================================================================
    // Watching
    // ========================================================================

    /// Watches writes made by other handles and calls `handler` whenever the
    /// WebSocket-blocked value actually changes.
    ///
    /// The returned task ends when the store is dropped; abort it to stop
    /// earlier.
    pub fn watch(&self, handler: BlockChangedHandler) -> JoinHandle<()> {
        let mut changes = self.store.subscribe();
        let own_origin = self.store.origin();
        let key = self.key(SharedFlag::WebSocketBlocked);

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if change.origin == own_origin || change.key != key {
                            continue;
                        }
                        let old = is_active(change.old_value.as_deref());
                        let new = is_active(change.new_value.as_deref());
                        if old != new {
                            debug!(blocked = new, "WebSocket-blocked flag changed in another tab");
                            handler(new);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Storage change notifications lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Returns `true` if `raw` holds a timestamp in the future.
fn is_active(raw: Option<&str>) -> bool {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .is_some_and(|stamp| stamp > Utc::now().timestamp_millis())
}

// ============================================================================
// Tests
// ============================================================================

//! Shared key-value storage.
//!
//! Several clients (one per tab) may share one store. Writes are
//! last-writer-wins; every write is broadcast as a [`StorageChange`] so the
//! other handles can react without polling.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `memory` | In-process store, forkable into several handles |
//! | `shared_config` | Expiring cross-tab flags and configuration cache |

// ============================================================================
// Submodules
// ============================================================================

/// In-memory store.
pub mod memory;

/// Cross-tab flags.
pub mod shared_config;

// ============================================================================
// Imports
// ============================================================================

use tokio::sync::broadcast;

// ============================================================================
// Re-exports
// ============================================================================

pub use memory::MemoryStore;
pub use shared_config::{BlockChangedHandler, SharedConfig, SharedFlag};

// ============================================================================
// StorageChange
// ============================================================================

/// One write to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    /// Written key.
    pub key: String,
    /// Value before the write.
    pub old_value: Option<String>,
    /// Value after the write; `None` for removals.
    pub new_value: Option<String>,
    /// Origin of the handle that wrote.
    pub origin: u64,
}

// ============================================================================
// KeyValueStore
// ============================================================================

/// String store with change notification.
pub trait KeyValueStore: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Writes a value.
    fn set(&self, key: &str, value: &str);

    /// Deletes a value.
    fn remove(&self, key: &str);

    /// Subscribes to writes made through any handle of this store.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;

    /// Identifies this handle in [`StorageChange::origin`].
    fn origin(&self) -> u64;
}

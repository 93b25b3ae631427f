//! In-memory [`KeyValueStore`].

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;

use super::{KeyValueStore, StorageChange};

// ============================================================================
// Constants
// ============================================================================

/// Buffered change notifications per subscriber.
const CHANGE_CAPACITY: usize = 64;

// ============================================================================
// MemoryStore
// ============================================================================

struct Shared {
    data: RwLock<FxHashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
    next_origin: AtomicU64,
}

/// Process-local store.
///
/// [`MemoryStore::fork`] returns another handle over the same data with its
/// own origin, the way a second tab sees the same storage.
pub struct MemoryStore {
    shared: Arc<Shared>,
    origin: u64,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                data: RwLock::new(FxHashMap::default()),
                changes,
                next_origin: AtomicU64::new(2),
            }),
            origin: 1,
        }
    }

    /// Creates another handle sharing the data.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            origin: self.shared.next_origin.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn write(&self, key: &str, value: Option<&str>) {
        let old_value = {
            let mut data = self.shared.data.write();
            match value {
                Some(value) => data.insert(key.to_string(), value.to_string()),
                None => data.remove(key),
            }
        };

        let _ = self.shared.changes.send(StorageChange {
            key: key.to_string(),
            old_value,
            new_value: value.map(str::to_string),
            origin: self.origin,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.shared.data.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.write(key, Some(value));
    }

    fn remove(&self, key: &str) {
        self.write(key, None);
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.shared.changes.subscribe()
    }

    fn origin(&self) -> u64 {
        self.origin
    }
}

// ============================================================================
// Tests
// ============================================================================

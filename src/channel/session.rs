//! Per-connection session bookkeeping.
//!
//! The session pointer (`mid`, `tag`, `time`) goes into the subscription
//! URL so the server resumes after the last delivered message. The bounded
//! history suppresses messages delivered twice around a reconnect.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use serde::Serialize;

use crate::protocol::PushMessage;

// ============================================================================
// Constants
// ============================================================================

/// Number of delivered message ids remembered for de-duplication.
pub const MAX_IDS_TO_STORE: usize = 10;

// ============================================================================
// Session
// ============================================================================

/// Resumption pointer plus de-duplication history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Last delivered message id.
    pub mid: Option<String>,
    /// Resumption tag.
    pub tag: Option<String>,
    /// Resumption time.
    pub time: Option<String>,
    /// Number of messages dispatched.
    pub message_count: u64,
    history: VecDeque<String>,
}

impl Session {
    /// Creates an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `mid` was delivered recently.
    #[inline]
    #[must_use]
    pub fn is_duplicate(&self, mid: &str) -> bool {
        self.history.iter().any(|seen| seen == mid)
    }

    /// Records `mid` as delivered.
    ///
    /// Returns `false` (and records nothing) if it is a duplicate. The
    /// oldest id is evicted once the history is full.
    pub fn register(&mut self, mid: &str) -> bool {
        if self.is_duplicate(mid) {
            return false;
        }
        if self.history.len() == MAX_IDS_TO_STORE {
            self.history.pop_front();
        }
        self.history.push_back(mid.to_string());
        true
    }

    /// Moves the resumption pointer to `message`.
    pub fn advance(&mut self, message: &PushMessage) {
        if let Some(mid) = &message.mid {
            self.mid = Some(mid.clone());
        }
        if let Some(tag) = &message.tag {
            self.tag = Some(tag.clone());
        }
        if let Some(time) = &message.time {
            self.time = Some(time.clone());
        }
    }

    /// Forgets the last message id; the server resends from its own pointer.
    #[inline]
    pub fn reset_pointer(&mut self) {
        self.mid = None;
    }

    /// Remembered ids, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Channel and session bookkeeping.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `session` | Resumption pointer and de-duplication history |
//! | `resolver` | Cached public channel lookup for publishing |

// ============================================================================
// Submodules
// ============================================================================

/// Public channel lookup.
pub mod resolver;

/// Session pointer and history.
pub mod session;

// ============================================================================
// Re-exports
// ============================================================================

pub use resolver::{ChannelResolver, PublicChannel, PublicIdSource};
pub use session::{MAX_IDS_TO_STORE, Session};

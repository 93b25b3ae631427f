//! Public channel resolution.
//!
//! Publishing to a user needs that user's public channel: a time-boxed id
//! plus signature. [`ChannelResolver`] caches descriptors until their `end`
//! and fetches everything missing in one batched lookup.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::identifiers::UserId;
use crate::protocol::Receiver;
use crate::protocol::binary::{decode_id, require_id};

// ============================================================================
// PublicChannel
// ============================================================================

/// Addressable public channel of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicChannel {
    /// Owner of the channel.
    pub user_id: UserId,
    /// Public channel id (base64).
    pub public_id: String,
    /// Channel signature (base64).
    pub signature: String,
    /// Start of validity.
    pub start: DateTime<Utc>,
    /// End of validity.
    pub end: DateTime<Utc>,
}

impl PublicChannel {
    /// Returns `true` while `now` is before `end`.
    #[inline]
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.end > now
    }

    /// Builds the binary receiver addressing this channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the id or signature is empty or not base64.
    pub fn to_receiver(&self) -> Result<Receiver> {
        let id = decode_id(&self.public_id)?;
        require_id(&id, "public channel")?;
        Ok(Receiver {
            id,
            is_private: false,
            signature: decode_id(&self.signature)?,
        })
    }
}

// ============================================================================
// PublicIdSource
// ============================================================================

/// Backend lookup of public channels.
#[async_trait]
pub trait PublicIdSource: Send + Sync {
    /// Fetches descriptors for `user_ids`. Unknown users are omitted.
    async fn fetch_public_ids(
        &self,
        user_ids: &[UserId],
    ) -> Result<FxHashMap<UserId, PublicChannel>>;
}

// ============================================================================
// ChannelResolver
// ============================================================================

/// Caching front of a [`PublicIdSource`].
pub struct ChannelResolver {
    source: Arc<dyn PublicIdSource>,
    cache: RwLock<FxHashMap<UserId, PublicChannel>>,
}

impl ChannelResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new(source: Arc<dyn PublicIdSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    /// Inserts descriptors obtained elsewhere, e.g. shipped with the
    /// configuration.
    pub fn seed(&self, channels: impl IntoIterator<Item = PublicChannel>) {
        let mut cache = self.cache.write();
        for channel in channels {
            cache.insert(channel.user_id, channel);
        }
    }

    /// Returns the cached, still valid descriptor of `user_id`.
    #[must_use]
    pub fn cached(&self, user_id: UserId) -> Option<PublicChannel> {
        let now = Utc::now();
        self.cache
            .read()
            .get(&user_id)
            .filter(|channel| channel.is_valid_at(now))
            .cloned()
    }

    /// Resolves descriptors for `user_ids`.
    ///
    /// Valid cached entries are returned as is; the rest are fetched in one
    /// call. Users that still cannot be resolved are absent from the result.
    /// A failed lookup is logged and leaves only the cached entries.
    pub async fn resolve_public_ids(&self, user_ids: &[UserId]) -> FxHashMap<UserId, PublicChannel> {
        let now = Utc::now();
        let mut result = FxHashMap::default();
        let mut missing = Vec::new();

        {
            let cache = self.cache.read();
            for &user_id in user_ids {
                match cache.get(&user_id) {
                    Some(channel) if channel.is_valid_at(now) => {
                        result.insert(user_id, channel.clone());
                    }
                    _ => {
                        if !missing.contains(&user_id) {
                            missing.push(user_id);
                        }
                    }
                }
            }
        }

        if missing.is_empty() {
            return result;
        }

        debug!(count = missing.len(), "Fetching public channels");
        let fetched = match self.source.fetch_public_ids(&missing).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(error = %e, "Public channel lookup failed");
                return result;
            }
        };

        let now = Utc::now();
        let mut cache = self.cache.write();
        for (user_id, channel) in fetched {
            if !channel.is_valid_at(now) {
                continue;
            }
            if missing.contains(&user_id) {
                result.insert(user_id, channel.clone());
            }
            cache.insert(user_id, channel);
        }

        result
    }
}

// ============================================================================
// Tests
// ============================================================================

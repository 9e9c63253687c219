//! Cache Tier Port (Driven Port)
//!
//! Uniform contract over the hot, warm and durable stores. An adapter
//! reports a failed lookup as [`TierError`], never as `Ok(None)`: absence
//! and outage stay distinguishable all the way up to the consumer.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::cache::{CacheEntry, TierLevel};

/// Cache tier failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TierError {
    /// The backing store could not be reached.
    #[error("{tier} tier unavailable: {reason}")]
    Unavailable {
        /// Tier.
        tier: TierLevel,
        /// Error details.
        reason: String,
    },

    /// The operation exceeded its deadline and was cancelled.
    #[error("{tier} tier timed out after {after:?}")]
    Timeout {
        /// Tier.
        tier: TierLevel,
        /// Deadline applied.
        after: Duration,
    },

    /// A stored value could not be decoded.
    #[error("{tier} tier holds an undecodable value for '{key}': {reason}")]
    Corrupt {
        /// Tier.
        tier: TierLevel,
        /// Rendered key.
        key: String,
        /// Decoder message.
        reason: String,
    },
}

impl TierError {
    /// Tier that failed.
    #[must_use]
    pub const fn tier(&self) -> TierLevel {
        match self {
            Self::Unavailable { tier, .. } | Self::Timeout { tier, .. } | Self::Corrupt { tier, .. } => {
                *tier
            }
        }
    }

    /// Whether the store answered but the value is unusable.
    #[must_use]
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    /// Metric label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Corrupt { .. } => "corrupt",
        }
    }
}

/// One cache tier.
///
/// Keys are the rendered form of [`crate::domain::cache::CacheKey`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Which tier this adapter serves.
    fn level(&self) -> TierLevel;

    /// Read one key; `Ok(None)` means legitimately absent.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError>;

    /// Write one key with a tier-local TTL.
    async fn set(&self, key: &str, entry: &CacheEntry, ttl: Duration) -> Result<(), TierError>;

    /// Remove one key. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), TierError>;

    /// Read several keys; absent keys are omitted from the map.
    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, CacheEntry>, TierError>;
}

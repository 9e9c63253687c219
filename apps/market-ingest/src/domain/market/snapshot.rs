//! Consumer-Facing Snapshots
//!
//! What `get_snapshot` and `status` hand to downstream consumers. Every
//! answer carries an explicit freshness indicator or an explicit
//! not-available marker.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::{DataClass, MarketPayload};
use super::symbol::Symbol;
use crate::domain::cache::TierLevel;

/// Cached market value as served to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Instrument.
    pub symbol: Symbol,
    /// Data class.
    pub data_class: DataClass,
    /// Payload exactly as validated on write.
    pub payload: MarketPayload,
    /// Exchange-side event time.
    pub source_timestamp: DateTime<Utc>,
    /// When the value was written to its tier-of-record.
    pub written_at: DateTime<Utc>,
    /// Tier that answered the read.
    pub served_from: TierLevel,
}

impl Snapshot {
    /// Age measured from the exchange event time.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.source_timestamp).to_std().unwrap_or_default()
    }
}

/// Why no snapshot could be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotAvailableReason {
    /// Every tier answered and none holds the key.
    Missing,
    /// At least one tier failed and no healthy tier holds the key.
    AllTiersUnavailable,
    /// A stored value failed to decode or validate.
    InvalidStoredValue,
}

impl fmt::Display for NotAvailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Missing => "missing",
            Self::AllTiersUnavailable => "all tiers unavailable",
            Self::InvalidStoredValue => "invalid stored value",
        })
    }
}

/// Result of a consumer snapshot read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "freshness", rename_all = "snake_case")]
pub enum SnapshotResult {
    /// Younger than the data class's stale-after age.
    Fresh(Snapshot),
    /// Last-known-good value older than the stale-after age.
    Stale {
        /// The value.
        snapshot: Snapshot,
        /// Age at read time.
        #[serde(with = "duration_millis")]
        age: Duration,
    },
    /// Nothing to serve.
    NotAvailable {
        /// Cause.
        reason: NotAvailableReason,
    },
}

impl SnapshotResult {
    /// The snapshot, regardless of freshness.
    #[must_use]
    pub const fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            Self::Fresh(snapshot) | Self::Stale { snapshot, .. } => Some(snapshot),
            Self::NotAvailable { .. } => None,
        }
    }

    /// Whether this is a fresh value.
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }

    /// Whether nothing could be served.
    #[must_use]
    pub const fn is_not_available(&self) -> bool {
        matches!(self, Self::NotAvailable { .. })
    }
}

/// Per-symbol ingestion path as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedStatus {
    /// Live push stream is delivering.
    Streaming,
    /// Stream unhealthy past grace; REST polling is delivering.
    PollingFallback,
    /// Neither path is delivering.
    Unavailable,
}

impl FeedStatus {
    /// Upper-case wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "STREAMING",
            Self::PollingFallback => "POLLING_FALLBACK",
            Self::Unavailable => "UNAVAILABLE",
        }
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! Cache Entries
//!
//! The stored record. Serialized as JSON for shared tiers so every tier
//! holds the same tagged, versioned representation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::{CacheKey, KeyNamespace};
use crate::domain::market::{DataClass, MarketPayload, NormalizedEvent, Symbol};

/// Cache tier, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierLevel {
    /// In-process.
    Hot,
    /// Shared, medium TTL.
    Warm,
    /// Shared, longest TTL.
    Durable,
}

impl TierLevel {
    /// All tiers, fastest first.
    pub const ALL: [Self; 3] = [Self::Hot, Self::Warm, Self::Durable];

    /// Lowercase name for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Durable => "durable",
        }
    }
}

impl fmt::Display for TierLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored cache record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Rendered key.
    pub key: String,
    /// Instrument.
    pub symbol: Symbol,
    /// Data class.
    pub data_class: DataClass,
    /// Payload schema version at write time.
    pub schema_version: u16,
    /// Validated payload.
    pub payload: MarketPayload,
    /// Exchange-side event time; last-writer-wins ordering.
    pub source_timestamp: DateTime<Utc>,
    /// When written to the tier-of-record.
    pub written_at: DateTime<Utc>,
    /// TTL assigned at the tier-of-record, in milliseconds.
    pub ttl_ms: u64,
    /// Authoritative tier.
    pub tier_of_record: TierLevel,
    /// Whether this copy is a disposable promotion.
    pub promoted: bool,
    /// Rendered keys this value was derived from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl CacheEntry {
    /// Assigned TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// When the tier-of-record copy expires.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_ms)
            .ok()
            .and_then(chrono::TimeDelta::try_milliseconds)
            .and_then(|ttl| self.written_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// TTL left at `now`; zero once expired.
    #[must_use]
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at() - now).to_std().unwrap_or_default()
    }

    /// Age from the exchange event time.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.source_timestamp).to_std().unwrap_or_default()
    }

    /// Copy marked as a promotion.
    #[must_use]
    pub fn promoted_copy(&self) -> Self {
        Self {
            promoted: true,
            ..self.clone()
        }
    }

    /// Encode for a shared tier.
    ///
    /// # Errors
    ///
    /// Returns a serde error if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from a shared tier.
    ///
    /// # Errors
    ///
    /// Returns a serde error if the bytes are not a valid entry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A value offered to the coordinator for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWrite {
    /// Target key.
    pub key: CacheKey,
    /// Schema version the producer encoded.
    pub schema_version: u16,
    /// Payload; its variant must match the key's data class.
    pub payload: MarketPayload,
    /// Exchange-side event time.
    pub source_timestamp: DateTime<Utc>,
    /// Keys this value was derived from.
    pub depends_on: Vec<CacheKey>,
}

impl CacheWrite {
    /// Write of a normalized market event to its `latest` key.
    #[must_use]
    pub fn from_event(namespace: &KeyNamespace, event: NormalizedEvent) -> Self {
        Self {
            key: CacheKey::latest(namespace, event.symbol, event.data_class),
            schema_version: event.schema_version,
            payload: event.payload,
            source_timestamp: event.source_timestamp,
            depends_on: Vec::new(),
        }
    }

    /// Declare the keys this value was derived from.
    #[must_use]
    pub fn depending_on(mut self, dependencies: impl IntoIterator<Item = CacheKey>) -> Self {
        self.depends_on.extend(dependencies);
        self
    }

    /// Data class of the target key.
    #[must_use]
    pub const fn data_class(&self) -> DataClass {
        self.key.data_class()
    }
}

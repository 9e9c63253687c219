//! Snapshot Ports (Driven Ports)
//!
//! Pull-side interfaces: the raw exchange REST call, the guarded fetch the
//! pipeline polls through while a stream is down, and the value source the
//! cache warmer refreshes keys from.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::cache::{CacheKey, CacheWrite};
use crate::domain::market::{DataClass, NormalizedEvent, Symbol};
use crate::error::IngestError;

/// Exchange REST failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Explicit throttling response.
    #[error("rate limited by exchange (retry after {retry_after:?})")]
    RateLimited {
        /// Server-suggested hold-off.
        retry_after: Option<Duration>,
    },

    /// Credentials rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success status or exchange error code.
    #[error("exchange returned {code}: {body}")]
    Status {
        /// HTTP status or exchange return code.
        code: i64,
        /// Response message.
        body: String,
    },

    /// The response could not be decoded into a payload.
    #[error("decode error: {0}")]
    Decode(String),

    /// The exchange returned no data for the symbol.
    #[error("no {data_class} data for {symbol}")]
    Empty {
        /// Instrument.
        symbol: Symbol,
        /// Requested class.
        data_class: DataClass,
    },

    /// The exchange has no REST endpoint for this class.
    #[error("{0} is not available over REST")]
    Unsupported(DataClass),
}

impl FetchError {
    /// Whether the failure counts against the REST circuit breaker.
    ///
    /// Caller mistakes and empty results say nothing about endpoint health.
    #[must_use]
    pub const fn counts_as_failure(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Transport(_) => true,
            Self::Status { code, .. } => *code >= 500,
            Self::Auth(_) | Self::Decode(_) | Self::Empty { .. } | Self::Unsupported(_) => false,
        }
    }
}

/// Raw exchange REST access.
#[async_trait]
pub trait ExchangeRest: Send + Sync {
    /// Exchange identifier.
    fn exchange(&self) -> &str;

    /// Fetch the current value of one data class.
    async fn fetch(&self, symbol: &Symbol, data_class: DataClass) -> Result<NormalizedEvent, FetchError>;
}

/// Fetch guarded by rate limiting and circuit breaking.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Fetch the current value of one data class.
    async fn fetch_snapshot(
        &self,
        symbol: &Symbol,
        data_class: DataClass,
    ) -> Result<NormalizedEvent, IngestError>;
}

/// Source of fresh values for cache warming.
#[async_trait]
pub trait WarmSource: Send + Sync {
    /// Produce a fresh value for `key`, or `None` when the key cannot be
    /// rebuilt from this source.
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheWrite>, IngestError>;
}

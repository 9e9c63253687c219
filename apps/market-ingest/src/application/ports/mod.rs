//! Application Ports (Driven)
//!
//! Interfaces the services use to reach cache stores and exchanges. Adapters
//! live in `infrastructure`; tests substitute in-memory fakes.

mod cache_tier_port;
mod snapshot_port;
mod stream_port;

#[cfg(test)]
pub use cache_tier_port::MockCacheTier;
pub use cache_tier_port::{CacheTier, TierError};
#[cfg(test)]
pub use snapshot_port::MockSnapshotFetcher;
pub use snapshot_port::{ExchangeRest, FetchError, SnapshotFetcher, WarmSource};
#[cfg(test)]
pub use stream_port::MockFeedHealth;
pub use stream_port::{EventSink, FeedHealth, StreamConnector, StreamError, StreamSession};

//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `CacheCoordinator`: Tier promotion, TTL hierarchy, cascade invalidation
//! - `CacheWarmer`: Scheduled refresh of the most-read keys
//! - `StreamSubscriptionManager`: Connection multiplexing and recovery
//! - `IngestionPipeline`: Validation, sharded writes, REST fallback, readiness
//! - `GuardedFetcher`: Rate-limited, circuit-broken REST access
//! - `MarketDataService`: Consumer-facing facade

mod cache_coordinator;
mod cache_warmer;
mod ingestion;
mod market_data;
mod rest_fallback;
mod stream_manager;

pub use cache_coordinator::{
    AccessTracker, CacheCoordinator, CacheError, CacheTiers, CascadeReport, ClassPolicy,
    CoordinatorConfig, Lookup, WriteOutcome,
};
pub use cache_warmer::{CacheWarmer, WarmPhase, WarmReport, WarmSchedule};
pub use ingestion::{IngestionConfig, IngestionPipeline, ReadinessError, ReadinessGate, ShardRouter};
pub use market_data::{ExchangeFeed, MarketDataService};
pub use rest_fallback::{FetcherSet, GuardedFetcher};
pub use stream_manager::{StreamManagerConfig, StreamSubscriptionManager};

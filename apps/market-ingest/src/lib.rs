#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Ingest - Resilient Market Data Ingestion
//!
//! Maintains push-stream connections to crypto exchanges, normalizes and
//! validates every update, and serves the latest value per instrument from
//! a three-tier cache. When a stream degrades the affected symbols are
//! polled over REST until it recovers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types with no I/O
//!   - `market`: Symbols, payload schemas, validation, snapshots
//!   - `subscription`: Consumer interest and connection assignment
//!   - `connection`: Connection health state machine
//!   - `cache`: Keys, entries, TTL hierarchy, dependency graph
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Cache tiers, stream sessions, REST access
//!   - `services`: Cache coordination, warming, subscriptions, ingestion
//!
//! - **Resilience**: Rate limiting, circuit breaking, reconnect backoff
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `exchange`: Bybit stream and REST adapters
//!   - `cache`: moka and Redis cache tiers
//!   - `pool`: Pooled HTTP clients
//!   - `config`: YAML configuration with env interpolation
//!   - `health`: Health, readiness, status and metrics endpoint
//!
//! # Data Flow
//!
//! ```text
//! Exchange WS ──► StreamSubscriptionManager ──► ShardRouter ──► CacheCoordinator
//!                        │ degraded                                  │
//!                        ▼                                           ├─► hot  (moka)
//! Exchange REST ◄── IngestionPipeline (fallback poll)                ├─► warm (redis)
//!        ▲                                                           └─► durable (redis)
//!        └──────── CacheWarmer (scheduled refresh) ◄────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Pure types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Resilience layer - Rate limits, circuit breakers, backoff.
pub mod resilience;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Error taxonomy.
pub mod error;

/// Service assembly.
pub mod app;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::cache::{CacheKey, KeyNamespace, TierLevel};
pub use domain::connection::{ConnectionHealth, ConnectionState};
pub use domain::market::{DataClass, FeedStatus, NormalizedEvent, SnapshotResult, Symbol};
pub use domain::subscription::ConsumerId;

// Services
pub use app::IngestService;
pub use application::services::{CacheCoordinator, MarketDataService};

// Errors
pub use error::{ErrorKind, IngestError};

// Infrastructure config
pub use infrastructure::config::{ConfigError, IngestConfig, load_config, load_config_from_string};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};

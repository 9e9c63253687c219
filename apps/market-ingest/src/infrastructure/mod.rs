//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus process-level concerns.

/// Cache tier stores (moka, Redis).
pub mod cache;

/// Exchange stream and REST adapters.
pub mod exchange;

/// Pooled client handles per exchange.
pub mod pool;

/// YAML configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;

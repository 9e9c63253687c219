//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Events**: Received, written, and dropped events by data class
//! - **Cache**: Hits by tier, misses, promotions, tier errors, cascades
//! - **Resilience**: Rate-limit waits, breaker states, reconnects
//! - **Ingestion**: Connections, subscriptions, fallback symbols, warming
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::cache::TierLevel;
use crate::domain::market::DataClass;
use crate::resilience::{CircuitBreakerState, EndpointKey};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Events
    describe_counter!(
        "market_ingest_events_received_total",
        "Normalized events received from exchange adapters"
    );
    describe_counter!(
        "market_ingest_events_written_total",
        "Events written to the cache tier-of-record"
    );
    describe_counter!(
        "market_ingest_events_dropped_total",
        "Events dropped by validation or ordering"
    );

    // Cache
    describe_counter!("market_ingest_cache_hits_total", "Cache hits by tier");
    describe_counter!(
        "market_ingest_cache_misses_total",
        "Reads that found no value in any tier"
    );
    describe_counter!(
        "market_ingest_cache_promotions_total",
        "Values promoted into a faster tier"
    );
    describe_counter!(
        "market_ingest_cache_tier_errors_total",
        "Tier operations that failed or timed out"
    );
    describe_counter!(
        "market_ingest_cache_cascade_deletions_total",
        "Keys removed by cascade invalidation"
    );

    // Resilience
    describe_histogram!(
        "market_ingest_rate_limit_wait_seconds",
        "Time callers were suspended by the rate limiter"
    );
    describe_counter!(
        "market_ingest_rate_limit_timeouts_total",
        "Acquisitions that could not be admitted before their deadline"
    );
    describe_counter!(
        "market_ingest_rate_limit_throttled_total",
        "Explicit throttling responses received from exchanges"
    );
    describe_gauge!(
        "market_ingest_circuit_breaker_state",
        "Breaker state (0 closed, 1 half-open, 2 open)"
    );
    describe_counter!(
        "market_ingest_circuit_breaker_transitions_total",
        "Breaker state transitions"
    );
    describe_counter!(
        "market_ingest_reconnects_total",
        "Stream reconnection attempts"
    );

    // Ingestion
    describe_gauge!(
        "market_ingest_connections",
        "Open stream connections per exchange"
    );
    describe_gauge!(
        "market_ingest_connection_subscriptions",
        "Active subscriptions per connection"
    );
    describe_gauge!(
        "market_ingest_fallback_symbols",
        "Symbols currently served by REST polling"
    );
    describe_counter!(
        "market_ingest_fallback_polls_total",
        "REST fallback polls by outcome"
    );
    describe_counter!(
        "market_ingest_warmed_keys_total",
        "Keys refreshed by the cache warmer"
    );
    describe_gauge!(
        "market_ingest_pool_idle_handles",
        "Idle pooled client handles per exchange"
    );
}

// =============================================================================
// Event Metrics
// =============================================================================

/// Record an event received from an exchange adapter.
pub fn record_event_received(exchange: &str, data_class: DataClass) {
    counter!(
        "market_ingest_events_received_total",
        "exchange" => exchange.to_string(),
        "data_class" => data_class.as_str()
    )
    .increment(1);
}

/// Record an event written to its tier-of-record.
pub fn record_event_written(data_class: DataClass) {
    counter!(
        "market_ingest_events_written_total",
        "data_class" => data_class.as_str()
    )
    .increment(1);
}

/// Record a dropped event.
pub fn record_event_dropped(data_class: DataClass, reason: &'static str) {
    counter!(
        "market_ingest_events_dropped_total",
        "data_class" => data_class.as_str(),
        "reason" => reason
    )
    .increment(1);
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a hit served by `tier`.
pub fn record_cache_hit(tier: TierLevel) {
    counter!("market_ingest_cache_hits_total", "tier" => tier.as_str()).increment(1);
}

/// Record a read that found nothing.
pub fn record_cache_miss() {
    counter!("market_ingest_cache_misses_total").increment(1);
}

/// Record a promotion into `tier`.
pub fn record_promotion(tier: TierLevel) {
    counter!("market_ingest_cache_promotions_total", "tier" => tier.as_str()).increment(1);
}

/// Record a failed tier operation.
pub fn record_tier_error(tier: TierLevel, operation: &'static str) {
    counter!(
        "market_ingest_cache_tier_errors_total",
        "tier" => tier.as_str(),
        "operation" => operation
    )
    .increment(1);
}

/// Record keys removed by a cascade.
pub fn record_cascade_deletions(count: usize) {
    counter!("market_ingest_cache_cascade_deletions_total").increment(count as u64);
}

// =============================================================================
// Resilience Metrics
// =============================================================================

/// Record how long a caller waited for a token.
pub fn record_rate_limit_wait(endpoint: &EndpointKey, waited: Duration) {
    histogram!(
        "market_ingest_rate_limit_wait_seconds",
        "endpoint" => endpoint.to_string()
    )
    .record(waited.as_secs_f64());
}

/// Record an acquisition that hit its deadline.
pub fn record_rate_limit_timeout(endpoint: &EndpointKey) {
    counter!(
        "market_ingest_rate_limit_timeouts_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record an explicit throttling response.
pub fn record_throttled(endpoint: &EndpointKey) {
    counter!(
        "market_ingest_rate_limit_throttled_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a breaker transition and publish the new state.
pub fn record_breaker_transition(breaker: &str, to: CircuitBreakerState) {
    let value = match to {
        CircuitBreakerState::Closed => 0.0,
        CircuitBreakerState::HalfOpen => 1.0,
        CircuitBreakerState::Open => 2.0,
    };
    gauge!("market_ingest_circuit_breaker_state", "breaker" => breaker.to_string()).set(value);
    counter!(
        "market_ingest_circuit_breaker_transitions_total",
        "breaker" => breaker.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Record a reconnect attempt.
pub fn record_reconnect(exchange: &str) {
    counter!("market_ingest_reconnects_total", "exchange" => exchange.to_string()).increment(1);
}

// =============================================================================
// Ingestion Metrics
// =============================================================================

/// Update the open connection count for an exchange.
#[allow(clippy::cast_precision_loss)]
pub fn set_connections(exchange: &str, count: usize) {
    gauge!("market_ingest_connections", "exchange" => exchange.to_string()).set(count as f64);
}

/// Update the subscription count on one connection.
#[allow(clippy::cast_precision_loss)]
pub fn set_connection_subscriptions(connection: u64, count: usize) {
    gauge!(
        "market_ingest_connection_subscriptions",
        "connection" => connection.to_string()
    )
    .set(count as f64);
}

/// Update the number of symbols in REST fallback.
#[allow(clippy::cast_precision_loss)]
pub fn set_fallback_symbols(count: usize) {
    gauge!("market_ingest_fallback_symbols").set(count as f64);
}

/// Record a REST fallback poll.
pub fn record_fallback_poll(exchange: &str, ok: bool) {
    counter!(
        "market_ingest_fallback_polls_total",
        "exchange" => exchange.to_string(),
        "outcome" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

/// Record keys refreshed in a warming cycle.
pub fn record_keys_warmed(phase: &str, count: usize) {
    counter!("market_ingest_warmed_keys_total", "phase" => phase.to_string())
        .increment(count as u64);
}

/// Update idle pooled handles for an exchange.
#[allow(clippy::cast_precision_loss)]
pub fn set_pool_idle(exchange: &str, count: usize) {
    gauge!("market_ingest_pool_idle_handles", "exchange" => exchange.to_string())
        .set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::EndpointClass;

    #[test]
    fn init_is_idempotent_and_renders_recorded_metrics() {
        let handle = init_metrics();
        let _again = init_metrics();
        assert!(get_metrics_handle().is_some());

        let endpoint = EndpointKey::new("bybit", EndpointClass::MarketRest);
        record_cache_hit(TierLevel::Hot);
        record_rate_limit_timeout(&endpoint);
        record_breaker_transition("bybit/stream", CircuitBreakerState::Open);

        let rendered = handle.render();
        assert!(rendered.contains("market_ingest_cache_hits_total"));
        assert!(rendered.contains("market_ingest_rate_limit_timeouts_total"));
        assert!(rendered.contains("market_ingest_circuit_breaker_state"));
    }
}

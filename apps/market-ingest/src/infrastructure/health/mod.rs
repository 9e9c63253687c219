//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, connection status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health: connections, breakers, fallback symbols, readiness
//! - `GET /healthz` - Kubernetes liveness check (simple OK)
//! - `GET /readyz` - Kubernetes readiness check (every subscribed symbol has data)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /status/{exchange}/{ticker}` - Feed status of one symbol; with
//!   `?class=ticker` also the cached snapshot

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::MarketDataService;
use crate::domain::connection::{ConnectionHealth, ConnectionState};
use crate::domain::market::{DataClass, FeedStatus, SnapshotResult, Symbol};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::resilience::{CircuitBreakerMetrics, CircuitBreakerRegistry, CircuitBreakerState};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Whether every subscribed symbol has data.
    pub ready: bool,
    /// Stream connections.
    pub connections: Vec<ConnectionInfo>,
    /// Circuit breakers.
    pub breakers: Vec<CircuitBreakerMetrics>,
    /// Symbols currently served by REST polling.
    pub fallback_symbols: Vec<String>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some systems degraded but functional.
    Degraded,
    /// Critical systems unavailable.
    Unhealthy,
}

/// One stream connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: u64,
    /// Exchange.
    pub exchange: String,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Active subscriptions.
    pub subscriptions: usize,
    /// Failures since the last healthy period.
    pub consecutive_failures: u32,
    /// Milliseconds since the last data message.
    pub idle_ms: Option<u64>,
    /// Most recent error.
    pub last_error: Option<String>,
}

impl From<&ConnectionHealth> for ConnectionInfo {
    fn from(health: &ConnectionHealth) -> Self {
        Self {
            id: health.connection,
            exchange: health.exchange.clone(),
            state: health.state,
            subscriptions: health.subscriptions,
            consecutive_failures: health.consecutive_failures,
            idle_ms: health
                .last_message_at
                .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
            last_error: health.last_error.clone(),
        }
    }
}

/// Per-symbol status response.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolStatusResponse {
    /// Symbol as `exchange:ticker`.
    pub symbol: String,
    /// Ingestion path.
    pub status: FeedStatus,
    /// Cached value, when a class was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotResult>,
}

/// Query of `/status/{exchange}/{ticker}`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StatusQuery {
    /// Data class to read.
    pub class: Option<DataClass>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    service: Arc<MarketDataService>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, service: Arc<MarketDataService>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            service,
            breakers,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    addr: SocketAddr,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(addr: SocketAddr, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self { addr, state, cancel }
    }

    /// Routes over `state`.
    pub fn router(state: Arc<HealthServerState>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .route("/status/{exchange}/{ticker}", get(symbol_status_handler))
            .with_state(state)
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Self::router(self.state);

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.addr, e.to_string()))?;

        tracing::info!(addr = %self.addr, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.service.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

async fn symbol_status_handler(
    State(state): State<Arc<HealthServerState>>,
    Path((exchange, ticker)): Path<(String, String)>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let symbol = match Symbol::new(&exchange, &ticker) {
        Ok(symbol) => symbol,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let snapshot = match query.class {
        Some(class) => Some(state.service.get_snapshot(&symbol, class).await),
        None => None,
    };

    Json(SymbolStatusResponse {
        symbol: symbol.to_string(),
        status: state.service.status(&symbol),
        snapshot,
    })
    .into_response()
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let connections = state.service.connections();
    let breakers = state.breakers.all_metrics();
    let fallback_symbols: Vec<String> = state
        .service
        .fallback_symbols()
        .iter()
        .map(ToString::to_string)
        .collect();

    HealthResponse {
        status: determine_health_status(&connections, &breakers, fallback_symbols.len()),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        ready: state.service.is_ready(),
        connections: connections.iter().map(ConnectionInfo::from).collect(),
        breakers,
        fallback_symbols,
    }
}

fn determine_health_status(
    connections: &[ConnectionHealth],
    breakers: &[CircuitBreakerMetrics],
    fallback_count: usize,
) -> HealthStatus {
    let live: Vec<&ConnectionHealth> = connections
        .iter()
        .filter(|c| c.state != ConnectionState::Closed)
        .collect();
    let healthy = live.iter().filter(|c| c.state.is_streaming()).count();
    let any_open = breakers.iter().any(|b| b.state == CircuitBreakerState::Open);

    if !live.is_empty() && healthy == 0 && fallback_count == 0 {
        HealthStatus::Unhealthy
    } else if healthy < live.len() || any_open || fallback_count > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::connection::HealthCell;

    fn connection(id: u64, state: ConnectionState) -> ConnectionHealth {
        let cell = HealthCell::new(id, "bybit");
        let mut health = cell.snapshot();
        health.state = state;
        health
    }

    fn breaker(state: CircuitBreakerState) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            name: "bybit/market_rest".to_string(),
            state,
            total_calls: 0,
            total_failures: 0,
            total_rejections: 0,
            state_transitions: 0,
            recent_failures: 0,
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(serde_json::to_string(&HealthStatus::Healthy).unwrap(), "\"healthy\"");
        assert_eq!(serde_json::to_string(&HealthStatus::Degraded).unwrap(), "\"degraded\"");
        assert_eq!(serde_json::to_string(&HealthStatus::Unhealthy).unwrap(), "\"unhealthy\"");
    }

    #[test]
    fn determine_status_all_healthy() {
        let connections = [connection(1, ConnectionState::Healthy), connection(2, ConnectionState::Healthy)];
        let status = determine_health_status(&connections, &[breaker(CircuitBreakerState::Closed)], 0);
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn determine_status_without_connections_is_healthy() {
        assert_eq!(determine_health_status(&[], &[], 0), HealthStatus::Healthy);
    }

    #[test]
    fn determine_status_partial() {
        let connections = [connection(1, ConnectionState::Healthy), connection(2, ConnectionState::Reconnecting)];
        assert_eq!(determine_health_status(&connections, &[], 0), HealthStatus::Degraded);

        let healthy = [connection(1, ConnectionState::Healthy)];
        assert_eq!(
            determine_health_status(&healthy, &[breaker(CircuitBreakerState::Open)], 0),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn determine_status_fallback_keeps_service_degraded() {
        let connections = [connection(1, ConnectionState::Reconnecting)];
        assert_eq!(determine_health_status(&connections, &[], 0), HealthStatus::Unhealthy);
        assert_eq!(determine_health_status(&connections, &[], 2), HealthStatus::Degraded);
    }

    #[test]
    fn closed_connections_are_ignored() {
        let connections = [connection(1, ConnectionState::Healthy), connection(2, ConnectionState::Closed)];
        assert_eq!(determine_health_status(&connections, &[], 0), HealthStatus::Healthy);
    }
}

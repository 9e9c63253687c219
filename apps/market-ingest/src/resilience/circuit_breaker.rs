//! Circuit breaker implementation for outbound exchange calls.
//!
//! Prevents cascading failures when an exchange endpoint becomes
//! unavailable or unresponsive. One breaker exists per
//! `(exchange, endpoint class)`.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN (failures >= threshold within the rolling window)
//! OPEN → HALF_OPEN (cool-down elapsed)
//! HALF_OPEN → CLOSED (the single trial call succeeds)
//! HALF_OPEN → OPEN (the trial call fails)
//! ```
//!
//! # Configuration
//!
//! - `failure_threshold`: Failures that open the circuit (default: 5)
//! - `failure_window`: Rolling window for counting failures (default: 60s)
//! - `cool_down`: Time to stay open (default: 30s)
//! - `call_timeout`: Maximum call duration; timeouts count as failures (default: 5s)
//!
//! # Example
//!
//! ```rust
//! use market_ingest::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new("bybit/market_rest", CircuitBreakerConfig::default());
//!
//! match breaker.call(|| async { Ok::<_, std::io::Error>(42) }).await {
//!     Ok(value) => assert_eq!(value, 42),
//!     Err(CircuitBreakerError::Open(_)) => { /* fail fast, serve last-known-good */ }
//!     Err(e) => eprintln!("call failed: {e}"),
//! }
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use super::EndpointKey;
use crate::infrastructure::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Circuit is closed, calls flow normally.
    Closed,
    /// Circuit is open, calls are rejected.
    Open,
    /// Circuit is admitting a single trial call.
    HalfOpen,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Rolling window for counting failures.
    pub failure_window: Duration,
    /// Duration to stay in `OPEN` state.
    pub cool_down: Duration,
    /// Maximum call duration before timeout.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cool_down: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Rejection while the circuit is open (or its trial slot is taken).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{breaker}' is open")]
pub struct CircuitOpenError {
    /// Breaker name.
    pub breaker: String,
    /// Time until a trial call may be admitted.
    pub retry_in: Duration,
}

/// Error from [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Rejected without invoking the call.
    #[error(transparent)]
    Open(CircuitOpenError),
    /// The call exceeded the breaker's timeout and was cancelled.
    #[error("call through '{breaker}' timed out after {after:?}")]
    Timeout {
        /// Breaker name.
        breaker: String,
        /// Timeout applied.
        after: Duration,
    },
    /// The call itself failed.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: CircuitBreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker for one outbound endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Breaker name for logging.
    name: String,
    /// Configuration.
    config: CircuitBreakerConfig,
    /// Mutable state.
    inner: Mutex<Inner>,
    /// Total admitted calls (for metrics).
    total_calls: AtomicU64,
    /// Total failures (for metrics).
    total_failures: AtomicU64,
    /// Calls rejected while open (for metrics).
    total_rejections: AtomicU64,
    /// State transitions (for metrics).
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    /// Get the breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state, applying any due `OPEN → HALF_OPEN` transition.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner, Instant::now());
        inner.state
    }

    /// Whether calls are currently rejected outright.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitBreakerState::Open
    }

    /// The rejection a caller would get right now, without taking a permit.
    #[must_use]
    pub fn open_error(&self) -> Option<CircuitOpenError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner, now);
        if inner.state != CircuitBreakerState::Open {
            return None;
        }
        let retry_in = inner.opened_at.map_or(Duration::ZERO, |opened| {
            self.config
                .cool_down
                .saturating_sub(now.saturating_duration_since(opened))
        });
        drop(inner);
        Some(CircuitOpenError {
            breaker: self.name.clone(),
            retry_in,
        })
    }

    /// Reserve the right to make one call.
    ///
    /// In `HALF_OPEN` only one permit exists at a time.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpenError`] while open or while the trial is taken.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner, now);

        let trial = match inner.state {
            CircuitBreakerState::Closed => false,
            CircuitBreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                true
            }
            CircuitBreakerState::Open | CircuitBreakerState::HalfOpen => {
                let retry_in = inner.opened_at.map_or(Duration::ZERO, |opened| {
                    self.config
                        .cool_down
                        .saturating_sub(now.saturating_duration_since(opened))
                });
                drop(inner);
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(CircuitOpenError {
                    breaker: self.name.clone(),
                    retry_in,
                });
            }
        };
        drop(inner);

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        Ok(CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Execute `f` under the breaker's timeout. Every error counts as a failure.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError::Open`] without invoking `f` when open,
    /// [`CircuitBreakerError::Timeout`] when `f` exceeds the call timeout,
    /// or [`CircuitBreakerError::Inner`] with `f`'s own error.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// Like [`Self::call`], but only errors for which `counts` returns true
    /// are recorded as failures; the rest settle the call as a success.
    ///
    /// # Errors
    ///
    /// See [`Self::call`].
    pub async fn call_classified<T, E, F, Fut>(
        &self,
        f: F,
        counts: impl Fn(&E) -> bool,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(CircuitBreakerError::Open)?;

        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(e)) => {
                if counts(&e) {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(CircuitBreakerError::Inner(e))
            }
            Err(_) => {
                permit.failure();
                Err(CircuitBreakerError::Timeout {
                    breaker: self.name.clone(),
                    after: self.config.call_timeout,
                })
            }
        }
    }

    /// Record a successful call.
    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed => {}
            CircuitBreakerState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitBreakerState::Closed, Instant::now());
            }
            CircuitBreakerState::HalfOpen | CircuitBreakerState::Open => {
                tracing::debug!(
                    name = %self.name,
                    state = %inner.state,
                    "Ignoring late success from a call admitted before the circuit opened"
                );
            }
        }
    }

    /// Record a failed call.
    fn record_failure(&self, trial: bool) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitBreakerState::Closed => {
                inner.failures.push_back(now);
                self.prune_failures(&mut inner, now);
                let threshold = usize::try_from(self.config.failure_threshold).unwrap_or(usize::MAX);
                if inner.failures.len() >= threshold {
                    self.transition(&mut inner, CircuitBreakerState::Open, now);
                }
            }
            CircuitBreakerState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitBreakerState::Open, now);
            }
            CircuitBreakerState::HalfOpen | CircuitBreakerState::Open => {
                tracing::debug!(
                    name = %self.name,
                    state = %inner.state,
                    "Ignoring late failure from a call admitted before the circuit opened"
                );
            }
        }
    }

    /// Release a trial permit that was never settled.
    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn prune_failures(&self, inner: &mut Inner, now: Instant) {
        while let Some(oldest) = inner.failures.front() {
            if now.saturating_duration_since(*oldest) > self.config.failure_window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Check for time-based state transitions (`OPEN` -> `HALF_OPEN`).
    fn check_state_transition(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitBreakerState::Open
            && let Some(opened) = inner.opened_at
            && now.saturating_duration_since(opened) >= self.config.cool_down
        {
            self.transition(inner, CircuitBreakerState::HalfOpen, now);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitBreakerState, now: Instant) {
        let previous = inner.state;
        if previous == to {
            return;
        }
        inner.state = to;

        match to {
            CircuitBreakerState::Open => {
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                tracing::warn!(
                    name = %self.name,
                    from = %previous,
                    to = "OPEN",
                    failures = inner.failures.len(),
                    cool_down_ms = self.config.cool_down.as_millis(),
                    "Circuit breaker opened"
                );
            }
            CircuitBreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                tracing::info!(
                    name = %self.name,
                    from = %previous,
                    to = "HALF_OPEN",
                    "Circuit breaker testing"
                );
            }
            CircuitBreakerState::Closed => {
                inner.failures.clear();
                inner.opened_at = None;
                tracing::info!(
                    name = %self.name,
                    from = %previous,
                    to = "CLOSED",
                    "Circuit breaker closed"
                );
            }
        }

        self.state_transitions.fetch_add(1, Ordering::Relaxed);
        metrics::record_breaker_transition(&self.name, to);
    }

    /// Get the call timeout for this circuit breaker.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.config.call_timeout
    }

    /// Get metrics for this circuit breaker.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state();
        let recent_failures = {
            let mut inner = self.inner.lock();
            self.prune_failures(&mut inner, Instant::now());
            inner.failures.len()
        };
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            recent_failures,
        }
    }

    /// Force the circuit breaker to open (for testing or emergency).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitBreakerState::Open, Instant::now());
    }

    /// Force the circuit breaker to close (for testing or recovery).
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitBreakerState::Closed, Instant::now());
    }
}

// =============================================================================
// Call Permit
// =============================================================================

/// Right to make one call through a breaker.
///
/// Settle with [`Self::success`] or [`Self::failure`]. A permit dropped
/// unsettled (cancelled call) releases the trial slot without recording an
/// outcome.
#[derive(Debug)]
#[must_use = "settle the permit with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this is the `HALF_OPEN` trial.
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record success.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    /// Record failure.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

// =============================================================================
// Metrics & Registry
// =============================================================================

/// Metrics for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitBreakerState,
    /// Total admitted calls.
    pub total_calls: u64,
    /// Total failures.
    pub total_failures: u64,
    /// Calls rejected while open.
    pub total_rejections: u64,
    /// Number of state transitions.
    pub state_transitions: u64,
    /// Failures inside the current rolling window.
    pub recent_failures: usize,
}

/// Lazily created breakers, one per `(exchange, endpoint class)`.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    exchange_overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<EndpointKey, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry using `default_config` for every endpoint.
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            exchange_overrides: HashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Use `config` for every endpoint of `exchange`.
    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.exchange_overrides.insert(exchange.into(), config);
        self
    }

    /// Breaker for an endpoint, created on first use.
    #[must_use]
    pub fn get(&self, endpoint: &EndpointKey) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(endpoint) {
            return Arc::clone(&breaker);
        }
        let config = self
            .exchange_overrides
            .get(&endpoint.exchange)
            .unwrap_or(&self.default_config)
            .clone();
        Arc::clone(
            &self
                .breakers
                .entry(endpoint.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint.to_string(), config))),
        )
    }

    /// Current state of an endpoint's breaker (`CLOSED` if never used).
    #[must_use]
    pub fn state(&self, endpoint: &EndpointKey) -> CircuitBreakerState {
        self.breakers
            .get(endpoint)
            .map_or(CircuitBreakerState::Closed, |b| b.state())
    }

    /// Get all metrics, sorted by name.
    #[must_use]
    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let mut metrics: Vec<_> = self.breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }
}

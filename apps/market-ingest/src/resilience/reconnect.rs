//! Reconnection Policy
//!
//! Exponential backoff with jitter for push-stream reconnects:
//! `base * 2^attempt`, capped, then randomized by `± jitter_factor`. The
//! jittered delay never exceeds the cap, so the time to recover coverage is
//! bounded by `cap` per cycle.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub base: Duration,
    /// Maximum delay between reconnection attempts.
    pub cap: Duration,
    /// Jitter factor as a fraction (e.g., 0.2 = ±20% randomization).
    pub jitter_factor: f64,
    /// Maximum consecutive attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter_factor: 0.2,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Un-jittered delay for a zero-based attempt: `min(base * 2^attempt, cap)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Jittered delay for a zero-based attempt, clamped to `[1ms, cap]`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return delay;
        }

        let base_secs = delay.as_secs_f64();
        let spread = base_secs * jitter;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((base_secs + offset).max(0.001)).min(self.cap)
    }
}

/// Reconnection policy tracking consecutive attempts.
///
/// # Example
///
/// ```rust
/// use market_ingest::resilience::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// // Delay before the first retry
/// assert!(policy.next_delay().is_some());
///
/// // Connection came back
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Get the next delay, or `None` once max attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        let delay = self.config.delay_for(self.attempt_count);
        self.attempt_count += 1;
        Some(delay)
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if reconnection should continue.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    /// Configuration in force.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }
}

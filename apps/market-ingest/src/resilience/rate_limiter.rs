//! Token-bucket rate limiter.
//!
//! One pair of buckets (per-second and per-minute) per
//! `(exchange, endpoint class)`. A call is admitted only when both buckets
//! hold a token, so the stricter limit always wins.
//!
//! # Admission
//!
//! ```text
//! wait = max(0, (1 - tokens) / refill_rate)   per bucket
//! wait = max(second.wait, minute.wait, throttle hold-off)
//! ```
//!
//! [`RateLimiter::acquire`] sleeps the computed wait on the tokio timer and
//! re-checks; it never spins and never blocks other tasks. Without a
//! deadline it is a pure throttle: every caller is eventually admitted.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use super::EndpointKey;
use crate::infrastructure::metrics;

/// Rate-limit failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// The caller's deadline elapses before a token would be available.
    #[error("rate limit wait for {endpoint} exceeds deadline ({needed:?} needed, {deadline:?} allowed)")]
    Timeout {
        /// Endpoint.
        endpoint: EndpointKey,
        /// Total wait the caller would need.
        needed: Duration,
        /// Caller's deadline.
        deadline: Duration,
    },
}

/// Requests per second and per minute for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Per-second limit (bucket capacity and refill per second).
    pub per_second: u32,
    /// Per-minute limit (bucket capacity and refill per minute).
    pub per_minute: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            per_second: 10,
            per_minute: 600,
        }
    }
}

impl RateLimitPolicy {
    /// Create a policy. Zero limits are raised to one.
    #[must_use]
    pub fn new(per_second: u32, per_minute: u32) -> Self {
        Self {
            per_second: per_second.max(1),
            per_minute: per_minute.max(1),
        }
    }
}

// =============================================================================
// Token Bucket
// =============================================================================

/// Continuously refilling token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Full bucket holding `capacity` tokens, refilling `capacity` per `period`.
    #[must_use]
    pub fn new(capacity: u32, period: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / period.as_secs_f64().max(f64::EPSILON),
            last_refill: Instant::now(),
        }
    }

    /// Add tokens accrued since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed.mul_add(self.refill_per_sec, self.tokens).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until one whole token is available; zero if one is available now.
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        let deficit = 1.0 - self.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.refill_per_sec)
        }
    }

    /// Take one token. Caller checks [`Self::wait_time`] first.
    pub fn take(&mut self) {
        self.tokens -= 1.0;
    }

    /// Empty the bucket.
    pub const fn drain(&mut self) {
        self.tokens = 0.0;
    }

    /// Tokens currently available.
    #[must_use]
    pub const fn available(&self) -> f64 {
        self.tokens
    }

    /// Bucket capacity.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[derive(Debug)]
struct BucketPair {
    second: TokenBucket,
    minute: TokenBucket,
    blocked_until: Option<Instant>,
}

impl BucketPair {
    fn new(policy: RateLimitPolicy) -> Self {
        Self {
            second: TokenBucket::new(policy.per_second, Duration::from_secs(1)),
            minute: TokenBucket::new(policy.per_minute, Duration::from_secs(60)),
            blocked_until: None,
        }
    }

    /// Admit now, or report how long until admission is possible.
    fn poll(&mut self, now: Instant) -> Result<(), Duration> {
        self.second.refill(now);
        self.minute.refill(now);

        let hold = self
            .blocked_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now));
        if hold.is_zero() {
            self.blocked_until = None;
        }

        let wait = self.second.wait_time().max(self.minute.wait_time()).max(hold);
        if wait.is_zero() {
            self.second.take();
            self.minute.take();
            Ok(())
        } else {
            Err(wait)
        }
    }
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Per-endpoint token-bucket admission control.
#[derive(Debug)]
pub struct RateLimiter {
    default_policy: RateLimitPolicy,
    policies: DashMap<EndpointKey, RateLimitPolicy>,
    buckets: DashMap<EndpointKey, Mutex<BucketPair>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}

impl RateLimiter {
    /// Create a limiter; endpoints without an explicit policy use `default_policy`.
    #[must_use]
    pub fn new(default_policy: RateLimitPolicy) -> Self {
        Self {
            default_policy,
            policies: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    /// Set the policy for one endpoint, resetting its buckets.
    pub fn set_policy(&self, endpoint: EndpointKey, policy: RateLimitPolicy) {
        self.buckets.remove(&endpoint);
        self.policies.insert(endpoint, policy);
    }

    /// Policy in force for an endpoint.
    #[must_use]
    pub fn policy(&self, endpoint: &EndpointKey) -> RateLimitPolicy {
        self.policies
            .get(endpoint)
            .map_or(self.default_policy, |p| *p)
    }

    /// Suspend until a token is available, then take it.
    ///
    /// Returns how long the caller waited.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Timeout`] as soon as the required wait is
    /// known to exceed `deadline`. No token is consumed in that case.
    pub async fn acquire(
        &self,
        endpoint: &EndpointKey,
        deadline: Option<Duration>,
    ) -> Result<Duration, RateLimitError> {
        let start = Instant::now();
        loop {
            let now = Instant::now();
            let waited = now.saturating_duration_since(start);
            let wait = match self.poll(endpoint, now) {
                Ok(()) => {
                    if !waited.is_zero() {
                        metrics::record_rate_limit_wait(endpoint, waited);
                    }
                    return Ok(waited);
                }
                Err(wait) => wait,
            };

            if let Some(deadline) = deadline {
                let needed = waited + wait;
                if needed > deadline {
                    metrics::record_rate_limit_timeout(endpoint);
                    tracing::debug!(
                        endpoint = %endpoint,
                        needed_ms = needed.as_millis(),
                        deadline_ms = deadline.as_millis(),
                        "Rate limit deadline exceeded"
                    );
                    return Err(RateLimitError::Timeout {
                        endpoint: endpoint.clone(),
                        needed,
                        deadline,
                    });
                }
            }

            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token if one is available right now.
    #[must_use]
    pub fn try_acquire(&self, endpoint: &EndpointKey) -> bool {
        self.poll(endpoint, Instant::now()).is_ok()
    }

    /// Exchange reported throttling: drain both buckets and hold off for
    /// `retry_after` (if given) so the next admission waits for a real refill.
    pub fn on_throttled(&self, endpoint: &EndpointKey, retry_after: Option<Duration>) {
        metrics::record_throttled(endpoint);
        let now = Instant::now();
        self.with_pair(endpoint, |pair| {
            pair.second.refill(now);
            pair.minute.refill(now);
            pair.second.drain();
            pair.minute.drain();
            if let Some(retry_after) = retry_after {
                let until = now + retry_after;
                pair.blocked_until = Some(pair.blocked_until.map_or(until, |b| b.max(until)));
            }
        });
        tracing::warn!(
            endpoint = %endpoint,
            retry_after_ms = retry_after.map(|d| d.as_millis()),
            "Exchange throttled requests"
        );
    }

    /// Tokens available in the (per-second, per-minute) buckets.
    #[must_use]
    pub fn available(&self, endpoint: &EndpointKey) -> (f64, f64) {
        let now = Instant::now();
        self.with_pair(endpoint, |pair| {
            pair.second.refill(now);
            pair.minute.refill(now);
            (pair.second.available(), pair.minute.available())
        })
    }

    fn poll(&self, endpoint: &EndpointKey, now: Instant) -> Result<(), Duration> {
        self.with_pair(endpoint, |pair| pair.poll(now))
    }

    fn with_pair<R>(&self, endpoint: &EndpointKey, f: impl FnOnce(&mut BucketPair) -> R) -> R {
        if let Some(entry) = self.buckets.get(endpoint) {
            return f(&mut entry.lock());
        }
        let policy = self.policy(endpoint);
        let entry = self
            .buckets
            .entry(endpoint.clone())
            .or_insert_with(|| Mutex::new(BucketPair::new(policy)));
        let result = f(&mut entry.lock());
        drop(entry);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::EndpointClass;

    fn endpoint() -> EndpointKey {
        EndpointKey::new("bybit", EndpointClass::MarketRest)
    }

    // The tokio timer has millisecond resolution.
    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(diff <= Duration::from_millis(5), "{actual:?} != {expected:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_continuously() {
        let mut bucket = TokenBucket::new(10, Duration::from_secs(1));
        for _ in 0..10 {
            bucket.take();
        }
        assert_close(bucket.wait_time(), Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(250)).await;
        bucket.refill(Instant::now());
        assert!((bucket.available() - 2.5).abs() < 1e-9);
        assert_eq!(bucket.wait_time(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_fails_when_empty() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(2, 100));
        assert!(limiter.try_acquire(&endpoint()));
        assert!(limiter.try_acquire(&endpoint()));
        assert!(!limiter.try_acquire(&endpoint()));
    }

    #[tokio::test(start_paused = true)]
    async fn stricter_bucket_wins() {
        // Per-second allows 10, per-minute only 3.
        let limiter = RateLimiter::new(RateLimitPolicy::new(10, 3));
        for _ in 0..3 {
            assert!(limiter.try_acquire(&endpoint()));
        }
        assert!(!limiter.try_acquire(&endpoint()));

        // One minute-bucket token takes 20s to refill.
        let waited = limiter.acquire(&endpoint(), None).await.unwrap();
        assert_close(waited, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_reported_not_ignored() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, 60));
        limiter.acquire(&endpoint(), None).await.unwrap();

        let err = limiter
            .acquire(&endpoint(), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));

        // Timed-out callers consume nothing.
        let waited = limiter
            .acquire(&endpoint(), Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_close(waited, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_drains_and_holds_off() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(100, 6_000));
        limiter.on_throttled(&endpoint(), Some(Duration::from_secs(5)));
        assert!(!limiter.try_acquire(&endpoint()));

        let waited = limiter.acquire(&endpoint(), None).await.unwrap();
        assert_close(waited, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn endpoints_are_independent() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, 60));
        let stream = EndpointKey::new("bybit", EndpointClass::Stream);
        assert!(limiter.try_acquire(&endpoint()));
        assert!(limiter.try_acquire(&stream));
        assert!(!limiter.try_acquire(&endpoint()));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_policy_overrides_default() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, 60));
        limiter.set_policy(endpoint(), RateLimitPolicy::new(5, 300));
        for _ in 0..5 {
            assert!(limiter.try_acquire(&endpoint()));
        }
        assert_eq!(limiter.policy(&endpoint()).per_second, 5);
    }
}

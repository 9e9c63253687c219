//! Connection Pool
//!
//! Bounded, reusable client handles per exchange.
//!
//! - At most `max_size` handles are checked out at once; further callers
//!   wait up to `acquire_timeout` for one to come back.
//! - Handles are created lazily and reused most-recently-returned first.
//! - A handle idle longer than `max_idle` is evicted on the next checkout
//!   and by a background reaper, then replaced on demand.
//! - No handle is issued while the owning circuit breaker is open.
//!
//! [`PooledHandle`] returns its handle on drop, so every exit path of the
//! caller (including `?` and cancellation) releases it.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::infrastructure::metrics;
use crate::resilience::{CircuitBreaker, CircuitOpenError};

// =============================================================================
// Errors and Configuration
// =============================================================================

/// Pool failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The owning circuit breaker is open.
    #[error(transparent)]
    BreakerOpen(#[from] CircuitOpenError),

    /// No handle came back within the acquire timeout.
    #[error("no {exchange} handle available within {after:?}")]
    AcquireTimeout {
        /// Exchange.
        exchange: String,
        /// Timeout applied.
        after: Duration,
    },

    /// The factory failed to build a handle.
    #[error("failed to create {exchange} handle: {reason}")]
    Create {
        /// Exchange.
        exchange: String,
        /// Error details.
        reason: String,
    },

    /// The pool was shut down.
    #[error("connection pool closed")]
    Closed,
}

impl PoolError {
    /// Classify for handling.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::BreakerOpen(_) => ErrorKind::CircuitOpen,
            Self::AcquireTimeout { .. } | Self::Create { .. } | Self::Closed => ErrorKind::Transient,
        }
    }
}

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum handles checked out at once.
    pub max_size: usize,
    /// Idle lifetime after which a handle is replaced.
    pub max_idle: Duration,
    /// How long `acquire` waits for a free slot.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            max_idle: Duration::from_secs(90),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Builds client handles for one exchange.
#[async_trait]
pub trait HandleFactory: Send + Sync + 'static {
    /// Handle type; cloning must be cheap (a shared client).
    type Handle: Clone + Send + Sync + 'static;

    /// Build a new handle.
    async fn create(&self) -> Result<Self::Handle, PoolError>;

    /// Whether an idle handle can still be used.
    fn is_valid(&self, _handle: &Self::Handle) -> bool {
        true
    }
}

/// Point-in-time pool usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Exchange.
    pub exchange: String,
    /// Configured maximum.
    pub max_size: usize,
    /// Handles currently checked out.
    pub in_use: usize,
    /// Handles waiting for reuse.
    pub idle: usize,
    /// Handles created over the pool's lifetime.
    pub created: u64,
    /// Handles evicted as stale or invalid.
    pub evicted: u64,
}

// =============================================================================
// Pool
// =============================================================================

struct IdleHandle<H> {
    id: Uuid,
    handle: H,
    idle_since: Instant,
}

/// Bounded handle pool for one exchange.
pub struct ConnectionPool<F: HandleFactory> {
    exchange: String,
    factory: F,
    breaker: Arc<CircuitBreaker>,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleHandle<F::Handle>>>,
    created: AtomicU64,
    evicted: AtomicU64,
}

impl<F: HandleFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("exchange", &self.exchange)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<F: HandleFactory> ConnectionPool<F> {
    /// Create an empty pool; handles are built on first use.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        factory: F,
        breaker: Arc<CircuitBreaker>,
        config: PoolConfig,
    ) -> Self {
        let max_size = config.max_size.max(1);
        Self {
            exchange: exchange.into(),
            factory,
            breaker,
            config: PoolConfig { max_size, ..config },
            slots: Arc::new(Semaphore::new(max_size)),
            idle: Mutex::new(VecDeque::new()),
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Exchange served.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Check out a handle.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::BreakerOpen`] while the breaker is open,
    /// [`PoolError::AcquireTimeout`] if every handle stays checked out past
    /// the acquire timeout, or the factory's error.
    pub async fn acquire(&self) -> Result<PooledHandle<'_, F>, PoolError> {
        if let Some(open) = self.breaker.open_error() {
            return Err(PoolError::BreakerOpen(open));
        }

        let permit = tokio::time::timeout(self.config.acquire_timeout, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| PoolError::AcquireTimeout {
                exchange: self.exchange.clone(),
                after: self.config.acquire_timeout,
            })?
            .map_err(|_| PoolError::Closed)?;

        if let Some(open) = self.breaker.open_error() {
            return Err(PoolError::BreakerOpen(open));
        }

        let (id, handle) = match self.take_idle() {
            Some(idle) => (idle.id, idle.handle),
            None => {
                let handle = self.factory.create().await?;
                self.created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(exchange = %self.exchange, "Created pooled handle");
                (Uuid::new_v4(), handle)
            }
        };

        Ok(PooledHandle {
            pool: self,
            id,
            handle,
            discard: false,
            _permit: permit,
        })
    }

    /// Drop idle handles past `max_idle`. Returns how many were evicted.
    pub fn evict_stale(&self) -> usize {
        let now = Instant::now();
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|h| now.saturating_duration_since(h.idle_since) <= self.config.max_idle);
        let evicted = before - idle.len();
        let remaining = idle.len();
        drop(idle);

        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(exchange = %self.exchange, evicted, "Evicted stale pooled handles");
        }
        metrics::set_pool_idle(&self.exchange, remaining);
        evicted
    }

    /// Usage snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            exchange: self.exchange.clone(),
            max_size: self.config.max_size,
            in_use: self.config.max_size - self.slots.available_permits(),
            idle: self.idle.lock().len(),
            created: self.created.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Refuse further checkouts; waiting callers get [`PoolError::Closed`].
    pub fn close(&self) {
        self.slots.close();
        self.idle.lock().clear();
    }

    fn take_idle(&self) -> Option<IdleHandle<F::Handle>> {
        let now = Instant::now();
        let mut idle = self.idle.lock();
        while let Some(candidate) = idle.pop_back() {
            let stale = now.saturating_duration_since(candidate.idle_since) > self.config.max_idle;
            if stale || !self.factory.is_valid(&candidate.handle) {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            return Some(candidate);
        }
        None
    }

    fn give_back(&self, id: Uuid, handle: F::Handle) {
        if self.slots.is_closed() {
            return;
        }
        self.idle.lock().push_back(IdleHandle {
            id,
            handle,
            idle_since: Instant::now(),
        });
    }
}

impl<F: HandleFactory> ConnectionPool<F> {
    /// Spawn the reaper that evicts stale handles every `max_idle / 2`.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = (pool.config.max_idle / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!(exchange = %pool.exchange, "Pool reaper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        pool.evict_stale();
                    }
                }
            }
        })
    }
}

// =============================================================================
// Scoped Handle
// =============================================================================

/// A checked-out handle; returned to the pool on drop.
pub struct PooledHandle<'a, F: HandleFactory> {
    pool: &'a ConnectionPool<F>,
    id: Uuid,
    handle: F::Handle,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl<F: HandleFactory> PooledHandle<'_, F> {
    /// Stable id of the underlying handle.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Do not return this handle to the pool; a fresh one replaces it.
    pub const fn discard(&mut self) {
        self.discard = true;
    }
}

impl<F: HandleFactory> std::fmt::Debug for PooledHandle<'_, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("exchange", &self.pool.exchange)
            .field("id", &self.id)
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}

impl<F: HandleFactory> Deref for PooledHandle<'_, F> {
    type Target = F::Handle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<F: HandleFactory> Drop for PooledHandle<'_, F> {
    fn drop(&mut self) {
        if self.discard {
            self.pool.evicted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pool.give_back(self.id, self.handle.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::resilience::CircuitBreakerConfig;

    #[derive(Default)]
    struct CountingFactory {
        built: AtomicUsize,
    }

    #[async_trait]
    impl HandleFactory for CountingFactory {
        type Handle = usize;

        async fn create(&self) -> Result<usize, PoolError> {
            Ok(self.built.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn pool(config: PoolConfig) -> ConnectionPool<CountingFactory> {
        let breaker = Arc::new(CircuitBreaker::new("bybit/market_rest", CircuitBreakerConfig::default()));
        ConnectionPool::new("bybit", CountingFactory::default(), breaker, config)
    }

    #[tokio::test]
    async fn handles_are_reused() {
        let pool = pool(PoolConfig::default());
        let first_id = {
            let handle = pool.acquire().await.unwrap();
            assert_eq!(*handle, 0);
            handle.id()
        };
        let handle = pool.acquire().await.unwrap();
        assert_eq!(*handle, 0);
        assert_eq!(handle.id(), first_id);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn handle_is_released_on_error_path() {
        let pool = pool(PoolConfig {
            max_size: 1,
            ..PoolConfig::default()
        });

        async fn failing_call(pool: &ConnectionPool<CountingFactory>) -> Result<(), PoolError> {
            let _handle = pool.acquire().await?;
            Err(PoolError::Closed)
        }

        assert!(failing_call(&pool).await.is_err());
        assert_eq!(pool.stats().in_use, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_exhausted() {
        let pool = pool(PoolConfig {
            max_size: 1,
            acquire_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        });
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::AcquireTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_handles_are_replaced() {
        let pool = pool(PoolConfig {
            max_idle: Duration::from_secs(10),
            ..PoolConfig::default()
        });
        drop(pool.acquire().await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(pool.evict_stale(), 1);

        let handle = pool.acquire().await.unwrap();
        assert_eq!(*handle, 1);
        assert_eq!(pool.stats().evicted, 1);
    }

    #[tokio::test]
    async fn discarded_handle_is_not_reused() {
        let pool = pool(PoolConfig::default());
        {
            let mut handle = pool.acquire().await.unwrap();
            handle.discard();
        }
        assert_eq!(*pool.acquire().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn open_breaker_blocks_checkout() {
        let pool = pool(PoolConfig::default());
        pool.breaker.force_open();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::BreakerOpen(_)));
        assert_eq!(pool.stats().created, 0);
    }
}

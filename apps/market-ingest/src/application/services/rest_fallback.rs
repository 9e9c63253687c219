//! Guarded REST Fetch
//!
//! Wraps raw exchange REST access with the `(exchange, MARKET_REST)` rate
//! limiter and circuit breaker. The ingestion pipeline polls through it
//! while a stream is down; the cache warmer loads `latest` keys through it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::application::ports::{ExchangeRest, FetchError, SnapshotFetcher, WarmSource};
use crate::domain::cache::{Bucket, CacheKey, CacheWrite, KeyDomain, KeyNamespace};
use crate::domain::market::{DataClass, NormalizedEvent, Symbol};
use crate::error::IngestError;
use crate::resilience::{
    CircuitBreakerError, CircuitBreakerRegistry, EndpointClass, EndpointKey, RateLimiter,
};

/// Exchange REST calls behind the limiter and breaker.
pub struct GuardedFetcher {
    rest: Arc<dyn ExchangeRest>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    namespace: KeyNamespace,
    deadline: Duration,
}

impl std::fmt::Debug for GuardedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedFetcher")
            .field("exchange", &self.rest.exchange())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl GuardedFetcher {
    /// Create a fetcher. `deadline` bounds the wait for a rate-limit token.
    #[must_use]
    pub fn new(
        rest: Arc<dyn ExchangeRest>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        namespace: KeyNamespace,
        deadline: Duration,
    ) -> Self {
        Self {
            rest,
            limiter,
            breakers,
            namespace,
            deadline,
        }
    }

    /// Endpoint key the fetcher is limited under.
    #[must_use]
    pub fn endpoint(&self) -> EndpointKey {
        EndpointKey::new(self.rest.exchange(), EndpointClass::MarketRest)
    }
}

#[async_trait]
impl SnapshotFetcher for GuardedFetcher {
    async fn fetch_snapshot(
        &self,
        symbol: &Symbol,
        data_class: DataClass,
    ) -> Result<NormalizedEvent, IngestError> {
        let endpoint = self.endpoint();
        let breaker = self.breakers.get(&endpoint);

        // Reject before spending a token on a call that cannot go out.
        if let Some(open) = breaker.open_error() {
            return Err(open.into());
        }
        self.limiter.acquire(&endpoint, Some(self.deadline)).await?;

        let rest = Arc::clone(&self.rest);
        let result = breaker
            .call_classified(
                || async move { rest.fetch(symbol, data_class).await },
                FetchError::counts_as_failure,
            )
            .await;

        if let Err(CircuitBreakerError::Inner(FetchError::RateLimited { retry_after })) = &result {
            self.limiter.on_throttled(&endpoint, *retry_after);
            tracing::warn!(
                endpoint = %endpoint,
                retry_after_ms = retry_after.map(|d| d.as_millis()),
                "Exchange throttled REST request"
            );
        }
        result.map_err(IngestError::from)
    }
}

#[async_trait]
impl WarmSource for GuardedFetcher {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheWrite>, IngestError> {
        let KeyDomain::Market(data_class) = key.domain() else {
            return Ok(None);
        };
        if key.bucket() != Bucket::Latest || key.symbol().exchange() != self.rest.exchange() {
            return Ok(None);
        }
        match self.fetch_snapshot(key.symbol(), *data_class).await {
            Ok(event) => Ok(Some(CacheWrite::from_event(&self.namespace, event))),
            Err(IngestError::Fetch(FetchError::Unsupported(_))) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

/// Warm source routing each key to the fetcher of its exchange.
#[derive(Debug, Default)]
pub struct FetcherSet {
    fetchers: HashMap<String, Arc<GuardedFetcher>>,
}

impl FetcherSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the fetcher for its exchange, replacing any previous one.
    pub fn insert(&mut self, fetcher: Arc<GuardedFetcher>) {
        self.fetchers.insert(fetcher.rest.exchange().to_string(), fetcher);
    }

    /// Fetcher for `exchange`.
    #[must_use]
    pub fn get(&self, exchange: &str) -> Option<&Arc<GuardedFetcher>> {
        self.fetchers.get(exchange)
    }
}

#[async_trait]
impl WarmSource for FetcherSet {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheWrite>, IngestError> {
        match self.fetchers.get(key.symbol().exchange()) {
            Some(fetcher) => fetcher.load(key).await,
            None => Ok(None),
        }
    }
}

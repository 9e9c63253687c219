//! Market Data Service
//!
//! Consumer-facing surface: snapshot reads, interest declaration, per-symbol
//! feed status and the readiness gate. Reads never trigger a live fetch;
//! they only consult the cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::try_join_all;

use super::cache_coordinator::CacheCoordinator;
use super::ingestion::IngestionPipeline;
use super::stream_manager::StreamSubscriptionManager;
use crate::domain::connection::ConnectionHealth;
use crate::domain::market::{DataClass, FeedStatus, SnapshotResult, Symbol, ValidationError};
use crate::domain::subscription::ConsumerId;
use crate::error::IngestError;

/// Stream manager and pipeline serving one exchange.
#[derive(Debug, Clone)]
pub struct ExchangeFeed {
    /// Push-stream subscriptions.
    pub manager: Arc<StreamSubscriptionManager>,
    /// Validation, cache writes and REST fallback.
    pub pipeline: Arc<IngestionPipeline>,
}

/// Consumer API over the ingestion core.
#[derive(Debug)]
pub struct MarketDataService {
    coordinator: Arc<CacheCoordinator>,
    feeds: BTreeMap<String, ExchangeFeed>,
    next_consumer: AtomicU64,
}

impl MarketDataService {
    /// Create the service. Feeds are keyed by exchange identifier.
    #[must_use]
    pub fn new(coordinator: Arc<CacheCoordinator>, feeds: impl IntoIterator<Item = ExchangeFeed>) -> Self {
        let feeds = feeds
            .into_iter()
            .map(|feed| (feed.manager.exchange().to_string(), feed))
            .collect();
        Self {
            coordinator,
            feeds,
            next_consumer: AtomicU64::new(1),
        }
    }

    /// Allocate an identifier for a new consumer.
    pub fn register_consumer(&self) -> ConsumerId {
        self.next_consumer.fetch_add(1, Ordering::Relaxed)
    }

    /// Latest cached value of `data_class` for `symbol`.
    pub async fn get_snapshot(&self, symbol: &Symbol, data_class: DataClass) -> SnapshotResult {
        self.coordinator.get_snapshot(symbol, data_class).await
    }

    /// Declare interest in `symbols`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if any symbol belongs to an exchange with
    /// no configured feed; nothing is subscribed in that case.
    pub fn subscribe(&self, consumer: ConsumerId, symbols: &[Symbol]) -> Result<(), IngestError> {
        let grouped = self.group(symbols)?;
        for (feed, symbols) in grouped {
            feed.manager.subscribe(consumer, &symbols)?;
        }
        Ok(())
    }

    /// Withdraw interest in `symbols`. Unknown exchanges are ignored.
    pub fn unsubscribe(&self, consumer: ConsumerId, symbols: &[Symbol]) {
        for symbol in symbols {
            if let Some(feed) = self.feeds.get(symbol.exchange()) {
                feed.manager.unsubscribe(consumer, std::slice::from_ref(symbol));
            }
        }
    }

    /// Withdraw all of `consumer`'s interest.
    pub fn remove_consumer(&self, consumer: ConsumerId) {
        for feed in self.feeds.values() {
            feed.manager.remove_consumer(consumer);
        }
    }

    /// How `symbol` is currently fed.
    #[must_use]
    pub fn status(&self, symbol: &Symbol) -> FeedStatus {
        self.feeds
            .get(symbol.exchange())
            .map_or(FeedStatus::Unavailable, |feed| feed.pipeline.status(symbol))
    }

    /// Resolve once every subscribed symbol has data, across all feeds.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::NotReady`] if any feed misses the deadline.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), IngestError> {
        try_join_all(
            self.feeds
                .values()
                .map(|feed| feed.pipeline.wait_until_ready(timeout)),
        )
        .await?;
        Ok(())
    }

    /// Whether every feed has reached readiness.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.feeds.values().all(|feed| feed.pipeline.is_ready())
    }

    /// Health of every connection, by exchange.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionHealth> {
        self.feeds
            .values()
            .flat_map(|feed| feed.manager.connections())
            .collect()
    }

    /// Symbols polled over REST, across all feeds.
    #[must_use]
    pub fn fallback_symbols(&self) -> Vec<Symbol> {
        self.feeds
            .values()
            .flat_map(|feed| feed.pipeline.fallback_symbols())
            .collect()
    }

    /// Configured feeds.
    #[must_use]
    pub const fn feeds(&self) -> &BTreeMap<String, ExchangeFeed> {
        &self.feeds
    }

    /// Cache coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<CacheCoordinator> {
        &self.coordinator
    }

    fn group(&self, symbols: &[Symbol]) -> Result<Vec<(&ExchangeFeed, Vec<Symbol>)>, ValidationError> {
        let mut grouped: BTreeMap<&str, Vec<Symbol>> = BTreeMap::new();
        for symbol in symbols {
            if !self.feeds.contains_key(symbol.exchange()) {
                return Err(ValidationError::InvalidSymbol(symbol.to_string()));
            }
            grouped.entry(symbol.exchange()).or_default().push(symbol.clone());
        }
        Ok(grouped
            .into_iter()
            .filter_map(|(exchange, symbols)| self.feeds.get(exchange).map(|feed| (feed, symbols)))
            .collect())
    }
}

//! Ingestion Pipeline
//!
//! Takes normalized events from the stream manager (or the REST fallback),
//! validates them and writes them through the cache coordinator.
//!
//! # Ordering
//!
//! Events are hashed by symbol onto a fixed set of single-owner shard
//! workers, each fed by a bounded channel. One symbol always lands on the
//! same shard, so its events are written in arrival order and no two
//! workers ever write the same key.
//!
//! # Fallback
//!
//! A supervisor watches the health of the connection serving each covered
//! symbol. Once it has been unhealthy for longer than the grace period the
//! symbol is switched to REST polling through the guarded fetcher, and
//! switched back as soon as the connection is healthy again.
//!
//! # Readiness
//!
//! [`IngestionPipeline::wait_until_ready`] resolves once every symbol
//! covered at call time has at least one successful cache write. Readiness
//! is latched.

use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::cache_coordinator::{CacheCoordinator, CacheError, WriteOutcome};
use crate::application::ports::{EventSink, FeedHealth, FetchError, SnapshotFetcher};
use crate::domain::cache::CacheWrite;
use crate::domain::connection::ConnectionState;
use crate::domain::market::{DataClass, FeedStatus, NormalizedEvent, Symbol, validate_event};
use crate::error::IngestError;
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Ingestion pipeline configuration.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Shard workers.
    pub workers: usize,
    /// Capacity of each shard channel.
    pub channel_capacity: usize,
    /// How long a connection may be unhealthy before its symbols poll REST.
    pub fallback_grace: Duration,
    /// Interval between REST polls of fallback symbols.
    pub poll_interval: Duration,
    /// Interval between connection health checks.
    pub check_interval: Duration,
    /// Concurrent REST fetches per poll round.
    pub rest_concurrency: usize,
    /// Classes fetched for a symbol in fallback.
    pub poll_classes: Vec<DataClass>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 1024,
            fallback_grace: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            check_interval: Duration::from_secs(1),
            rest_concurrency: 4,
            poll_classes: vec![DataClass::Ticker, DataClass::OrderBook, DataClass::Trade],
        }
    }
}

// =============================================================================
// Readiness
// =============================================================================

/// Readiness failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadinessError {
    /// Some covered symbols had no successful write before the deadline.
    #[error("not ready after {after:?}: {} symbol(s) without data", pending.len())]
    Timeout {
        /// Deadline applied.
        after: Duration,
        /// Symbols still without a write.
        pending: Vec<Symbol>,
    },
}

/// Tracks which symbols have been written at least once.
#[derive(Debug)]
pub struct ReadinessGate {
    written: Mutex<HashSet<Symbol>>,
    changed: watch::Sender<u64>,
    latched: AtomicBool,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    /// Create an empty gate.
    #[must_use]
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            written: Mutex::new(HashSet::new()),
            changed,
            latched: AtomicBool::new(false),
        }
    }

    /// Record a successful write for `symbol`.
    pub fn mark_written(&self, symbol: &Symbol) {
        let first = self.written.lock().insert(symbol.clone());
        if first {
            self.changed.send_modify(|version| *version = version.wrapping_add(1));
        }
    }

    /// Whether `symbol` has been written.
    #[must_use]
    pub fn has_data(&self, symbol: &Symbol) -> bool {
        self.written.lock().contains(symbol)
    }

    /// Whether readiness has been reached once.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    /// Wait until every symbol in `required` has data.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::Timeout`] listing the symbols still pending.
    pub async fn wait_for(&self, required: &[Symbol], timeout: Duration) -> Result<(), ReadinessError> {
        if self.is_ready() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let mut changes = self.changed.subscribe();
        loop {
            let pending: Vec<Symbol> = {
                let written = self.written.lock();
                required.iter().filter(|s| !written.contains(*s)).cloned().collect()
            };
            if pending.is_empty() {
                if !self.latched.swap(true, Ordering::AcqRel) {
                    tracing::info!(symbols = required.len(), "Ingestion ready");
                }
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    return Err(ReadinessError::Timeout {
                        after: timeout,
                        pending,
                    });
                }
            }
        }
    }
}

// =============================================================================
// Shard Router
// =============================================================================

/// Routes events onto single-owner shard workers by symbol.
#[derive(Debug)]
pub struct ShardRouter {
    shards: Vec<mpsc::Sender<NormalizedEvent>>,
    readiness: Arc<ReadinessGate>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardRouter {
    /// Start the shard workers.
    #[must_use]
    pub fn spawn(config: &IngestionConfig, coordinator: Arc<CacheCoordinator>, cancel: &CancellationToken) -> Arc<Self> {
        let readiness = Arc::new(ReadinessGate::new());
        let workers = config.workers.max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut tasks = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
            shards.push(tx);
            tasks.push(tokio::spawn(run_shard(
                shard,
                rx,
                Arc::clone(&coordinator),
                Arc::clone(&readiness),
                cancel.clone(),
            )));
        }
        tracing::info!(workers, "Ingestion shards started");
        Arc::new(Self {
            shards,
            readiness,
            tasks: Mutex::new(tasks),
        })
    }

    /// Readiness gate fed by the shard workers.
    #[must_use]
    pub fn readiness(&self) -> Arc<ReadinessGate> {
        Arc::clone(&self.readiness)
    }

    /// Shard index serving `symbol`.
    #[must_use]
    pub fn shard_of(&self, symbol: &Symbol) -> usize {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        usize::try_from(hasher.finish() % self.shards.len() as u64).unwrap_or(0)
    }

    /// Wait for the shard workers to drain and stop. Call after cancelling.
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl EventSink for ShardRouter {
    async fn deliver(&self, event: NormalizedEvent) {
        let shard = self.shard_of(&event.symbol);
        let Some(sender) = self.shards.get(shard) else {
            return;
        };
        let data_class = event.data_class;
        if sender.send(event).await.is_err() {
            metrics::record_event_dropped(data_class, "shutdown");
        }
    }
}

async fn run_shard(
    shard: usize,
    mut events: mpsc::Receiver<NormalizedEvent>,
    coordinator: Arc<CacheCoordinator>,
    readiness: Arc<ReadinessGate>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => process(&coordinator, &readiness, event).await,
                None => break,
            },
            () = cancel.cancelled() => {
                events.close();
                while let Some(event) = events.recv().await {
                    process(&coordinator, &readiness, event).await;
                }
                break;
            }
        }
    }
    tracing::debug!(shard, "Ingestion shard stopped");
}

async fn process(coordinator: &CacheCoordinator, readiness: &ReadinessGate, event: NormalizedEvent) {
    let symbol = event.symbol.clone();
    let data_class = event.data_class;

    if let Err(error) = validate_event(&event, Utc::now()) {
        tracing::warn!(symbol = %symbol, data_class = %data_class, reason = %error, "Dropping invalid event");
        metrics::record_event_dropped(data_class, "validation");
        return;
    }

    match coordinator.set(CacheWrite::from_event(coordinator.namespace(), event)).await {
        Ok(WriteOutcome::Written { .. }) => {
            metrics::record_event_written(data_class);
            readiness.mark_written(&symbol);
        }
        Ok(WriteOutcome::Superseded { existing }) => {
            tracing::debug!(symbol = %symbol, data_class = %data_class, existing = %existing, "Ignoring out-of-date event");
            metrics::record_event_dropped(data_class, "superseded");
            readiness.mark_written(&symbol);
        }
        Err(CacheError::Validation(error)) => {
            tracing::warn!(symbol = %symbol, data_class = %data_class, reason = %error, "Dropping invalid event");
            metrics::record_event_dropped(data_class, "validation");
        }
        Err(error) => {
            tracing::warn!(symbol = %symbol, data_class = %data_class, error = %error, "Cache write failed");
            metrics::record_event_dropped(data_class, "cache");
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct FallbackState {
    since: Instant,
    last_poll_ok: Option<bool>,
}

/// Event ingestion with stream-to-REST fallback and a readiness gate.
pub struct IngestionPipeline {
    config: IngestionConfig,
    router: Arc<ShardRouter>,
    feed: Arc<dyn FeedHealth>,
    fetcher: Arc<dyn SnapshotFetcher>,
    fallback: DashMap<Symbol, FallbackState>,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("config", &self.config)
            .field("fallback_symbols", &self.fallback.len())
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    /// Create a pipeline over running shards.
    #[must_use]
    pub fn new(
        config: IngestionConfig,
        router: Arc<ShardRouter>,
        feed: Arc<dyn FeedHealth>,
        fetcher: Arc<dyn SnapshotFetcher>,
    ) -> Self {
        Self {
            config,
            router,
            feed,
            fetcher,
            fallback: DashMap::new(),
        }
    }

    /// Hand one event to its shard.
    pub async fn ingest(&self, event: NormalizedEvent) {
        self.router.deliver(event).await;
    }

    /// Resolve once every covered symbol has at least one cache write.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::NotReady`] when `timeout` elapses first.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), IngestError> {
        let required = self.feed.covered_symbols();
        self.router.readiness().wait_for(&required, timeout).await?;
        Ok(())
    }

    /// Whether readiness has been reached.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.router.readiness().is_ready()
    }

    /// How `symbol` is currently fed.
    #[must_use]
    pub fn status(&self, symbol: &Symbol) -> FeedStatus {
        if !self.feed.covered_symbols().contains(symbol) {
            return FeedStatus::Unavailable;
        }
        if let Some(state) = self.fallback.get(symbol) {
            return match state.last_poll_ok {
                Some(false) => FeedStatus::Unavailable,
                Some(true) | None => FeedStatus::PollingFallback,
            };
        }
        match self.feed.health_for(symbol).map(|health| health.state) {
            None | Some(ConnectionState::Init | ConnectionState::Closed) => FeedStatus::Unavailable,
            Some(_) => FeedStatus::Streaming,
        }
    }

    /// Symbols currently polled over REST.
    #[must_use]
    pub fn fallback_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.fallback.iter().map(|entry| entry.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// Re-evaluate which symbols poll REST.
    pub fn evaluate_fallback(&self) {
        let now = Instant::now();
        let covered = self.feed.covered_symbols();
        let grace = self.config.fallback_grace;

        for symbol in &covered {
            let health = self.feed.health_for(symbol);
            let healthy = health
                .as_ref()
                .is_some_and(|h| h.state == ConnectionState::Healthy);
            let in_fallback = self.fallback.contains_key(symbol);

            if healthy {
                if let Some((_, state)) = self.fallback.remove(symbol) {
                    tracing::info!(
                        symbol = %symbol,
                        polled_ms = now.saturating_duration_since(state.since).as_millis(),
                        "Stream recovered; switching back to STREAMING"
                    );
                }
                continue;
            }

            let Some(health) = health else { continue };
            let unhealthy_for = health.unhealthy_for(now).unwrap_or_default();
            if !in_fallback && unhealthy_for >= grace {
                tracing::warn!(
                    symbol = %symbol,
                    connection = health.connection,
                    state = %health.state,
                    unhealthy_ms = unhealthy_for.as_millis(),
                    "Switching to POLLING_FALLBACK"
                );
                self.fallback.insert(
                    symbol.clone(),
                    FallbackState {
                        since: now,
                        last_poll_ok: None,
                    },
                );
            }
        }

        self.fallback.retain(|symbol, _| covered.contains(symbol));
        metrics::set_fallback_symbols(self.fallback.len());
    }

    /// Fetch every fallback symbol once and ingest the results.
    pub async fn poll_fallback(&self) {
        let symbols = self.fallback_symbols();
        if symbols.is_empty() {
            return;
        }
        let outcomes: DashMap<Symbol, bool> = DashMap::new();
        let jobs: Vec<(&Symbol, DataClass)> = symbols
            .iter()
            .flat_map(|symbol| self.config.poll_classes.iter().map(move |class| (symbol, *class)))
            .collect();

        futures_util::stream::iter(jobs)
            .for_each_concurrent(self.config.rest_concurrency.max(1), |(symbol, class)| {
                let outcomes = &outcomes;
                async move {
                    let ok = match self.fetcher.fetch_snapshot(symbol, class).await {
                        Ok(event) => {
                            self.router.deliver(event).await;
                            Some(true)
                        }
                        Err(IngestError::Fetch(FetchError::Unsupported(_))) => None,
                        Err(error) => {
                            tracing::debug!(
                                symbol = %symbol,
                                data_class = %class,
                                kind = %error.kind(),
                                error = %error,
                                "Fallback poll failed"
                            );
                            Some(false)
                        }
                    };
                    if let Some(ok) = ok {
                        *outcomes.entry(symbol.clone()).or_insert(false) |= ok;
                    }
                }
            })
            .await;

        for (symbol, ok) in outcomes {
            metrics::record_fallback_poll(symbol.exchange(), ok);
            if let Some(mut state) = self.fallback.get_mut(&symbol) {
                state.last_poll_ok = Some(ok);
            }
        }
    }

    /// Run the fallback supervisor until cancelled.
    pub fn spawn_supervisor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut check = tokio::time::interval(pipeline.config.check_interval);
            let mut poll = tokio::time::interval(pipeline.config.poll_interval);
            check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = check.tick() => pipeline.evaluate_fallback(),
                    _ = poll.tick() => pipeline.poll_fallback().await,
                }
            }
            tracing::debug!("Fallback supervisor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use chrono::TimeDelta;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::application::ports::{MockFeedHealth, MockSnapshotFetcher};
    use crate::application::services::cache_coordinator::{CacheTiers, CoordinatorConfig};
    use crate::domain::cache::{KeyNamespace, TierLevel};
    use crate::domain::connection::HealthCell;
    use crate::domain::market::{MarketPayload, TickerData};
    use crate::infrastructure::cache::MemoryTier;

    fn coordinator() -> Arc<CacheCoordinator> {
        let tiers = CacheTiers {
            hot: Arc::new(MemoryTier::new(TierLevel::Hot, 1_000)),
            warm: Arc::new(MemoryTier::new(TierLevel::Warm, 1_000)),
            durable: Arc::new(MemoryTier::new(TierLevel::Durable, 1_000)),
        };
        Arc::new(CacheCoordinator::new(
            CoordinatorConfig::new(KeyNamespace::new("md", 1).unwrap()),
            tiers,
        ))
    }

    fn btc() -> Symbol {
        Symbol::new("bybit", "BTCUSDT").unwrap()
    }

    fn ticker(symbol: Symbol, price: rust_decimal::Decimal) -> NormalizedEvent {
        NormalizedEvent::new(
            symbol,
            MarketPayload::Ticker(TickerData {
                last_price: price,
                bid_price: Some(price - dec!(0.5)),
                ask_price: Some(price + dec!(0.5)),
                volume_24h: Some(dec!(1000)),
            }),
            Utc::now(),
        )
    }

    fn health(state: ConnectionState) -> crate::domain::connection::ConnectionHealth {
        let cell = HealthCell::new(1, "bybit");
        if state != ConnectionState::Init {
            cell.transition(ConnectionState::Connecting);
        }
        match state {
            ConnectionState::Healthy => {
                cell.transition(ConnectionState::Healthy);
            }
            ConnectionState::Reconnecting => {
                cell.transition(ConnectionState::Reconnecting);
            }
            _ => {}
        }
        cell.snapshot()
    }

    #[tokio::test]
    async fn valid_events_reach_the_cache_and_mark_readiness() {
        let cancel = CancellationToken::new();
        let coordinator = coordinator();
        let router = ShardRouter::spawn(&IngestionConfig::default(), Arc::clone(&coordinator), &cancel);

        router.deliver(ticker(btc(), dec!(65000))).await;
        router
            .readiness()
            .wait_for(&[btc()], Duration::from_secs(2))
            .await
            .unwrap();

        let snapshot = coordinator.get_snapshot(&btc(), DataClass::Ticker).await;
        assert!(snapshot.snapshot().is_some());

        cancel.cancel();
        router.join().await;
    }

    #[tokio::test]
    async fn invalid_events_are_dropped_without_a_placeholder() {
        let cancel = CancellationToken::new();
        let coordinator = coordinator();
        let router = ShardRouter::spawn(&IngestionConfig::default(), Arc::clone(&coordinator), &cancel);

        let mut future = ticker(btc(), dec!(65000));
        future.source_timestamp = Utc::now() + TimeDelta::minutes(10);
        router.deliver(future).await;
        router.deliver(ticker(btc(), dec!(-1))).await;

        let err = router
            .readiness()
            .wait_for(&[btc()], Duration::from_millis(100))
            .await
            .unwrap_err();
        let ReadinessError::Timeout { pending, .. } = err;
        assert_eq!(pending, vec![btc()]);
        assert!(coordinator.get_snapshot(&btc(), DataClass::Ticker).await.is_not_available());

        cancel.cancel();
        router.join().await;
    }

    #[tokio::test]
    async fn same_symbol_always_lands_on_one_shard() {
        let cancel = CancellationToken::new();
        let router = ShardRouter::spawn(
            &IngestionConfig {
                workers: 8,
                ..IngestionConfig::default()
            },
            coordinator(),
            &cancel,
        );
        let first = router.shard_of(&btc());
        for _ in 0..10 {
            assert_eq!(router.shard_of(&btc()), first);
        }
        cancel.cancel();
        router.join().await;
    }

    #[tokio::test]
    async fn readiness_latches() {
        let gate = ReadinessGate::new();
        gate.mark_written(&btc());
        gate.wait_for(&[btc()], Duration::from_millis(10)).await.unwrap();
        assert!(gate.is_ready());
        let eth = Symbol::new("bybit", "ETHUSDT").unwrap();
        gate.wait_for(&[eth], Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_symbol_switches_to_fallback_after_grace() {
        let cancel = CancellationToken::new();
        let router = ShardRouter::spawn(&IngestionConfig::default(), coordinator(), &cancel);

        let mut feed = MockFeedHealth::new();
        feed.expect_covered_symbols().returning(|| vec![btc()]);
        let reconnecting = health(ConnectionState::Reconnecting);
        feed.expect_health_for().returning(move |_| Some(reconnecting.clone()));

        let mut fetcher = MockSnapshotFetcher::new();
        fetcher
            .expect_fetch_snapshot()
            .returning(|symbol, _| Ok(ticker(symbol.clone(), dec!(64000))));

        let pipeline = IngestionPipeline::new(
            IngestionConfig {
                fallback_grace: Duration::from_secs(10),
                poll_classes: vec![DataClass::Ticker],
                ..IngestionConfig::default()
            },
            router,
            Arc::new(feed),
            Arc::new(fetcher),
        );

        pipeline.evaluate_fallback();
        assert_eq!(pipeline.status(&btc()), FeedStatus::Streaming);

        tokio::time::advance(Duration::from_secs(11)).await;
        pipeline.evaluate_fallback();
        assert_eq!(pipeline.fallback_symbols(), vec![btc()]);
        assert_eq!(pipeline.status(&btc()), FeedStatus::PollingFallback);

        pipeline.poll_fallback().await;
        assert_eq!(pipeline.status(&btc()), FeedStatus::PollingFallback);

        cancel.cancel();
    }

    #[tokio::test]
    async fn failed_polls_report_unavailable_and_recovery_returns_to_streaming() {
        let cancel = CancellationToken::new();
        let router = ShardRouter::spawn(&IngestionConfig::default(), coordinator(), &cancel);

        let healthy = Arc::new(AtomicBool::new(false));
        let mut feed = MockFeedHealth::new();
        feed.expect_covered_symbols().returning(|| vec![btc()]);
        let flag = Arc::clone(&healthy);
        feed.expect_health_for().returning(move |_| {
            Some(if flag.load(Ordering::SeqCst) {
                health(ConnectionState::Healthy)
            } else {
                health(ConnectionState::Reconnecting)
            })
        });

        let mut fetcher = MockSnapshotFetcher::new();
        fetcher
            .expect_fetch_snapshot()
            .returning(|_, _| Err(IngestError::Fetch(FetchError::Transport("reset".into()))));

        let pipeline = IngestionPipeline::new(
            IngestionConfig {
                fallback_grace: Duration::ZERO,
                poll_classes: vec![DataClass::Ticker],
                ..IngestionConfig::default()
            },
            router,
            Arc::new(feed),
            Arc::new(fetcher),
        );

        pipeline.evaluate_fallback();
        pipeline.poll_fallback().await;
        assert_eq!(pipeline.status(&btc()), FeedStatus::Unavailable);

        healthy.store(true, Ordering::SeqCst);
        pipeline.evaluate_fallback();
        assert!(pipeline.fallback_symbols().is_empty());
        assert_eq!(pipeline.status(&btc()), FeedStatus::Streaming);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_polls_fallback_symbols_in_the_background() {
        let cancel = CancellationToken::new();
        let coordinator = coordinator();
        let router = ShardRouter::spawn(&IngestionConfig::default(), Arc::clone(&coordinator), &cancel);

        let mut feed = MockFeedHealth::new();
        feed.expect_covered_symbols().returning(|| vec![btc()]);
        feed.expect_health_for()
            .returning(|_| Some(health(ConnectionState::Reconnecting)));

        let polls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&polls);
        let mut fetcher = MockSnapshotFetcher::new();
        fetcher.expect_fetch_snapshot().returning(move |symbol, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ticker(symbol.clone(), dec!(64000)))
        });

        let pipeline = Arc::new(IngestionPipeline::new(
            IngestionConfig {
                fallback_grace: Duration::ZERO,
                check_interval: Duration::from_millis(10),
                poll_interval: Duration::from_millis(50),
                poll_classes: vec![DataClass::Ticker],
                ..IngestionConfig::default()
            },
            router,
            Arc::new(feed),
            Arc::new(fetcher),
        ));
        let supervisor = pipeline.spawn_supervisor(cancel.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(polls.load(Ordering::SeqCst) > 0);
        assert_eq!(pipeline.status(&btc()), FeedStatus::PollingFallback);
        assert!(
            coordinator
                .get_snapshot(&btc(), DataClass::Ticker)
                .await
                .snapshot()
                .is_some()
        );

        cancel.cancel();
        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn uncovered_symbol_is_unavailable() {
        let cancel = CancellationToken::new();
        let router = ShardRouter::spawn(&IngestionConfig::default(), coordinator(), &cancel);
        let mut feed = MockFeedHealth::new();
        feed.expect_covered_symbols().returning(Vec::new);
        let pipeline = IngestionPipeline::new(
            IngestionConfig::default(),
            router,
            Arc::new(feed),
            Arc::new(MockSnapshotFetcher::new()),
        );
        assert_eq!(pipeline.status(&btc()), FeedStatus::Unavailable);
        cancel.cancel();
    }
}

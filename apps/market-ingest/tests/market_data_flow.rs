//! Market Data Flow Integration Tests
//!
//! Wires a scripted exchange through the subscription manager, sharded
//! ingestion and in-memory cache tiers, then reads through the consumer
//! API: readiness, snapshots, feed status, REST fallback and cascade
//! invalidation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use common::{FakeConnector, FakeExchange, eventually, symbol, ticker_event};
use market_ingest::application::ports::{
    CacheTier, EventSink, FeedHealth, FetchError, SnapshotFetcher, StreamError,
};
use market_ingest::application::services::{
    CacheCoordinator, CacheTiers, CoordinatorConfig, ExchangeFeed, IngestionConfig,
    IngestionPipeline, MarketDataService, ShardRouter, StreamManagerConfig,
    StreamSubscriptionManager,
};
use market_ingest::domain::cache::{Bucket, CacheKey, CacheWrite, KeyNamespace, TierLevel};
use market_ingest::domain::market::{
    DataClass, DerivedValue, FeedStatus, MarketPayload, NormalizedEvent, NotAvailableReason,
    SnapshotResult, Symbol, ValidationError,
};
use market_ingest::error::{ErrorKind, IngestError};
use market_ingest::infrastructure::cache::MemoryTier;
use market_ingest::resilience::{
    CircuitBreaker, CircuitBreakerConfig, RateLimitPolicy, RateLimiter, ReconnectConfig,
};

const WAIT: Duration = Duration::from_secs(3);

/// REST fetcher answering ticker requests with a fixed price.
struct TickerFetcher {
    calls: AtomicU32,
    price: Decimal,
}

#[async_trait]
impl SnapshotFetcher for TickerFetcher {
    async fn fetch_snapshot(&self, symbol: &Symbol, data_class: DataClass) -> Result<NormalizedEvent, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if data_class != DataClass::Ticker {
            return Err(FetchError::Unsupported(data_class).into());
        }
        Ok(ticker_event(symbol, self.price))
    }
}

struct Harness {
    exchange: Arc<FakeExchange>,
    fetcher: Arc<TickerFetcher>,
    service: Arc<MarketDataService>,
    manager: Arc<StreamSubscriptionManager>,
    cancel: CancellationToken,
}

impl Harness {
    fn new(fallback_grace: Duration) -> Self {
        let tier = |level| Arc::new(MemoryTier::new(level, 1_000)) as Arc<dyn CacheTier>;
        let coordinator = Arc::new(CacheCoordinator::new(
            CoordinatorConfig::new(KeyNamespace::new("mi", 1).unwrap()),
            CacheTiers {
                hot: tier(TierLevel::Hot),
                warm: tier(TierLevel::Warm),
                durable: tier(TierLevel::Durable),
            },
        ));
        let cancel = CancellationToken::new();

        let ingestion = IngestionConfig {
            workers: 2,
            fallback_grace,
            poll_interval: Duration::from_millis(20),
            check_interval: Duration::from_millis(10),
            poll_classes: vec![DataClass::Ticker],
            ..IngestionConfig::default()
        };
        let router = ShardRouter::spawn(&ingestion, Arc::clone(&coordinator), &cancel);

        let exchange = FakeExchange::new();
        let manager = Arc::new(StreamSubscriptionManager::new(
            Arc::new(FakeConnector(Arc::clone(&exchange))),
            Arc::clone(&router) as Arc<dyn EventSink>,
            Arc::new(RateLimiter::new(RateLimitPolicy::new(1000, 60_000))),
            Arc::new(CircuitBreaker::new(
                "bybit:stream",
                CircuitBreakerConfig {
                    failure_threshold: 10_000,
                    ..CircuitBreakerConfig::default()
                },
            )),
            StreamManagerConfig {
                reconnect: ReconnectConfig {
                    base: Duration::from_millis(10),
                    cap: Duration::from_millis(40),
                    jitter_factor: 0.0,
                    max_attempts: 0,
                },
                ..StreamManagerConfig::default()
            },
            cancel.clone(),
        ));

        let fetcher = Arc::new(TickerFetcher {
            calls: AtomicU32::new(0),
            price: dec!(64000),
        });
        let pipeline = Arc::new(IngestionPipeline::new(
            ingestion,
            router,
            Arc::clone(&manager) as Arc<dyn FeedHealth>,
            Arc::clone(&fetcher) as Arc<dyn SnapshotFetcher>,
        ));
        pipeline.spawn_supervisor(cancel.clone());

        let service = Arc::new(MarketDataService::new(
            coordinator,
            [ExchangeFeed {
                manager: Arc::clone(&manager),
                pipeline,
            }],
        ));

        Self {
            exchange,
            fetcher,
            service,
            manager,
            cancel,
        }
    }

    fn streaming(&self, ticker: &str) -> bool {
        self.manager
            .health_for(&symbol(ticker))
            .is_some_and(|h| h.state.is_streaming() && h.subscriptions > 0)
            && self.service.status(&symbol(ticker)) == FeedStatus::Streaming
    }

    async fn last_price(&self, ticker: &str) -> Option<Decimal> {
        match self.service.get_snapshot(&symbol(ticker), DataClass::Ticker).await {
            SnapshotResult::Fresh(snapshot) => match snapshot.payload {
                MarketPayload::Ticker(data) => Some(data.last_price),
                _ => None,
            },
            _ => None,
        }
    }

    async fn wait_for_price(&self, ticker: &str, price: Decimal) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.last_price(ticker).await == Some(price) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.manager.shutdown().await;
    }
}

#[tokio::test]
async fn streamed_values_are_served_after_readiness() {
    let harness = Harness::new(Duration::from_secs(10));
    let consumer = harness.service.register_consumer();
    harness
        .service
        .subscribe(consumer, &[symbol("BTCUSDT"), symbol("ETHUSDT")])
        .unwrap();
    assert!(eventually(WAIT, || harness.streaming("BTCUSDT") && harness.streaming("ETHUSDT")).await);

    let not_ready = harness.service.wait_until_ready(Duration::from_millis(50)).await;
    assert_eq!(not_ready.unwrap_err().kind(), ErrorKind::NotReady);

    for price in [dec!(65000), dec!(65001), dec!(65002)] {
        harness.exchange.push(&ticker_event(&symbol("BTCUSDT"), price));
    }
    harness.exchange.push(&ticker_event(&symbol("ETHUSDT"), dec!(3200)));

    harness.service.wait_until_ready(WAIT).await.unwrap();
    assert!(harness.service.is_ready());
    assert!(harness.wait_for_price("BTCUSDT", dec!(65002)).await);
    assert!(harness.wait_for_price("ETHUSDT", dec!(3200)).await);

    harness.stop().await;
}

#[tokio::test]
async fn dropped_connection_returns_to_streaming_in_order() {
    let harness = Harness::new(Duration::from_secs(10));
    let consumer = harness.service.register_consumer();
    harness
        .service
        .subscribe(consumer, &[symbol("BTCUSDT"), symbol("ETHUSDT")])
        .unwrap();
    assert!(eventually(WAIT, || harness.streaming("BTCUSDT") && harness.streaming("ETHUSDT")).await);

    harness.exchange.drop_all();
    assert!(
        eventually(WAIT, || {
            harness.exchange.connects() == 2
                && harness.streaming("BTCUSDT")
                && harness.streaming("ETHUSDT")
        })
        .await
    );

    for price in [dec!(65010), dec!(65020), dec!(65030)] {
        harness.exchange.push(&ticker_event(&symbol("BTCUSDT"), price));
    }
    assert!(harness.wait_for_price("BTCUSDT", dec!(65030)).await);
    assert!(harness.service.fallback_symbols().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn unhealthy_stream_is_bridged_by_rest_polling() {
    let harness = Harness::new(Duration::from_millis(50));
    harness
        .exchange
        .fail_next_connects(std::iter::repeat_n(StreamError::Transport("refused".to_string()), 100_000));

    let consumer = harness.service.register_consumer();
    harness.service.subscribe(consumer, &[symbol("BTCUSDT")]).unwrap();

    assert!(
        eventually(WAIT, || {
            harness.service.status(&symbol("BTCUSDT")) == FeedStatus::PollingFallback
        })
        .await
    );
    assert_eq!(harness.service.fallback_symbols(), vec![symbol("BTCUSDT")]);
    assert!(harness.wait_for_price("BTCUSDT", dec!(64000)).await);
    assert!(harness.fetcher.calls.load(Ordering::SeqCst) > 0);

    harness.exchange.clear_connect_failures();
    assert!(eventually(WAIT, || harness.streaming("BTCUSDT")).await);
    assert!(eventually(WAIT, || harness.service.fallback_symbols().is_empty()).await);

    harness.stop().await;
}

#[tokio::test]
async fn cascade_removes_values_derived_from_a_streamed_tick() {
    let harness = Harness::new(Duration::from_secs(10));
    let consumer = harness.service.register_consumer();
    harness.service.subscribe(consumer, &[symbol("BTCUSDT")]).unwrap();
    assert!(eventually(WAIT, || harness.streaming("BTCUSDT")).await);

    harness.exchange.push(&ticker_event(&symbol("BTCUSDT"), dec!(65000)));
    assert!(harness.wait_for_price("BTCUSDT", dec!(65000)).await);

    let coordinator = harness.service.coordinator();
    let namespace = KeyNamespace::new("mi", 1).unwrap();
    let base = coordinator.latest_key(&symbol("BTCUSDT"), DataClass::Ticker);
    let derived = |metric: &str, deps: Vec<CacheKey>| CacheWrite {
        key: CacheKey::derived(&namespace, metric, symbol("BTCUSDT"), Bucket::Window(300)).unwrap(),
        schema_version: DataClass::Derived.schema_version(),
        payload: MarketPayload::Derived(DerivedValue {
            metric: metric.to_string(),
            value: dec!(0.75),
            inputs: 1,
        }),
        source_timestamp: Utc::now(),
        depends_on: deps,
    };

    let momentum = derived("momentum", vec![base.clone()]);
    let momentum_key = momentum.key.clone();
    coordinator.set(momentum).await.unwrap();
    let signal = derived("signal", vec![momentum_key.clone()]);
    let signal_key = signal.key.clone();
    coordinator.set(signal).await.unwrap();

    let base_ttl = coordinator.assigned_ttl(&base).unwrap();
    let momentum_ttl = coordinator.assigned_ttl(&momentum_key).unwrap();
    let signal_ttl = coordinator.assigned_ttl(&signal_key).unwrap();
    assert!(momentum_ttl > base_ttl);
    assert!(signal_ttl > momentum_ttl);

    let report = coordinator.invalidate_cascade(&base).await;
    assert!(report.is_complete());
    assert_eq!(report.invalidated.len(), 3);
    for key in [&base, &momentum_key, &signal_key] {
        assert!(matches!(
            coordinator.snapshot(key).await,
            SnapshotResult::NotAvailable {
                reason: NotAvailableReason::Missing
            }
        ));
    }

    harness.stop().await;
}

#[tokio::test]
async fn symbol_without_data_is_not_available() {
    let harness = Harness::new(Duration::from_secs(10));

    let result = harness
        .service
        .get_snapshot(&symbol("DOGEUSDT"), DataClass::Ticker)
        .await;
    assert!(matches!(
        result,
        SnapshotResult::NotAvailable {
            reason: NotAvailableReason::Missing
        }
    ));
    assert_eq!(harness.service.status(&symbol("DOGEUSDT")), FeedStatus::Unavailable);

    harness.stop().await;
}

#[tokio::test]
async fn reserved_sentinels_never_become_symbols() {
    for sentinel in ["SYSTEM_STATUS", "system", "N/A", "Unknown"] {
        assert!(matches!(
            Symbol::new("bybit", sentinel),
            Err(ValidationError::ReservedSymbol(_))
        ));
    }
}

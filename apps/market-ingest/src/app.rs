//! Service Assembly
//!
//! Builds the running service from an [`IngestConfig`]: cache tiers, the
//! shared rate limiter and breaker registry, and one stream manager plus
//! ingestion pipeline per configured exchange. Each exchange gets its own
//! shard router so its readiness gate only tracks its own symbols.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    CacheTier, EventSink, ExchangeRest, FeedHealth, SnapshotFetcher, StreamConnector,
};
use crate::application::services::{
    CacheCoordinator, CacheTiers, CacheWarmer, ExchangeFeed, FetcherSet, GuardedFetcher,
    IngestionPipeline, MarketDataService, ShardRouter, StreamSubscriptionManager,
};
use crate::domain::cache::TierLevel;
use crate::infrastructure::cache::{MemoryTier, RedisTier};
use crate::infrastructure::config::{
    BreakerSettings, CacheSettings, ExchangeSettings, IngestConfig, RateLimitSettings,
    SharedTierSettings, TierBackend,
};
use crate::infrastructure::exchange::bybit::{BybitConnector, BybitRest};
use crate::infrastructure::health::HealthServerState;
use crate::resilience::{CircuitBreakerRegistry, EndpointClass, EndpointKey, RateLimiter};

/// Running service and the handles needed to stop it.
pub struct IngestService {
    service: Arc<MarketDataService>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    managers: Vec<Arc<StreamSubscriptionManager>>,
    routers: Vec<Arc<ShardRouter>>,
    rests: Vec<Arc<BybitRest>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for IngestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestService")
            .field("exchanges", &self.managers.len())
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl IngestService {
    /// Connect the cache tiers and start every background task.
    ///
    /// Stream connections open lazily on the first subscription.
    ///
    /// # Errors
    ///
    /// Fails if a shared cache tier cannot be reached or the configuration
    /// does not convert into valid runtime settings.
    pub async fn start(config: &IngestConfig, cancel: CancellationToken) -> anyhow::Result<Self> {
        let coordinator_config = config.cache.coordinator_config()?;
        let namespace = config.cache.key_namespace()?;
        let tiers = build_tiers(&config.cache).await?;
        let coordinator = Arc::new(CacheCoordinator::new(coordinator_config, tiers));

        let breakers = Arc::new(
            config
                .exchanges
                .iter()
                .fold(
                    CircuitBreakerRegistry::new(BreakerSettings::default().to_breaker_config()),
                    |registry, (name, settings)| {
                        registry.with_exchange(name, settings.circuit_breaker.to_breaker_config())
                    },
                ),
        );
        let limiter = Arc::new(RateLimiter::new(
            RateLimitSettings::default().policy(EndpointClass::MarketRest),
        ));

        let ingestion = config.ingestion.ingestion_config();
        let request_deadline = Duration::from_secs(config.stream.rate_limit_deadline_secs);

        let mut managers = Vec::with_capacity(config.exchanges.len());
        let mut routers = Vec::with_capacity(config.exchanges.len());
        let mut rests = Vec::with_capacity(config.exchanges.len());
        let mut feeds = Vec::with_capacity(config.exchanges.len());
        let mut tasks = Vec::new();
        let mut fetchers = FetcherSet::new();

        for (name, settings) in &config.exchanges {
            for class in EndpointClass::ALL {
                limiter.set_policy(EndpointKey::new(name, class), settings.rate_limits.policy(class));
            }

            let router = ShardRouter::spawn(&ingestion, Arc::clone(&coordinator), &cancel);

            let connector: Arc<dyn StreamConnector> =
                Arc::new(BybitConnector::new(settings.stream_config(name, &config.stream)));
            let manager = Arc::new(StreamSubscriptionManager::new(
                connector,
                Arc::clone(&router) as Arc<dyn EventSink>,
                Arc::clone(&limiter),
                breakers.get(&EndpointKey::new(name, EndpointClass::Stream)),
                config.stream.manager_config(settings, &config.reconnect),
                cancel.clone(),
            ));

            let rest = Arc::new(build_rest(name, settings, &breakers)?);
            tasks.push(rest.pool().spawn_reaper(cancel.clone()));

            let fetcher = Arc::new(GuardedFetcher::new(
                Arc::clone(&rest) as Arc<dyn ExchangeRest>,
                Arc::clone(&limiter),
                Arc::clone(&breakers),
                namespace.clone(),
                request_deadline,
            ));
            fetchers.insert(Arc::clone(&fetcher));

            let pipeline = Arc::new(IngestionPipeline::new(
                ingestion.clone(),
                Arc::clone(&router),
                Arc::clone(&manager) as Arc<dyn FeedHealth>,
                fetcher as Arc<dyn SnapshotFetcher>,
            ));
            tasks.push(pipeline.spawn_supervisor(cancel.clone()));

            tracing::info!(
                exchange = %name,
                stream_url = %settings.stream_url(),
                rest_url = %settings.rest_url,
                "Exchange feed configured"
            );

            feeds.push(ExchangeFeed {
                manager: Arc::clone(&manager),
                pipeline,
            });
            managers.push(manager);
            routers.push(router);
            rests.push(rest);
        }

        if config.warming.enabled {
            let warmer = Arc::new(CacheWarmer::new(
                Arc::clone(&coordinator),
                Arc::new(fetchers),
                config.warming.schedule(),
            ));
            tasks.push(warmer.spawn(cancel.clone()));
        } else {
            tracing::info!("Cache warming disabled");
        }

        let service = Arc::new(MarketDataService::new(coordinator, feeds));

        Ok(Self {
            service,
            breakers,
            limiter,
            managers,
            routers,
            rests,
            tasks,
            cancel,
        })
    }

    /// Consumer-facing facade.
    #[must_use]
    pub fn service(&self) -> Arc<MarketDataService> {
        Arc::clone(&self.service)
    }

    /// Breaker registry shared by every outbound call.
    #[must_use]
    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// State for the health server.
    #[must_use]
    pub fn health_state(&self, version: impl Into<String>) -> Arc<HealthServerState> {
        Arc::new(HealthServerState::new(version.into(), self.service(), self.breakers()))
    }

    /// Check configured API credentials against each exchange. Failures are
    /// logged; market data does not need them.
    pub async fn verify_credentials(&self) {
        for rest in &self.rests {
            if !rest.has_credentials() {
                continue;
            }
            let exchange = rest.exchange();
            let endpoint = EndpointKey::new(exchange, EndpointClass::PrivateRest);
            if let Err(e) = self.limiter.acquire(&endpoint, Some(Duration::from_secs(5))).await {
                tracing::warn!(exchange, error = %e, "Skipped credential check");
                continue;
            }
            match rest.verify_credentials().await {
                Ok(()) => tracing::info!(exchange, "API credentials accepted"),
                Err(e) => tracing::warn!(exchange, error = %e, "API credentials rejected"),
            }
        }
    }

    /// Stop every task: close stream connections, then drain the shards.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for manager in &self.managers {
            manager.shutdown().await;
        }
        for router in &self.routers {
            router.join().await;
        }
        for task in self.tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
        for rest in &self.rests {
            rest.pool().close();
        }
        tracing::info!("Ingestion stopped");
    }
}

/// Hot tier in process; warm and durable per their configured backend.
async fn build_tiers(cache: &CacheSettings) -> anyhow::Result<CacheTiers> {
    let hot: Arc<dyn CacheTier> = Arc::new(MemoryTier::new(TierLevel::Hot, cache.hot.capacity));
    let warm = shared_tier(TierLevel::Warm, &cache.warm).await?;
    let durable = shared_tier(TierLevel::Durable, &cache.durable).await?;
    Ok(CacheTiers { hot, warm, durable })
}

async fn shared_tier(level: TierLevel, settings: &SharedTierSettings) -> anyhow::Result<Arc<dyn CacheTier>> {
    match settings.backend {
        TierBackend::Memory => Ok(Arc::new(MemoryTier::new(level, settings.capacity))),
        TierBackend::Redis => {
            let url = settings
                .url
                .as_deref()
                .with_context(|| format!("{level} tier uses redis but has no url"))?;
            let tier = RedisTier::connect(
                level,
                url,
                settings.key_prefix.clone(),
                Duration::from_millis(settings.connect_timeout_ms),
            )
            .await
            .with_context(|| format!("failed to connect {level} tier"))?;
            Ok(Arc::new(tier))
        }
    }
}

fn build_rest(
    name: &str,
    settings: &ExchangeSettings,
    breakers: &CircuitBreakerRegistry,
) -> anyhow::Result<BybitRest> {
    let signer = settings
        .signer()
        .with_context(|| format!("invalid credentials for exchange {name}"))?;
    Ok(BybitRest::new(
        settings.rest_config(name),
        breakers.get(&EndpointKey::new(name, EndpointClass::MarketRest)),
        settings.pool.to_pool_config(),
        signer,
    ))
}

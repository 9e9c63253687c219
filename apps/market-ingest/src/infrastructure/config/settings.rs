//! Configuration Sections
//!
//! Serde types for each YAML section. Every field has a default, so an
//! empty document is a valid configuration. Durations are written as
//! integer seconds (`*_secs`) or milliseconds (`*_ms`).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::application::services::{
    ClassPolicy, CoordinatorConfig, IngestionConfig, StreamManagerConfig, WarmPhase, WarmSchedule,
};
use crate::domain::cache::{KeyNamespace, TierLevel, TtlPolicy};
use crate::domain::market::DataClass;
use crate::infrastructure::exchange::bybit::{
    BybitRestConfig, BybitStreamConfig, Credentials, DEFAULT_RECV_WINDOW, HeartbeatConfig, Signer,
};
use crate::infrastructure::pool::PoolConfig;
use crate::resilience::{CircuitBreakerConfig, EndpointClass, RateLimitPolicy, ReconnectConfig};

// =============================================================================
// Exchanges
// =============================================================================

/// One exchange connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSettings {
    /// Product category (`linear`, `inverse`, `spot`).
    #[serde(default = "default_category")]
    pub category: String,
    /// Public stream URL; derived from the category when absent.
    #[serde(default)]
    pub ws_url: Option<String>,
    /// REST base URL.
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    /// API credentials for private endpoints.
    #[serde(default)]
    pub credentials: Option<CredentialSettings>,
    /// Order book depth channel.
    #[serde(default = "default_book_depth")]
    pub book_depth: usize,
    /// Subscriptions per physical connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,
    /// Rate limits per endpoint class.
    #[serde(default)]
    pub rate_limits: RateLimitSettings,
    /// Circuit breaker applied to every endpoint class.
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
    /// REST client pool.
    #[serde(default)]
    pub pool: PoolSettings,
    /// REST request timeout (ms).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            category: default_category(),
            ws_url: None,
            rest_url: default_rest_url(),
            credentials: None,
            book_depth: default_book_depth(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            rate_limits: RateLimitSettings::default(),
            circuit_breaker: BreakerSettings::default(),
            pool: PoolSettings::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_category() -> String {
    "linear".to_string()
}

fn default_rest_url() -> String {
    "https://api.bybit.com".to_string()
}

const fn default_book_depth() -> usize {
    50
}

const fn default_max_subscriptions() -> usize {
    50
}

const fn default_request_timeout_ms() -> u64 {
    5_000
}

impl ExchangeSettings {
    /// Stream URL in force.
    #[must_use]
    pub fn stream_url(&self) -> String {
        self.ws_url
            .clone()
            .unwrap_or_else(|| format!("wss://stream.bybit.com/v5/public/{}", self.category))
    }

    /// Stream adapter configuration.
    #[must_use]
    pub fn stream_config(&self, exchange: &str, stream: &StreamSettings) -> BybitStreamConfig {
        BybitStreamConfig {
            exchange: exchange.to_string(),
            book_depth: self.book_depth,
            heartbeat: HeartbeatConfig::new(
                Duration::from_secs(stream.ping_interval_secs),
                Duration::from_secs(stream.pong_timeout_secs),
            ),
            connect_timeout: Duration::from_secs(stream.connect_timeout_secs),
            ..BybitStreamConfig::new(self.stream_url())
        }
    }

    /// REST adapter configuration.
    #[must_use]
    pub fn rest_config(&self, exchange: &str) -> BybitRestConfig {
        BybitRestConfig {
            exchange: exchange.to_string(),
            base_url: self.rest_url.trim_end_matches('/').to_string(),
            category: self.category.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            book_depth: self.book_depth,
        }
    }

    /// Signer for private endpoints, if credentials are configured.
    ///
    /// Blank key and secret (an unset `${VAR}`) count as not configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] when only one of the two is set.
    pub fn signer(&self) -> Result<Option<Signer>, ConfigError> {
        let Some(creds) = &self.credentials else {
            return Ok(None);
        };
        if creds.api_key.trim().is_empty() && creds.api_secret.trim().is_empty() {
            return Ok(None);
        }
        let credentials = Credentials::new(creds.api_key.clone(), creds.api_secret.clone())
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(Some(Signer::new(credentials, DEFAULT_RECV_WINDOW)))
    }
}

/// API key and secret. `Debug` is redacted.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CredentialSettings {
    /// API key.
    #[serde(default)]
    pub api_key: String,
    /// API secret.
    #[serde(default)]
    pub api_secret: String,
}

impl std::fmt::Debug for CredentialSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSettings")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Per-second and per-minute request limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Requests per second.
    pub per_second: u32,
    /// Requests per minute.
    pub per_minute: u32,
}

impl From<LimitSettings> for RateLimitPolicy {
    fn from(limits: LimitSettings) -> Self {
        Self::new(limits.per_second, limits.per_minute)
    }
}

/// Limits per endpoint class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Stream connect and subscribe.
    pub stream: LimitSettings,
    /// Public market REST.
    pub market_rest: LimitSettings,
    /// Signed private REST.
    pub private_rest: LimitSettings,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            stream: LimitSettings {
                per_second: 5,
                per_minute: 100,
            },
            market_rest: LimitSettings {
                per_second: 10,
                per_minute: 600,
            },
            private_rest: LimitSettings {
                per_second: 5,
                per_minute: 120,
            },
        }
    }
}

impl RateLimitSettings {
    /// Policy for an endpoint class.
    #[must_use]
    pub fn policy(&self, class: EndpointClass) -> RateLimitPolicy {
        match class {
            EndpointClass::Stream => self.stream.into(),
            EndpointClass::MarketRest => self.market_rest.into(),
            EndpointClass::PrivateRest => self.private_rest.into(),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failures within the window that open the circuit.
    pub failure_threshold: u32,
    /// Rolling failure window (s).
    pub failure_window_secs: u64,
    /// Time spent open before a trial call (s).
    pub cool_down_secs: u64,
    /// Per-call timeout (ms).
    pub call_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            cool_down_secs: 30,
            call_timeout_ms: 5_000,
        }
    }
}

impl BreakerSettings {
    /// Convert to the breaker's configuration.
    #[must_use]
    pub const fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_secs(self.failure_window_secs),
            cool_down: Duration::from_secs(self.cool_down_secs),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

/// REST client pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum clients checked out at once.
    pub max_size: usize,
    /// Idle lifetime (s).
    pub max_idle_secs: u64,
    /// Checkout wait (ms).
    pub acquire_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 4,
            max_idle_secs: 90,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl PoolSettings {
    /// Convert to the pool's configuration.
    #[must_use]
    pub const fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.max_size,
            max_idle: Duration::from_secs(self.max_idle_secs),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }
}

// =============================================================================
// Connections
// =============================================================================

/// Reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// First delay (ms).
    pub base_ms: u64,
    /// Delay cap (ms).
    pub cap_ms: u64,
    /// Jitter as a fraction of the delay.
    pub jitter_factor: f64,
    /// Consecutive attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 30_000,
            jitter_factor: 0.2,
            max_attempts: 0,
        }
    }
}

impl ReconnectSettings {
    /// Convert to the backoff configuration.
    #[must_use]
    pub const fn to_reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            base: Duration::from_millis(self.base_ms),
            cap: Duration::from_millis(self.cap_ms),
            jitter_factor: self.jitter_factor,
            max_attempts: self.max_attempts,
        }
    }
}

/// Stream connection behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Silence after which a subscribed connection is degraded (s).
    pub idle_window_secs: u64,
    /// Application ping interval (s).
    pub ping_interval_secs: u64,
    /// Reply deadline after a ping (s).
    pub pong_timeout_secs: u64,
    /// WebSocket handshake deadline (s).
    pub connect_timeout_secs: u64,
    /// Longest wait for a stream rate-limit token (s).
    pub rate_limit_deadline_secs: u64,
    /// Rebalance confirmation deadline (s).
    pub migration_timeout_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            idle_window_secs: 30,
            ping_interval_secs: 20,
            pong_timeout_secs: 10,
            connect_timeout_secs: 10,
            rate_limit_deadline_secs: 10,
            migration_timeout_secs: 10,
        }
    }
}

impl StreamSettings {
    /// Subscription manager configuration for one exchange.
    #[must_use]
    pub fn manager_config(&self, exchange: &ExchangeSettings, reconnect: &ReconnectSettings) -> StreamManagerConfig {
        StreamManagerConfig {
            max_subscriptions_per_connection: exchange.max_subscriptions_per_connection,
            idle_window: Duration::from_secs(self.idle_window_secs),
            rate_limit_deadline: Duration::from_secs(self.rate_limit_deadline_secs),
            migration_timeout: Duration::from_secs(self.migration_timeout_secs),
            reconnect: reconnect.to_reconnect_config(),
        }
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Storage behind a shared tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierBackend {
    /// In-process moka cache (single instance only).
    #[default]
    Memory,
    /// Redis.
    Redis,
}

/// Hot tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotTierSettings {
    /// Maximum entries.
    pub capacity: u64,
    /// Upper bound on promoted TTLs (ms).
    pub ttl_cap_ms: u64,
}

impl Default for HotTierSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_cap_ms: 5_000,
        }
    }
}

/// Warm or durable tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedTierSettings {
    /// Storage backend.
    pub backend: TierBackend,
    /// Redis URL (required for the Redis backend).
    pub url: Option<String>,
    /// Prefix prepended to every stored key.
    pub key_prefix: String,
    /// Maximum entries for the memory backend.
    pub capacity: u64,
    /// Upper bound on promoted TTLs (s); unbounded when absent.
    pub ttl_cap_secs: Option<u64>,
    /// Redis connect deadline (ms).
    pub connect_timeout_ms: u64,
}

impl Default for SharedTierSettings {
    fn default() -> Self {
        Self {
            backend: TierBackend::Memory,
            url: None,
            key_prefix: String::new(),
            capacity: 100_000,
            ttl_cap_secs: None,
            connect_timeout_ms: 2_000,
        }
    }
}

/// Per-class TTL and freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSettings {
    /// Base TTL at depth 0 (s).
    pub base_ttl_secs: u64,
    /// Age after which a served value is stale (s).
    pub stale_after_secs: u64,
    /// Authoritative tier.
    pub tier_of_record: TierLevel,
}

/// Cache stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Key namespace.
    pub namespace: String,
    /// Key schema version.
    pub schema_version: u16,
    /// In-process tier.
    pub hot: HotTierSettings,
    /// Shared medium-TTL tier.
    pub warm: SharedTierSettings,
    /// Shared long-TTL tier.
    pub durable: SharedTierSettings,
    /// Per-class overrides; unlisted classes keep built-in values.
    pub classes: BTreeMap<DataClass, ClassSettings>,
    /// TTL added per dependency level (s).
    pub depth_step_secs: u64,
    /// Deadline for each tier operation (ms).
    pub tier_timeout_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            namespace: "mi".to_string(),
            schema_version: 1,
            hot: HotTierSettings::default(),
            warm: SharedTierSettings {
                ttl_cap_secs: Some(60),
                ..SharedTierSettings::default()
            },
            durable: SharedTierSettings::default(),
            classes: BTreeMap::new(),
            depth_step_secs: 30,
            tier_timeout_ms: 250,
        }
    }
}

impl CacheSettings {
    /// Key namespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an invalid name.
    pub fn key_namespace(&self) -> Result<KeyNamespace, ConfigError> {
        KeyNamespace::new(&self.namespace, self.schema_version)
            .map_err(|e| ConfigError::ValidationError(format!("cache.namespace: {e}")))
    }

    /// Coordinator configuration with overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an invalid namespace or
    /// a zero TTL.
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig, ConfigError> {
        let mut config = CoordinatorConfig::new(self.key_namespace()?);

        let defaults = TtlPolicy::default();
        let base = DataClass::ALL.into_iter().map(|class| {
            let ttl = self
                .classes
                .get(&class)
                .map_or_else(|| defaults.base(class), |c| Duration::from_secs(c.base_ttl_secs));
            (class, ttl)
        });
        config.ttl = TtlPolicy::new(base, Duration::from_secs(60), Duration::from_secs(self.depth_step_secs))
            .map_err(|e| ConfigError::ValidationError(format!("cache ttl: {e}")))?;

        for (class, settings) in &self.classes {
            config.classes.insert(
                *class,
                ClassPolicy {
                    tier_of_record: settings.tier_of_record,
                    stale_after: Duration::from_secs(settings.stale_after_secs),
                },
            );
        }
        config.hot_ttl_cap = Duration::from_millis(self.hot.ttl_cap_ms);
        config.warm_ttl_cap = self.warm.ttl_cap_secs.map_or(Duration::MAX, Duration::from_secs);
        config.tier_timeout = Duration::from_millis(self.tier_timeout_ms);
        Ok(config)
    }
}

// =============================================================================
// Warming and Ingestion
// =============================================================================

/// One warming phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSettings {
    /// Name.
    pub name: String,
    /// First UTC hour (inclusive).
    pub start_hour: u8,
    /// Last UTC hour (exclusive).
    pub end_hour: u8,
    /// Pause between cycles (s).
    pub interval_secs: u64,
    /// Keys per cycle.
    pub max_requests: usize,
    /// Wall time per cycle (ms).
    pub time_budget_ms: u64,
}

impl From<&PhaseSettings> for WarmPhase {
    fn from(phase: &PhaseSettings) -> Self {
        Self {
            name: phase.name.clone(),
            start_hour: phase.start_hour,
            end_hour: phase.end_hour,
            interval: Duration::from_secs(phase.interval_secs),
            max_requests: phase.max_requests,
            time_budget: Duration::from_millis(phase.time_budget_ms),
        }
    }
}

/// Cache warming schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmingSettings {
    /// Whether the warmer runs.
    pub enabled: bool,
    /// Phases, first match wins.
    pub phases: Vec<PhaseSettings>,
    /// Phase outside every window.
    pub quiet: PhaseSettings,
}

impl Default for WarmingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            phases: vec![PhaseSettings {
                name: "active".to_string(),
                start_hour: 13,
                end_hour: 21,
                interval_secs: 15,
                max_requests: 100,
                time_budget_ms: 5_000,
            }],
            quiet: PhaseSettings {
                name: "quiet".to_string(),
                start_hour: 0,
                end_hour: 0,
                interval_secs: 60,
                max_requests: 20,
                time_budget_ms: 5_000,
            },
        }
    }
}

impl WarmingSettings {
    /// Schedule for the warmer.
    #[must_use]
    pub fn schedule(&self) -> WarmSchedule {
        WarmSchedule::new(self.phases.iter().map(WarmPhase::from).collect(), (&self.quiet).into())
    }
}

/// Ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionSettings {
    /// Shard workers.
    pub workers: usize,
    /// Capacity of each shard channel.
    pub channel_capacity: usize,
    /// Unhealthy time before REST fallback (s).
    pub fallback_grace_secs: u64,
    /// REST poll interval while in fallback (ms).
    pub poll_interval_ms: u64,
    /// Health check interval (ms).
    pub check_interval_ms: u64,
    /// Concurrent REST fetches per poll round.
    pub rest_concurrency: usize,
    /// Classes polled in fallback.
    pub poll_classes: Vec<DataClass>,
    /// Default `wait_until_ready` deadline at start-up (s).
    pub ready_timeout_secs: u64,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        let defaults = IngestionConfig::default();
        Self {
            workers: defaults.workers,
            channel_capacity: defaults.channel_capacity,
            fallback_grace_secs: defaults.fallback_grace.as_secs(),
            poll_interval_ms: 2_000,
            check_interval_ms: 1_000,
            rest_concurrency: defaults.rest_concurrency,
            poll_classes: defaults.poll_classes,
            ready_timeout_secs: 30,
        }
    }
}

impl IngestionSettings {
    /// Pipeline configuration.
    #[must_use]
    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            workers: self.workers,
            channel_capacity: self.channel_capacity,
            fallback_grace: Duration::from_secs(self.fallback_grace_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            check_interval: Duration::from_millis(self.check_interval_ms),
            rest_concurrency: self.rest_concurrency,
            poll_classes: self.poll_classes.clone(),
        }
    }
}

/// HTTP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub bind_address: String,
    /// Health and metrics port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            health_port: 8083,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_defaults() {
        let settings = ExchangeSettings::default();
        assert_eq!(settings.stream_url(), "wss://stream.bybit.com/v5/public/linear");
        assert_eq!(settings.max_subscriptions_per_connection, 50);
        assert_eq!(settings.rate_limits.policy(EndpointClass::MarketRest), RateLimitPolicy::new(10, 600));
        assert!(settings.signer().unwrap().is_none());
    }

    #[test]
    fn blank_credentials_mean_unsigned() {
        let settings = ExchangeSettings {
            credentials: Some(CredentialSettings::default()),
            ..ExchangeSettings::default()
        };
        assert!(settings.signer().unwrap().is_none());
    }

    #[test]
    fn half_configured_credentials_are_rejected() {
        let settings = ExchangeSettings {
            credentials: Some(CredentialSettings {
                api_key: "key".to_string(),
                api_secret: String::new(),
            }),
            ..ExchangeSettings::default()
        };
        assert!(settings.signer().is_err());
    }

    #[test]
    fn credential_debug_is_redacted() {
        let creds = CredentialSettings {
            api_key: "visible-key".to_string(),
            api_secret: "visible-secret".to_string(),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("visible"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn class_overrides_reach_coordinator() {
        let mut settings = CacheSettings::default();
        settings.classes.insert(
            DataClass::Ticker,
            ClassSettings {
                base_ttl_secs: 12,
                stale_after_secs: 3,
                tier_of_record: TierLevel::Durable,
            },
        );
        let config = settings.coordinator_config().unwrap();
        assert_eq!(config.ttl.base(DataClass::Ticker), Duration::from_secs(12));
        assert_eq!(config.ttl.base(DataClass::OrderBook), Duration::from_secs(10));
        assert_eq!(config.class(DataClass::Ticker).tier_of_record, TierLevel::Durable);
        assert_eq!(config.class(DataClass::Ticker).stale_after, Duration::from_secs(3));
        assert_eq!(config.warm_ttl_cap, Duration::from_secs(60));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let mut settings = CacheSettings::default();
        settings.classes.insert(
            DataClass::Trade,
            ClassSettings {
                base_ttl_secs: 0,
                stale_after_secs: 1,
                tier_of_record: TierLevel::Warm,
            },
        );
        assert!(settings.coordinator_config().is_err());
    }

    #[test]
    fn warming_schedule_conversion() {
        let schedule = WarmingSettings::default().schedule();
        let at = chrono::DateTime::parse_from_rfc3339("2024-03-01T14:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(schedule.phase_at(at).name, "active");
    }
}

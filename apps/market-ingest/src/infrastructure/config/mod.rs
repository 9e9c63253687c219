//! Configuration Module
//!
//! YAML configuration with environment variable interpolation.
//!
//! # Loading
//!
//! 1. `.env` is loaded from the working directory or an ancestor.
//! 2. `MARKET_INGEST_CONFIG` names the YAML file (default `config.yaml`);
//!    a missing file yields the built-in defaults.
//! 3. `${VAR}` and `${VAR:-default}` are substituted before parsing.
//! 4. `MARKET_INGEST_HEALTH_PORT` overrides `server.health_port`.
//! 5. The result is validated.
//!
//! ```yaml
//! exchanges:
//!   bybit:
//!     category: linear
//!     credentials:
//!       api_key: "${BYBIT_API_KEY:-}"
//!       api_secret: "${BYBIT_API_SECRET:-}"
//! cache:
//!   warm:
//!     backend: redis
//!     url: ${REDIS_URL:-redis://127.0.0.1:6379}
//! bootstrap_symbols: ["bybit:BTCUSDT", "bybit:ETHUSDT"]
//! ```

mod settings;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use settings::{
    BreakerSettings, CacheSettings, ClassSettings, CredentialSettings, ExchangeSettings, HotTierSettings,
    IngestionSettings, LimitSettings, PhaseSettings, PoolSettings, RateLimitSettings, ReconnectSettings,
    ServerSettings, SharedTierSettings, StreamSettings, TierBackend, WarmingSettings,
};

use crate::domain::market::Symbol;

/// Environment variable naming the YAML file.
pub const CONFIG_PATH_ENV: &str = "MARKET_INGEST_CONFIG";
/// Environment variable overriding the health port.
pub const HEALTH_PORT_ENV: &str = "MARKET_INGEST_HEALTH_PORT";
/// YAML file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("config validation failed: {0}")]
    ValidationError(String),

    /// An override variable could not be parsed.
    #[error("invalid value for {name}: {value}")]
    InvalidEnvVar {
        /// Variable name.
        name: String,
        /// Raw value.
        value: String,
    },
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Exchanges by identifier.
    #[serde(default = "default_exchanges")]
    pub exchanges: BTreeMap<String, ExchangeSettings>,
    /// Reconnect backoff.
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    /// Stream connection behaviour.
    #[serde(default)]
    pub stream: StreamSettings,
    /// Cache stack.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Cache warming.
    #[serde(default)]
    pub warming: WarmingSettings,
    /// Ingestion pipeline.
    #[serde(default)]
    pub ingestion: IngestionSettings,
    /// HTTP server.
    #[serde(default)]
    pub server: ServerSettings,
    /// Symbols subscribed at start-up, as `exchange:ticker`.
    #[serde(default)]
    pub bootstrap_symbols: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            exchanges: default_exchanges(),
            reconnect: ReconnectSettings::default(),
            stream: StreamSettings::default(),
            cache: CacheSettings::default(),
            warming: WarmingSettings::default(),
            ingestion: IngestionSettings::default(),
            server: ServerSettings::default(),
            bootstrap_symbols: Vec::new(),
        }
    }
}

fn default_exchanges() -> BTreeMap<String, ExchangeSettings> {
    BTreeMap::from([("bybit".to_string(), ExchangeSettings::default())])
}

impl IngestConfig {
    /// Load `.env`, the YAML file and environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file exists but cannot be read,
    /// parsed, or validated, or an override is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }

        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            load_config(Some(&path))?
        } else {
            tracing::warn!(path = %path, "Config file not found, using defaults");
            Self::default()
        };

        if let Ok(raw) = std::env::var(HEALTH_PORT_ENV) {
            config.server.health_port = raw.trim().parse().map_err(|_| ConfigError::InvalidEnvVar {
                name: HEALTH_PORT_ENV.to_string(),
                value: raw.clone(),
            })?;
        }

        validate_config(&config)?;
        Ok(config)
    }

    /// Parsed bootstrap symbols.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an entry that is not
    /// `exchange:ticker`, names an unconfigured exchange, or fails symbol
    /// validation.
    pub fn bootstrap_symbols(&self) -> Result<Vec<Symbol>, ConfigError> {
        self.bootstrap_symbols
            .iter()
            .map(|raw| {
                let (exchange, ticker) = raw.split_once(':').ok_or_else(|| {
                    ConfigError::ValidationError(format!("bootstrap symbol '{raw}' is not exchange:ticker"))
                })?;
                if !self.exchanges.contains_key(exchange) {
                    return Err(ConfigError::ValidationError(format!(
                        "bootstrap symbol '{raw}' names unconfigured exchange '{exchange}'"
                    )));
                }
                Symbol::new(exchange, ticker)
                    .map_err(|e| ConfigError::ValidationError(format!("bootstrap symbol '{raw}': {e}")))
            })
            .collect()
    }
}

// ============================================
// Configuration Loading
// ============================================

/// Load configuration from a YAML file with environment variable interpolation.
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: Option<&str>) -> Result<IngestConfig, ConfigError> {
    let path = path.unwrap_or(DEFAULT_CONFIG_PATH);

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_string(),
        source: e,
    })?;

    load_config_from_string(&contents)
}

/// Load configuration from a YAML string.
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_config_from_string(yaml: &str) -> Result<IngestConfig, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    if interpolated.trim().is_empty() {
        return Ok(IngestConfig::default());
    }
    let config: IngestConfig = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax. An unset or empty
/// variable without a default becomes an empty string.
#[allow(clippy::expect_used)] // Regex is compile-time constant
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map_or("", |m| m.as_str());
        match std::env::var(&cap[1]) {
            Ok(v) if !v.is_empty() => v,
            _ => default_value.to_string(),
        }
    })
    .into_owned()
}

/// Validate configuration values.
fn validate_config(config: &IngestConfig) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

    if config.exchanges.is_empty() {
        return invalid("at least one exchange must be configured".to_string());
    }

    for (name, exchange) in &config.exchanges {
        if name.is_empty() || name.contains(':') {
            return invalid(format!("exchange name '{name}' is invalid"));
        }
        if !["linear", "inverse", "spot"].contains(&exchange.category.as_str()) {
            return invalid(format!(
                "exchanges.{name}.category must be one of linear, inverse, spot"
            ));
        }
        let ws = exchange.stream_url();
        if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
            return invalid(format!("exchanges.{name}.ws_url must be a ws:// or wss:// URL"));
        }
        if !(exchange.rest_url.starts_with("http://") || exchange.rest_url.starts_with("https://")) {
            return invalid(format!("exchanges.{name}.rest_url must be an http(s) URL"));
        }
        if exchange.max_subscriptions_per_connection == 0 {
            return invalid(format!("exchanges.{name}.max_subscriptions_per_connection must be positive"));
        }
        if exchange.circuit_breaker.failure_threshold == 0 {
            return invalid(format!("exchanges.{name}.circuit_breaker.failure_threshold must be positive"));
        }
        if exchange.pool.max_size == 0 {
            return invalid(format!("exchanges.{name}.pool.max_size must be positive"));
        }
        exchange.signer()?;
    }

    if !(0.0..=1.0).contains(&config.reconnect.jitter_factor) {
        return invalid("reconnect.jitter_factor must be between 0.0 and 1.0".to_string());
    }
    if config.reconnect.base_ms == 0 || config.reconnect.base_ms > config.reconnect.cap_ms {
        return invalid("reconnect.base_ms must be positive and not exceed cap_ms".to_string());
    }

    for (tier, settings) in [("warm", &config.cache.warm), ("durable", &config.cache.durable)] {
        if settings.backend == TierBackend::Redis && settings.url.as_deref().is_none_or(str::is_empty) {
            return invalid(format!("cache.{tier}.url is required for the redis backend"));
        }
    }
    config.cache.coordinator_config()?;

    for phase in config.warming.phases.iter().chain(std::iter::once(&config.warming.quiet)) {
        if phase.start_hour > 23 || phase.end_hour > 23 {
            return invalid(format!("warming phase '{}' hours must be 0-23", phase.name));
        }
        if phase.interval_secs == 0 || phase.max_requests == 0 {
            return invalid(format!(
                "warming phase '{}' needs a positive interval and request budget",
                phase.name
            ));
        }
    }

    if config.ingestion.workers == 0 || config.ingestion.channel_capacity == 0 {
        return invalid("ingestion.workers and ingestion.channel_capacity must be positive".to_string());
    }
    if config.ingestion.rest_concurrency == 0 {
        return invalid("ingestion.rest_concurrency must be positive".to_string());
    }

    config.bootstrap_symbols()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cache::TierLevel;
    use crate::domain::market::DataClass;

    #[test]
    fn empty_document_is_defaults() {
        let config = load_config_from_string("").unwrap();
        assert!(config.exchanges.contains_key("bybit"));
        assert_eq!(config.server.health_port, 8083);
        assert_eq!(config.ingestion.workers, 4);
    }

    #[test]
    fn env_var_with_default_when_missing() {
        let input = "category: ${MARKET_INGEST_TEST_NONEXISTENT_VAR:-spot}";
        assert_eq!(interpolate_env_vars(input), "category: spot");
    }

    #[test]
    fn env_var_without_default_becomes_empty() {
        let input = "api_key: ${MARKET_INGEST_TEST_UNLIKELY_TO_EXIST}";
        assert_eq!(interpolate_env_vars(input), "api_key: ");
    }

    #[test]
    #[allow(clippy::literal_string_with_formatting_args)]
    fn env_var_uses_existing_value() {
        let result = interpolate_env_vars("path: ${PATH:-default}");
        assert_ne!(result, "path: default");
        assert!(result.starts_with("path: "));
    }

    #[test]
    fn full_config_parse() {
        let yaml = r#"
exchanges:
  bybit:
    category: spot
    rest_url: "https://api-testnet.bybit.com"
    max_subscriptions_per_connection: 10
    rate_limits:
      market_rest: { per_second: 2, per_minute: 100 }
    circuit_breaker:
      failure_threshold: 3
reconnect:
  base_ms: 250
  cap_ms: 10000
cache:
  namespace: md
  classes:
    ticker: { base_ttl_secs: 20, stale_after_secs: 4, tier_of_record: durable }
ingestion:
  workers: 8
bootstrap_symbols: ["bybit:BTCUSDT"]
"#;
        let config = load_config_from_string(yaml).unwrap();
        let bybit = &config.exchanges["bybit"];
        assert_eq!(bybit.category, "spot");
        assert_eq!(bybit.stream_url(), "wss://stream.bybit.com/v5/public/spot");
        assert_eq!(bybit.rate_limits.market_rest.per_minute, 100);
        assert_eq!(bybit.rate_limits.stream.per_minute, 100);
        assert_eq!(bybit.circuit_breaker.failure_threshold, 3);
        assert_eq!(bybit.circuit_breaker.cool_down_secs, 30);
        assert_eq!(config.reconnect.base_ms, 250);
        assert_eq!(config.ingestion.workers, 8);
        let ticker = config.cache.classes[&DataClass::Ticker];
        assert_eq!(ticker.tier_of_record, TierLevel::Durable);
        assert_eq!(config.bootstrap_symbols().unwrap()[0].ticker(), "BTCUSDT");
    }

    #[test]
    fn validation_rejects_unknown_category() {
        let yaml = "exchanges:\n  bybit:\n    category: options\n";
        let err = load_config_from_string(yaml).unwrap_err();
        assert!(err.to_string().contains("category"));
    }

    #[test]
    fn validation_requires_redis_url() {
        let yaml = "cache:\n  warm:\n    backend: redis\n";
        let err = load_config_from_string(yaml).unwrap_err();
        assert!(err.to_string().contains("cache.warm.url"));
    }

    #[test]
    fn validation_rejects_bad_bootstrap_symbols() {
        for yaml in [
            "bootstrap_symbols: [\"BTCUSDT\"]",
            "bootstrap_symbols: [\"okx:BTCUSDT\"]",
            "bootstrap_symbols: [\"bybit:SYSTEM\"]",
        ] {
            assert!(load_config_from_string(yaml).is_err(), "{yaml}");
        }
    }

    #[test]
    fn validation_rejects_bad_phase_hours() {
        let yaml = r"
warming:
  phases:
    - { name: late, start_hour: 22, end_hour: 24, interval_secs: 10, max_requests: 5, time_budget_ms: 1000 }
";
        let err = load_config_from_string(yaml).unwrap_err();
        assert!(err.to_string().contains("late"));
    }
}

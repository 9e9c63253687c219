//! Configuration Loading Integration Tests
//!
//! Loads YAML from disk with environment interpolation and checks that the
//! parsed sections convert into the runtime configuration of each
//! component.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::NamedTempFile;

use market_ingest::domain::cache::TierLevel;
use market_ingest::domain::market::DataClass;
use market_ingest::infrastructure::config::{ConfigError, TierBackend};
use market_ingest::resilience::{EndpointClass, RateLimitPolicy};
use market_ingest::{load_config, load_config_from_string};

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const TWO_EXCHANGES: &str = r#"
exchanges:
  bybit:
    category: linear
    rest_url: ${MARKET_INGEST_IT_UNSET_REST_URL:-http://127.0.0.1:18080}
    credentials:
      api_key: "${MARKET_INGEST_IT_UNSET_KEY}"
      api_secret: "${MARKET_INGEST_IT_UNSET_SECRET}"
    max_subscriptions_per_connection: 20
    rate_limits:
      stream: { per_second: 2, per_minute: 30 }
  bybit_spot:
    category: spot
    ws_url: ws://127.0.0.1:18081/spot
    circuit_breaker:
      failure_threshold: 2
      cool_down_secs: 5
reconnect:
  base_ms: 100
  cap_ms: 2000
  jitter_factor: 0.1
cache:
  namespace: md
  schema_version: 3
  durable:
    backend: redis
    url: ${MARKET_INGEST_IT_UNSET_REDIS:-redis://127.0.0.1:6380}
  classes:
    trade: { base_ttl_secs: 15, stale_after_secs: 3, tier_of_record: hot }
ingestion:
  workers: 2
  fallback_grace_secs: 4
  poll_interval_ms: 500
  poll_classes: [ticker]
bootstrap_symbols: ["bybit:BTCUSDT", "bybit_spot:ETHUSDT"]
"#;

#[test]
fn file_with_two_exchanges_loads() {
    let file = write_config(TWO_EXCHANGES);
    let config = load_config(Some(file.path().to_str().unwrap())).unwrap();

    assert_eq!(config.exchanges.len(), 2);
    let linear = &config.exchanges["bybit"];
    assert_eq!(linear.rest_url, "http://127.0.0.1:18080");
    assert!(linear.signer().unwrap().is_none());
    assert_eq!(linear.rate_limits.policy(EndpointClass::Stream), RateLimitPolicy::new(2, 30));
    assert_eq!(
        linear.rate_limits.policy(EndpointClass::MarketRest),
        RateLimitPolicy::new(10, 600)
    );

    let spot = &config.exchanges["bybit_spot"];
    assert_eq!(spot.stream_url(), "ws://127.0.0.1:18081/spot");
    let breaker = spot.circuit_breaker.to_breaker_config();
    assert_eq!(breaker.failure_threshold, 2);
    assert_eq!(breaker.cool_down, Duration::from_secs(5));
    assert_eq!(breaker.failure_window, Duration::from_secs(60));

    let symbols = config.bootstrap_symbols().unwrap();
    assert_eq!(symbols.len(), 2);
    assert_eq!(symbols[1].exchange(), "bybit_spot");
    assert_eq!(symbols[1].ticker(), "ETHUSDT");
}

#[test]
fn sections_convert_to_runtime_settings() {
    let config = load_config_from_string(TWO_EXCHANGES).unwrap();

    let manager = config
        .stream
        .manager_config(&config.exchanges["bybit"], &config.reconnect);
    assert_eq!(manager.max_subscriptions_per_connection, 20);
    assert_eq!(manager.reconnect.base, Duration::from_millis(100));
    assert_eq!(manager.reconnect.cap, Duration::from_secs(2));

    let ingestion = config.ingestion.ingestion_config();
    assert_eq!(ingestion.workers, 2);
    assert_eq!(ingestion.fallback_grace, Duration::from_secs(4));
    assert_eq!(ingestion.poll_interval, Duration::from_millis(500));
    assert_eq!(ingestion.poll_classes, vec![DataClass::Ticker]);

    assert_eq!(config.cache.durable.backend, TierBackend::Redis);
    assert_eq!(config.cache.durable.url.as_deref(), Some("redis://127.0.0.1:6380"));

    let coordinator = config.cache.coordinator_config().unwrap();
    assert_eq!(coordinator.namespace.name(), "md");
    assert_eq!(coordinator.namespace.version(), 3);
    let trade = coordinator.class(DataClass::Trade);
    assert_eq!(trade.tier_of_record, TierLevel::Hot);
    assert_eq!(trade.stale_after, Duration::from_secs(3));
    assert_eq!(coordinator.ttl.base(DataClass::Trade), Duration::from_secs(15));
    assert_eq!(coordinator.warm_ttl_cap, Duration::from_secs(60));
}

#[test]
fn example_config_is_valid() {
    let config = load_config_from_string(include_str!("../config.example.yaml")).unwrap();
    assert!(config.exchanges.contains_key("bybit"));
    assert!(config.warming.enabled);
    let schedule = config.warming.schedule();
    let afternoon = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap();
    let night = Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap();
    assert_eq!(schedule.phase_at(afternoon).name, "active");
    assert_eq!(schedule.phase_at(night).name, "quiet");
    assert_eq!(config.bootstrap_symbols().unwrap().len(), 2);
    assert_eq!(config.server.health_port, 8083);
}

#[test]
fn missing_file_reports_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.yaml");

    let err = load_config(Some(path.to_str().unwrap())).unwrap_err();
    assert!(matches!(err, ConfigError::ReadError { .. }));
    assert!(err.to_string().contains("absent.yaml"));
}

#[test]
fn malformed_yaml_is_a_parse_error() {
    let file = write_config("exchanges: [unclosed\n");
    let err = load_config(Some(file.path().to_str().unwrap())).unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(_)));
}

#[test]
fn unset_redis_url_fails_validation() {
    let yaml = "cache:\n  warm:\n    backend: redis\n    url: ${MARKET_INGEST_IT_UNSET_REDIS}\n";
    let err = load_config_from_string(yaml).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
    assert!(err.to_string().contains("cache.warm.url"));
}

#[test]
fn half_configured_credentials_are_rejected() {
    let yaml = "exchanges:\n  bybit:\n    credentials:\n      api_key: abc\n      api_secret: \"\"\n";
    let err = load_config_from_string(yaml).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}

#[test]
fn invalid_reconnect_bounds_are_rejected() {
    for yaml in [
        "reconnect:\n  base_ms: 5000\n  cap_ms: 1000\n",
        "reconnect:\n  jitter_factor: 1.5\n",
        "ingestion:\n  workers: 0\n",
        "exchanges: {}\n",
    ] {
        assert!(
            matches!(load_config_from_string(yaml), Err(ConfigError::ValidationError(_))),
            "{yaml}"
        );
    }
}

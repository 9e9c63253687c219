//! Bybit REST Adapter Integration Tests
//!
//! Runs the REST adapter against a mock HTTP server: payload decoding,
//! mapping of HTTP statuses and `retCode` values, request signing, and the
//! limiter/breaker guard wrapped around it.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;
use serde_json::json;
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use market_ingest::application::ports::{ExchangeRest, FetchError, SnapshotFetcher};
use market_ingest::application::services::GuardedFetcher;
use market_ingest::domain::cache::KeyNamespace;
use market_ingest::domain::market::{DataClass, MarketPayload, Symbol};
use market_ingest::error::ErrorKind;
use market_ingest::infrastructure::exchange::bybit::{
    BybitRest, BybitRestConfig, Credentials, DEFAULT_RECV_WINDOW, Signer,
};
use market_ingest::infrastructure::pool::PoolConfig;
use market_ingest::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState, EndpointClass,
    EndpointKey, RateLimitPolicy, RateLimiter,
};

fn btc() -> Symbol {
    Symbol::new("bybit", "BTCUSDT").unwrap()
}

fn rest_config(server: &MockServer) -> BybitRestConfig {
    BybitRestConfig {
        base_url: server.uri(),
        request_timeout: Duration::from_secs(2),
        ..BybitRestConfig::default()
    }
}

fn rest(server: &MockServer, signer: Option<Signer>) -> BybitRest {
    BybitRest::new(
        rest_config(server),
        Arc::new(CircuitBreaker::new("bybit/market_rest", CircuitBreakerConfig::default())),
        PoolConfig::default(),
        signer,
    )
}

fn envelope(result: serde_json::Value) -> serde_json::Value {
    json!({
        "retCode": 0,
        "retMsg": "OK",
        "result": result,
        "time": Utc::now().timestamp_millis(),
    })
}

fn ticker_body() -> serde_json::Value {
    envelope(json!({
        "category": "linear",
        "list": [{
            "symbol": "BTCUSDT",
            "lastPrice": "65000.5",
            "bid1Price": "65000",
            "ask1Price": "65001",
            "volume24h": "12345.678",
        }],
    }))
}

async fn mount_ticker(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/v5/market/tickers"))
        .and(query_param("category", "linear"))
        .and(query_param("symbol", "BTCUSDT"))
        .respond_with(response)
        .mount(server)
        .await;
}

// =============================================================================
// Decoding
// =============================================================================

#[tokio::test]
async fn ticker_is_decoded_into_a_normalized_event() {
    let server = MockServer::start().await;
    mount_ticker(&server, ResponseTemplate::new(200).set_body_json(ticker_body())).await;

    let event = rest(&server, None).fetch(&btc(), DataClass::Ticker).await.unwrap();

    assert_eq!(event.symbol, btc());
    let MarketPayload::Ticker(ticker) = event.payload else {
        panic!("expected ticker payload");
    };
    assert_eq!(ticker.last_price, dec!(65000.5));
    assert_eq!(ticker.bid_price, Some(dec!(65000)));
    assert_eq!(ticker.ask_price, Some(dec!(65001)));
    assert_eq!(ticker.volume_24h, Some(dec!(12345.678)));
}

#[tokio::test]
async fn open_interest_uses_the_latest_point() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/open-interest"))
        .and(query_param("intervalTime", "5min"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "symbol": "BTCUSDT",
            "list": [
                {"openInterest": "51234.5", "timestamp": Utc::now().timestamp_millis().to_string()},
            ],
        }))))
        .mount(&server)
        .await;

    let event = rest(&server, None)
        .fetch(&btc(), DataClass::OpenInterest)
        .await
        .unwrap();
    let MarketPayload::OpenInterest(data) = event.payload else {
        panic!("expected open interest payload");
    };
    assert_eq!(data.open_interest, dec!(51234.5));
}

#[tokio::test]
async fn empty_list_is_reported_as_empty() {
    let server = MockServer::start().await;
    mount_ticker(
        &server,
        ResponseTemplate::new(200).set_body_json(envelope(json!({"category": "linear", "list": []}))),
    )
    .await;

    let err = rest(&server, None).fetch(&btc(), DataClass::Ticker).await.unwrap_err();
    assert!(matches!(err, FetchError::Empty { data_class: DataClass::Ticker, .. }));
    assert!(!err.counts_as_failure());
}

#[tokio::test]
async fn derived_values_have_no_rest_endpoint() {
    let server = MockServer::start().await;

    let err = rest(&server, None).fetch(&btc(), DataClass::Derived).await.unwrap_err();
    assert_eq!(err, FetchError::Unsupported(DataClass::Derived));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn spot_category_has_no_open_interest() {
    let server = MockServer::start().await;
    let rest = BybitRest::new(
        BybitRestConfig {
            category: "spot".to_string(),
            ..rest_config(&server)
        },
        Arc::new(CircuitBreaker::new("bybit/market_rest", CircuitBreakerConfig::default())),
        PoolConfig::default(),
        None,
    );

    let err = rest.fetch(&btc(), DataClass::OpenInterest).await.unwrap_err();
    assert_eq!(err, FetchError::Unsupported(DataClass::OpenInterest));
}

// =============================================================================
// Error Mapping
// =============================================================================

#[tokio::test]
async fn rate_limit_ret_code_is_mapped() {
    let server = MockServer::start().await;
    mount_ticker(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 10006,
            "retMsg": "Too many visits!",
            "result": {},
        })),
    )
    .await;

    let err = rest(&server, None).fetch(&btc(), DataClass::Ticker).await.unwrap_err();
    assert!(matches!(err, FetchError::RateLimited { .. }));
    assert!(err.counts_as_failure());
}

#[tokio::test]
async fn http_429_carries_retry_after() {
    let server = MockServer::start().await;
    mount_ticker(&server, ResponseTemplate::new(429).insert_header("Retry-After", "3")).await;

    let err = rest(&server, None).fetch(&btc(), DataClass::Ticker).await.unwrap_err();
    assert_eq!(
        err,
        FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(3))
        }
    );
}

#[tokio::test]
async fn http_401_is_an_auth_failure() {
    let server = MockServer::start().await;
    mount_ticker(&server, ResponseTemplate::new(401)).await;

    let err = rest(&server, None).fetch(&btc(), DataClass::Ticker).await.unwrap_err();
    assert!(matches!(err, FetchError::Auth(_)));
    assert!(!err.counts_as_failure());
}

#[tokio::test]
async fn server_errors_count_against_the_breaker() {
    let server = MockServer::start().await;
    mount_ticker(&server, ResponseTemplate::new(503).set_body_string("maintenance")).await;

    let err = rest(&server, None).fetch(&btc(), DataClass::Ticker).await.unwrap_err();
    assert_eq!(
        err,
        FetchError::Status {
            code: 503,
            body: "maintenance".to_string()
        }
    );
    assert!(err.counts_as_failure());
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let server = MockServer::start().await;
    mount_ticker(&server, ResponseTemplate::new(200).set_body_string("<html>oops</html>")).await;

    let err = rest(&server, None).fetch(&btc(), DataClass::Ticker).await.unwrap_err();
    assert!(matches!(err, FetchError::Decode(_)));
}

// =============================================================================
// Signing
// =============================================================================

#[tokio::test]
async fn credential_check_sends_signed_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/account/wallet-balance"))
        .and(query_param("accountType", "UNIFIED"))
        .and(header_exists("X-BAPI-API-KEY"))
        .and(header_exists("X-BAPI-TIMESTAMP"))
        .and(header_exists("X-BAPI-RECV-WINDOW"))
        .and(header_exists("X-BAPI-SIGN"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({"list": []}))))
        .expect(1)
        .mount(&server)
        .await;

    let signer = Signer::new(Credentials::new("key-123", "secret-456").unwrap(), DEFAULT_RECV_WINDOW);
    let rest = rest(&server, Some(signer));
    assert!(rest.has_credentials());
    rest.verify_credentials().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let key = requests[0].headers.get("X-BAPI-API-KEY").unwrap();
    assert_eq!(key.to_str().unwrap(), "key-123");
}

#[tokio::test]
async fn rejected_signature_is_an_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/account/wallet-balance"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 10004,
            "retMsg": "error sign!",
            "result": {},
        })))
        .mount(&server)
        .await;

    let signer = Signer::new(Credentials::new("key-123", "wrong").unwrap(), DEFAULT_RECV_WINDOW);
    let err = rest(&server, Some(signer)).verify_credentials().await.unwrap_err();
    assert_eq!(err, FetchError::Auth("error sign!".to_string()));
}

#[tokio::test]
async fn credential_check_without_credentials_never_calls_out() {
    let server = MockServer::start().await;

    let rest = rest(&server, None);
    assert!(!rest.has_credentials());
    assert!(matches!(rest.verify_credentials().await, Err(FetchError::Auth(_))));
    assert!(server.received_requests().await.unwrap().is_empty());
}

// =============================================================================
// Guarded Fetch
// =============================================================================

fn guarded(server: &MockServer, breakers: &Arc<CircuitBreakerRegistry>, limiter: &Arc<RateLimiter>) -> GuardedFetcher {
    let endpoint = EndpointKey::new("bybit", EndpointClass::MarketRest);
    let rest = BybitRest::new(rest_config(server), breakers.get(&endpoint), PoolConfig::default(), None);
    GuardedFetcher::new(
        Arc::new(rest) as Arc<dyn ExchangeRest>,
        Arc::clone(limiter),
        Arc::clone(breakers),
        KeyNamespace::new("mi", 1).unwrap(),
        Duration::from_secs(1),
    )
}

#[tokio::test]
async fn throttled_response_drains_the_local_limiter() {
    let server = MockServer::start().await;
    mount_ticker(&server, ResponseTemplate::new(429).insert_header("Retry-After", "60")).await;

    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
    let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(10, 600)));
    let fetcher = guarded(&server, &breakers, &limiter);

    let err = fetcher.fetch_snapshot(&btc(), DataClass::Ticker).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);

    // The next call would have to outwait the hold-off, so it fails locally.
    let err = fetcher.fetch_snapshot(&btc(), DataClass::Ticker).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_server_errors_open_the_breaker() {
    let server = MockServer::start().await;
    mount_ticker(&server, ResponseTemplate::new(502)).await;

    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 3,
        ..CircuitBreakerConfig::default()
    }));
    let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(100, 6000)));
    let fetcher = guarded(&server, &breakers, &limiter);

    for _ in 0..3 {
        let err = fetcher.fetch_snapshot(&btc(), DataClass::Ticker).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
    assert_eq!(breakers.state(&fetcher.endpoint()), CircuitBreakerState::Open);

    let err = fetcher.fetch_snapshot(&btc(), DataClass::Ticker).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn guarded_fetch_returns_the_exchange_value() {
    let server = MockServer::start().await;
    mount_ticker(&server, ResponseTemplate::new(200).set_body_json(ticker_body())).await;

    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
    let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(10, 600)));
    let fetcher = guarded(&server, &breakers, &limiter);

    let event = fetcher.fetch_snapshot(&btc(), DataClass::Ticker).await.unwrap();
    assert_eq!(event.payload.data_class(), DataClass::Ticker);
    let (per_second, _) = limiter.available(&fetcher.endpoint());
    assert!(per_second < 10.0);
}

//! Bybit Market REST
//!
//! [`ExchangeRest`] adapter over the Bybit v5 market endpoints, used for
//! polling fallback and cache warming. HTTP clients come from a
//! [`ConnectionPool`] so concurrent polls share a bounded set of
//! keep-alive clients.
//!
//! | Data class    | Endpoint                    |
//! |---------------|-----------------------------|
//! | Ticker        | `/v5/market/tickers`        |
//! | Order book    | `/v5/market/orderbook`      |
//! | Trade         | `/v5/market/recent-trade`   |
//! | Open interest | `/v5/market/open-interest`  |
//!
//! Bybit reports most failures inside a `200 OK` envelope, so both the HTTP
//! status and `retCode` are mapped to [`FetchError`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;

use super::auth::Signer;
use super::codec::{self, CodecError};
use super::messages::{OpenInterestResult, OrderBookResult, RecentTradesResult, RestEnvelope, TickersResult};
use crate::application::ports::{ExchangeRest, FetchError};
use crate::domain::market::{DataClass, MarketPayload, NormalizedEvent, OpenInterestData, OrderBookData, Symbol};
use crate::infrastructure::pool::{ConnectionPool, HandleFactory, PoolConfig, PoolError};
use crate::resilience::CircuitBreaker;

/// `retCode` for an exceeded request rate.
pub const RET_RATE_LIMITED: i64 = 10006;
/// `retCode` values for rejected credentials or signatures.
pub const RET_AUTH: [i64; 3] = [10003, 10004, 10005];

/// Header carrying the epoch ms at which the rate-limit window resets.
const HEADER_LIMIT_RESET: &str = "X-Bapi-Limit-Reset-Timestamp";

// =============================================================================
// Configuration
// =============================================================================

/// REST adapter configuration.
#[derive(Debug, Clone)]
pub struct BybitRestConfig {
    /// Exchange identifier used in symbols.
    pub exchange: String,
    /// API base URL without trailing slash.
    pub base_url: String,
    /// Product category: `linear`, `inverse` or `spot`.
    pub category: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Levels per side requested from the order book endpoint.
    pub book_depth: usize,
}

impl Default for BybitRestConfig {
    fn default() -> Self {
        Self {
            exchange: "bybit".to_string(),
            base_url: "https://api.bybit.com".to_string(),
            category: "linear".to_string(),
            request_timeout: Duration::from_secs(5),
            book_depth: 50,
        }
    }
}

// =============================================================================
// Client Factory
// =============================================================================

/// Builds keep-alive HTTP clients for the pool.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    exchange: String,
    timeout: Duration,
}

impl HttpClientFactory {
    /// Create a factory.
    #[must_use]
    pub fn new(exchange: impl Into<String>, timeout: Duration) -> Self {
        Self {
            exchange: exchange.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HandleFactory for HttpClientFactory {
    type Handle = reqwest::Client;

    async fn create(&self) -> Result<reqwest::Client, PoolError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("market-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PoolError::Create {
                exchange: self.exchange.clone(),
                reason: e.to_string(),
            })
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Bybit REST adapter.
#[derive(Debug)]
pub struct BybitRest {
    config: BybitRestConfig,
    pool: Arc<ConnectionPool<HttpClientFactory>>,
    signer: Option<Signer>,
}

impl BybitRest {
    /// Create an adapter with its own client pool, gated by `breaker`.
    #[must_use]
    pub fn new(config: BybitRestConfig, breaker: Arc<CircuitBreaker>, pool: PoolConfig, signer: Option<Signer>) -> Self {
        let factory = HttpClientFactory::new(&config.exchange, config.request_timeout);
        let pool = Arc::new(ConnectionPool::new(&config.exchange, factory, breaker, pool));
        Self { config, pool, signer }
    }

    /// Client pool, for stats and the idle reaper.
    #[must_use]
    pub const fn pool(&self) -> &Arc<ConnectionPool<HttpClientFactory>> {
        &self.pool
    }

    /// Whether API credentials are configured.
    #[must_use]
    pub const fn has_credentials(&self) -> bool {
        self.signer.is_some()
    }

    /// Check the configured credentials against a private endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Auth`] when no credentials are configured or
    /// the exchange rejects them.
    pub async fn verify_credentials(&self) -> Result<(), FetchError> {
        let query = [("accountType", "UNIFIED".to_string())];
        self.get::<serde_json::Value>("/v5/account/wallet-balance", &query, true)
            .await
            .map(|_| ())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        signed: bool,
    ) -> Result<(T, Option<i64>), FetchError> {
        let query_string = query
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}{path}?{query_string}", self.config.base_url);

        let client = self
            .pool
            .acquire()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let mut request = client.get(&url);
        if signed {
            let signer = self
                .signer
                .as_ref()
                .ok_or_else(|| FetchError::Auth("no API credentials configured".to_string()))?;
            let headers = signer
                .headers(&query_string)
                .map_err(|e| FetchError::Auth(e.to_string()))?;
            for (name, value) in headers.pairs() {
                request = request.header(name, value);
            }
        }

        tracing::debug!(path, query = %query_string, "Bybit REST request");
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 403 {
            return Err(FetchError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if status.as_u16() == 401 {
            return Err(FetchError::Auth(format!("HTTP {status}")));
        }
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(FetchError::Status {
                code: i64::from(status.as_u16()),
                body,
            });
        }

        let envelope: RestEnvelope<T> = serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))?;
        match envelope.ret_code {
            0 => envelope
                .result
                .map(|result| (result, envelope.time))
                .ok_or_else(|| FetchError::Decode("response carries no result".to_string())),
            RET_RATE_LIMITED => Err(FetchError::RateLimited {
                retry_after: retry_after(&headers),
            }),
            code if RET_AUTH.contains(&code) => Err(FetchError::Auth(envelope.ret_msg)),
            code => Err(FetchError::Status {
                code,
                body: envelope.ret_msg,
            }),
        }
    }

    fn market_query(&self, symbol: &Symbol) -> Vec<(&'static str, String)> {
        vec![
            ("category", self.config.category.clone()),
            ("symbol", symbol.ticker().to_string()),
        ]
    }

    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<NormalizedEvent, FetchError> {
        let (result, time) = self
            .get::<TickersResult>("/v5/market/tickers", &self.market_query(symbol), false)
            .await?;
        let wire = result.list.first().ok_or_else(|| empty(symbol, DataClass::Ticker))?;
        let at = match time {
            Some(ms) => codec::timestamp(ms).map_err(decode_error)?,
            None => Utc::now(),
        };
        codec::ticker_event(symbol.clone(), wire, at).map_err(decode_error)
    }

    async fn fetch_order_book(&self, symbol: &Symbol) -> Result<NormalizedEvent, FetchError> {
        let mut query = self.market_query(symbol);
        query.push(("limit", self.config.book_depth.to_string()));
        let (book, _) = self.get::<OrderBookResult>("/v5/market/orderbook", &query, false).await?;
        if book.bids.is_empty() && book.asks.is_empty() {
            return Err(empty(symbol, DataClass::OrderBook));
        }
        let payload = MarketPayload::OrderBook(OrderBookData {
            bids: codec::levels(&book.bids).map_err(decode_error)?,
            asks: codec::levels(&book.asks).map_err(decode_error)?,
            sequence: book.update_id,
        });
        let at = codec::timestamp(book.ts).map_err(decode_error)?;
        Ok(NormalizedEvent::new(symbol.clone(), payload, at))
    }

    async fn fetch_trade(&self, symbol: &Symbol) -> Result<NormalizedEvent, FetchError> {
        let mut query = self.market_query(symbol);
        query.push(("limit", "1".to_string()));
        let (result, _) = self
            .get::<RecentTradesResult>("/v5/market/recent-trade", &query, false)
            .await?;
        let trade = result.list.first().ok_or_else(|| empty(symbol, DataClass::Trade))?;
        let at = codec::timestamp_str(&trade.time).map_err(decode_error)?;
        codec::trade_event(symbol.clone(), &trade.price, &trade.size, &trade.side, &trade.exec_id, at)
            .map_err(decode_error)
    }

    async fn fetch_open_interest(&self, symbol: &Symbol) -> Result<NormalizedEvent, FetchError> {
        if self.config.category == "spot" {
            return Err(FetchError::Unsupported(DataClass::OpenInterest));
        }
        let mut query = self.market_query(symbol);
        query.push(("intervalTime", "5min".to_string()));
        query.push(("limit", "1".to_string()));
        let (result, _) = self
            .get::<OpenInterestResult>("/v5/market/open-interest", &query, false)
            .await?;
        let point = result
            .list
            .first()
            .ok_or_else(|| empty(symbol, DataClass::OpenInterest))?;
        let open_interest = codec::decimal("openInterest", &point.open_interest).map_err(decode_error)?;
        let at = codec::timestamp_str(&point.timestamp).map_err(decode_error)?;
        Ok(NormalizedEvent::new(
            symbol.clone(),
            MarketPayload::OpenInterest(OpenInterestData { open_interest }),
            at,
        ))
    }
}

#[async_trait]
impl ExchangeRest for BybitRest {
    fn exchange(&self) -> &str {
        &self.config.exchange
    }

    async fn fetch(&self, symbol: &Symbol, data_class: DataClass) -> Result<NormalizedEvent, FetchError> {
        match data_class {
            DataClass::Ticker => self.fetch_ticker(symbol).await,
            DataClass::OrderBook => self.fetch_order_book(symbol).await,
            DataClass::Trade => self.fetch_trade(symbol).await,
            DataClass::OpenInterest => self.fetch_open_interest(symbol).await,
            DataClass::Derived => Err(FetchError::Unsupported(DataClass::Derived)),
        }
    }
}

fn empty(symbol: &Symbol, data_class: DataClass) -> FetchError {
    FetchError::Empty {
        symbol: symbol.clone(),
        data_class,
    }
}

#[allow(clippy::needless_pass_by_value)]
fn decode_error(error: CodecError) -> FetchError {
    FetchError::Decode(error.to_string())
}

/// Hold-off from `Retry-After` (seconds) or the Bybit reset timestamp.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

    if let Some(secs) = header(reqwest::header::RETRY_AFTER.as_str()).and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }
    let reset_ms = header(HEADER_LIMIT_RESET).and_then(|v| v.parse::<i64>().ok())?;
    let wait_ms = reset_ms.saturating_sub(Utc::now().timestamp_millis());
    u64::try_from(wait_ms).ok().map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_prefers_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("3"));
        headers.insert(HEADER_LIMIT_RESET, HeaderValue::from_static("1"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));
    }

    #[test]
    fn retry_after_from_reset_timestamp() {
        let mut headers = HeaderMap::new();
        let reset = Utc::now().timestamp_millis() + 60_000;
        headers.insert(HEADER_LIMIT_RESET, HeaderValue::from_str(&reset.to_string()).unwrap());
        let wait = retry_after(&headers).unwrap();
        assert!(wait > Duration::from_secs(50) && wait <= Duration::from_secs(60));
    }

    #[test]
    fn retry_after_in_the_past_is_none() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_LIMIT_RESET, HeaderValue::from_static("1000"));
        assert_eq!(retry_after(&headers), None);
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }
}

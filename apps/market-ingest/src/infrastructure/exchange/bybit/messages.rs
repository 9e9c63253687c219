//! Bybit v5 Wire Types
//!
//! Serde types for the public WebSocket stream and the market REST
//! endpoints. Bybit encodes every number as a string; conversion into
//! domain decimals happens in the codec.
//!
//! # WebSocket
//!
//! ```json
//! {"op":"subscribe","args":["tickers.BTCUSDT"],"req_id":"..."}
//! {"success":true,"ret_msg":"","conn_id":"...","req_id":"...","op":"subscribe"}
//! {"topic":"tickers.BTCUSDT","type":"snapshot","ts":1673272861686,"data":{...}}
//! ```
//!
//! # REST
//!
//! ```json
//! {"retCode":0,"retMsg":"OK","result":{...},"time":1672376496682}
//! ```

use serde::{Deserialize, Serialize};

// =============================================================================
// WebSocket: Outbound
// =============================================================================

/// Operation request sent to the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WsRequest {
    /// Operation: `subscribe`, `unsubscribe` or `ping`.
    pub op: &'static str,
    /// Topics.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Correlation id echoed in the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
}

impl WsRequest {
    /// Subscribe to `topics`.
    #[must_use]
    pub const fn subscribe(topics: Vec<String>, req_id: String) -> Self {
        Self {
            op: "subscribe",
            args: topics,
            req_id: Some(req_id),
        }
    }

    /// Unsubscribe from `topics`.
    #[must_use]
    pub const fn unsubscribe(topics: Vec<String>, req_id: String) -> Self {
        Self {
            op: "unsubscribe",
            args: topics,
            req_id: Some(req_id),
        }
    }

    /// Application-level ping.
    #[must_use]
    pub const fn ping() -> Self {
        Self {
            op: "ping",
            args: Vec::new(),
            req_id: None,
        }
    }
}

// =============================================================================
// WebSocket: Inbound
// =============================================================================

/// Response to an operation request (including ping).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WsOpResponse {
    /// Whether the operation succeeded. Absent on linear `pong` frames.
    #[serde(default = "default_true")]
    pub success: bool,
    /// Error or status text.
    #[serde(default)]
    pub ret_msg: String,
    /// Operation answered.
    pub op: String,
    /// Correlation id.
    #[serde(default)]
    pub req_id: Option<String>,
    /// Connection id assigned by the server.
    #[serde(default)]
    pub conn_id: Option<String>,
}

const fn default_true() -> bool {
    true
}

/// Full state or incremental update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Complete state; replaces anything held.
    Snapshot,
    /// Changes since the previous frame.
    Delta,
}

/// Data frame on a topic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WsTopicFrame {
    /// Topic, e.g. `orderbook.50.BTCUSDT`.
    pub topic: String,
    /// Snapshot or delta. Trade frames are always snapshots.
    #[serde(rename = "type", default = "default_snapshot")]
    pub kind: FrameKind,
    /// Server timestamp (ms).
    pub ts: i64,
    /// Matching-engine timestamp (ms) on order book frames.
    #[serde(default)]
    pub cts: Option<i64>,
    /// Topic-specific body.
    pub data: serde_json::Value,
}

const fn default_snapshot() -> FrameKind {
    FrameKind::Snapshot
}

/// Ticker body; deltas carry only changed fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerWire {
    /// Symbol.
    pub symbol: String,
    /// Last traded price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_price: Option<String>,
    /// Best bid.
    #[serde(default, rename = "bid1Price", skip_serializing_if = "Option::is_none")]
    pub bid1_price: Option<String>,
    /// Best ask.
    #[serde(default, rename = "ask1Price", skip_serializing_if = "Option::is_none")]
    pub ask1_price: Option<String>,
    /// 24h volume.
    #[serde(default, rename = "volume24h", skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<String>,
    /// Open interest (derivatives only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<String>,
}

impl TickerWire {
    /// Overlay the fields present in `delta`.
    pub fn merge(&mut self, delta: Self) {
        if delta.last_price.is_some() {
            self.last_price = delta.last_price;
        }
        if delta.bid1_price.is_some() {
            self.bid1_price = delta.bid1_price;
        }
        if delta.ask1_price.is_some() {
            self.ask1_price = delta.ask1_price;
        }
        if delta.volume_24h.is_some() {
            self.volume_24h = delta.volume_24h;
        }
        if delta.open_interest.is_some() {
            self.open_interest = delta.open_interest;
        }
    }
}

/// Order book body. Levels are `[price, size]`; size `"0"` deletes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderBookWire {
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Bid changes.
    #[serde(rename = "b", default)]
    pub bids: Vec<[String; 2]>,
    /// Ask changes.
    #[serde(rename = "a", default)]
    pub asks: Vec<[String; 2]>,
    /// Update id; `1` after a service restart means a fresh snapshot.
    #[serde(rename = "u")]
    pub update_id: u64,
    /// Cross sequence.
    #[serde(default)]
    pub seq: Option<u64>,
}

/// One public trade.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TradeWire {
    /// Trade time (ms).
    #[serde(rename = "T")]
    pub time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Taker side, `Buy` or `Sell`.
    #[serde(rename = "S")]
    pub side: String,
    /// Size.
    #[serde(rename = "v")]
    pub size: String,
    /// Price.
    #[serde(rename = "p")]
    pub price: String,
    /// Trade id.
    #[serde(rename = "i")]
    pub trade_id: String,
}

// =============================================================================
// REST
// =============================================================================

/// REST response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestEnvelope<T> {
    /// `0` on success.
    pub ret_code: i64,
    /// Status text.
    pub ret_msg: String,
    /// Body.
    pub result: Option<T>,
    /// Server time (ms).
    #[serde(default)]
    pub time: Option<i64>,
}

/// `/v5/market/tickers` result.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TickersResult {
    /// Category.
    #[serde(default)]
    pub category: String,
    /// Tickers.
    #[serde(default)]
    pub list: Vec<TickerWire>,
}

/// `/v5/market/orderbook` result.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderBookResult {
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Bids, best first.
    #[serde(rename = "b", default)]
    pub bids: Vec<[String; 2]>,
    /// Asks, best first.
    #[serde(rename = "a", default)]
    pub asks: Vec<[String; 2]>,
    /// Snapshot time (ms).
    pub ts: i64,
    /// Update id.
    #[serde(rename = "u")]
    pub update_id: u64,
}

/// One trade from `/v5/market/recent-trade`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestTrade {
    /// Trade id.
    pub exec_id: String,
    /// Symbol.
    pub symbol: String,
    /// Price.
    pub price: String,
    /// Size.
    pub size: String,
    /// Taker side.
    pub side: String,
    /// Trade time (ms, as a string).
    pub time: String,
}

/// `/v5/market/recent-trade` result.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecentTradesResult {
    /// Trades, newest first.
    #[serde(default)]
    pub list: Vec<RestTrade>,
}

/// One point from `/v5/market/open-interest`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterestPoint {
    /// Open interest.
    pub open_interest: String,
    /// Time (ms, as a string).
    pub timestamp: String,
}

/// `/v5/market/open-interest` result.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenInterestResult {
    /// Symbol.
    #[serde(default)]
    pub symbol: String,
    /// Points, newest first.
    #[serde(default)]
    pub list: Vec<OpenInterestPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_request_serializes() {
        let request = WsRequest::subscribe(vec!["tickers.BTCUSDT".into()], "r1".into());
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"op":"subscribe","args":["tickers.BTCUSDT"],"req_id":"r1"}"#);
    }

    #[test]
    fn ping_request_is_minimal() {
        let json = serde_json::to_string(&WsRequest::ping()).unwrap();
        assert_eq!(json, r#"{"op":"ping"}"#);
    }

    #[test]
    fn ticker_delta_merges_present_fields_only() {
        let mut state = TickerWire {
            symbol: "BTCUSDT".into(),
            last_price: Some("100".into()),
            bid1_price: Some("99".into()),
            ask1_price: Some("101".into()),
            volume_24h: Some("5".into()),
            open_interest: None,
        };
        let delta: TickerWire = serde_json::from_str(r#"{"symbol":"BTCUSDT","lastPrice":"102"}"#).unwrap();
        state.merge(delta);
        assert_eq!(state.last_price.as_deref(), Some("102"));
        assert_eq!(state.bid1_price.as_deref(), Some("99"));
    }

    #[test]
    fn rest_envelope_decodes() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"category":"linear","list":[{"symbol":"BTCUSDT","lastPrice":"16597.00"}]},"time":1672376496682}"#;
        let envelope: RestEnvelope<TickersResult> = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.ret_code, 0);
        let result = envelope.result.unwrap();
        assert_eq!(result.list[0].last_price.as_deref(), Some("16597.00"));
    }
}

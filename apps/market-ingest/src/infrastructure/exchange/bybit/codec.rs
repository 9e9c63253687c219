//! Bybit Codec
//!
//! Decodes stream frames and converts Bybit wire values into normalized
//! events.
//!
//! Tickers and order books arrive as a snapshot followed by deltas, so the
//! [`StreamNormalizer`] keeps per-symbol state and emits the merged view
//! after every frame. A delta for a book with no snapshot means the stream
//! is out of sync; the session treats that as a protocol error and
//! reconnects.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::messages::{
    FrameKind, OrderBookWire, TickerWire, TradeWire, WsOpResponse, WsTopicFrame,
};
use crate::domain::market::{
    BookLevel, MarketPayload, NormalizedEvent, OpenInterestData, OrderBookData, Symbol, TickerData,
    TradeData, TradeSide, ValidationError,
};

/// Ticker channel.
pub const CHANNEL_TICKERS: &str = "tickers";
/// Order book channel prefix (depth follows).
pub const CHANNEL_ORDERBOOK: &str = "orderbook";
/// Public trade channel.
pub const CHANNEL_TRADES: &str = "publicTrade";

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(String),

    /// Frame is neither an operation response nor a topic frame.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// Numeric field did not parse.
    #[error("invalid number in '{field}': {value}")]
    Number {
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: String,
    },

    /// Timestamp out of range.
    #[error("invalid timestamp: {0}")]
    Timestamp(i64),

    /// Symbol rejected by the domain.
    #[error(transparent)]
    Symbol(#[from] ValidationError),

    /// A required field is missing.
    #[error("missing field '{0}'")]
    Missing(&'static str),

    /// Delta received without a prior snapshot.
    #[error("{topic} delta without snapshot")]
    OutOfSync {
        /// Topic.
        topic: String,
    },
}

impl From<serde_json::Error> for CodecError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error.to_string())
    }
}

/// One decoded stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Operation response (subscribe, unsubscribe, ping/pong).
    Op(WsOpResponse),
    /// Data frame.
    Topic(WsTopicFrame),
}

/// Decode a text frame.
///
/// # Errors
///
/// Returns an error if the frame is not valid JSON or has neither `topic`
/// nor `op`.
pub fn decode(text: &str) -> Result<Inbound, CodecError> {
    let value: serde_json::Value = serde_json::from_str(text.trim())?;
    if value.get("topic").is_some() {
        Ok(Inbound::Topic(serde_json::from_value(value)?))
    } else if value.get("op").is_some() {
        Ok(Inbound::Op(serde_json::from_value(value)?))
    } else {
        let preview: String = text.chars().take(50).collect();
        Err(CodecError::InvalidFormat(format!("expected topic or op frame, got: {preview}...")))
    }
}

// =============================================================================
// Value Conversion
// =============================================================================

/// Parse a decimal string.
///
/// # Errors
///
/// Returns [`CodecError::Number`] for a malformed value.
pub fn decimal(field: &'static str, raw: &str) -> Result<Decimal, CodecError> {
    Decimal::from_str(raw.trim()).map_err(|_| CodecError::Number {
        field,
        value: raw.to_string(),
    })
}

fn optional_decimal(field: &'static str, raw: Option<&String>) -> Result<Option<Decimal>, CodecError> {
    raw.filter(|value| !value.is_empty())
        .map(|value| decimal(field, value))
        .transpose()
}

/// Convert epoch milliseconds.
///
/// # Errors
///
/// Returns [`CodecError::Timestamp`] if out of range.
pub fn timestamp(ms: i64) -> Result<DateTime<Utc>, CodecError> {
    DateTime::from_timestamp_millis(ms).ok_or(CodecError::Timestamp(ms))
}

/// Parse a millisecond timestamp sent as a string.
///
/// # Errors
///
/// Returns [`CodecError::Number`] or [`CodecError::Timestamp`].
pub fn timestamp_str(raw: &str) -> Result<DateTime<Utc>, CodecError> {
    let ms = raw.trim().parse::<i64>().map_err(|_| CodecError::Number {
        field: "timestamp",
        value: raw.to_string(),
    })?;
    timestamp(ms)
}

/// Map a Bybit side string.
///
/// # Errors
///
/// Returns [`CodecError::InvalidFormat`] for anything but `Buy`/`Sell`.
pub fn side(raw: &str) -> Result<TradeSide, CodecError> {
    match raw {
        "Buy" => Ok(TradeSide::Buy),
        "Sell" => Ok(TradeSide::Sell),
        other => Err(CodecError::InvalidFormat(format!("unknown side '{other}'"))),
    }
}

/// Ticker event from a (merged) ticker body.
///
/// # Errors
///
/// Returns an error if the last price is missing or any number is malformed.
pub fn ticker_event(symbol: Symbol, wire: &TickerWire, at: DateTime<Utc>) -> Result<NormalizedEvent, CodecError> {
    let last_price = wire
        .last_price
        .as_deref()
        .ok_or(CodecError::Missing("lastPrice"))
        .and_then(|raw| decimal("lastPrice", raw))?;
    let payload = MarketPayload::Ticker(TickerData {
        last_price,
        bid_price: optional_decimal("bid1Price", wire.bid1_price.as_ref())?,
        ask_price: optional_decimal("ask1Price", wire.ask1_price.as_ref())?,
        volume_24h: optional_decimal("volume24h", wire.volume_24h.as_ref())?,
    });
    Ok(NormalizedEvent::new(symbol, payload, at))
}

/// Open-interest event, if the body carries one.
///
/// # Errors
///
/// Returns [`CodecError::Number`] for a malformed value.
pub fn open_interest_event(
    symbol: Symbol,
    raw: Option<&String>,
    at: DateTime<Utc>,
) -> Result<Option<NormalizedEvent>, CodecError> {
    Ok(optional_decimal("openInterest", raw)?.map(|open_interest| {
        NormalizedEvent::new(symbol, MarketPayload::OpenInterest(OpenInterestData { open_interest }), at)
    }))
}

/// Convert `[price, size]` pairs into levels.
///
/// # Errors
///
/// Returns [`CodecError::Number`] for a malformed value.
pub fn levels(raw: &[[String; 2]]) -> Result<Vec<BookLevel>, CodecError> {
    raw.iter()
        .map(|[price, size]| Ok(BookLevel::new(decimal("price", price)?, decimal("size", size)?)))
        .collect()
}

/// Trade event.
///
/// # Errors
///
/// Returns an error for a malformed side or number.
pub fn trade_event(
    symbol: Symbol,
    price: &str,
    size: &str,
    side_raw: &str,
    trade_id: &str,
    at: DateTime<Utc>,
) -> Result<NormalizedEvent, CodecError> {
    let payload = MarketPayload::Trade(TradeData {
        price: decimal("price", price)?,
        size: decimal("size", size)?,
        side: side(side_raw)?,
        trade_id: trade_id.to_string(),
    });
    Ok(NormalizedEvent::new(symbol, payload, at))
}

// =============================================================================
// Order Book State
// =============================================================================

/// Local order book rebuilt from snapshot + deltas.
#[derive(Debug, Clone, Default)]
pub struct BookState {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    update_id: u64,
    sequence: u64,
}

impl BookState {
    /// Apply a frame. A size of zero removes the level.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed level.
    pub fn apply(&mut self, kind: FrameKind, wire: &OrderBookWire) -> Result<(), CodecError> {
        // update_id 1 is a fresh snapshot after a service restart
        if kind == FrameKind::Snapshot || wire.update_id == 1 {
            self.bids.clear();
            self.asks.clear();
        }
        for level in levels(&wire.bids)? {
            apply_level(&mut self.bids, level);
        }
        for level in levels(&wire.asks)? {
            apply_level(&mut self.asks, level);
        }
        self.update_id = wire.update_id;
        self.sequence = wire.seq.unwrap_or(wire.update_id);
        Ok(())
    }

    /// Best-first view truncated to `depth` levels per side.
    #[must_use]
    pub fn view(&self, depth: usize) -> OrderBookData {
        OrderBookData {
            bids: self
                .bids
                .iter()
                .rev()
                .take(depth)
                .map(|(price, size)| BookLevel::new(*price, *size))
                .collect(),
            asks: self
                .asks
                .iter()
                .take(depth)
                .map(|(price, size)| BookLevel::new(*price, *size))
                .collect(),
            sequence: self.sequence,
        }
    }
}

fn apply_level(side: &mut BTreeMap<Decimal, Decimal>, level: BookLevel) {
    if level.size.is_zero() {
        side.remove(&level.price);
    } else {
        side.insert(level.price, level.size);
    }
}

// =============================================================================
// Stream Normalizer
// =============================================================================

/// Per-session snapshot/delta state.
#[derive(Debug)]
pub struct StreamNormalizer {
    exchange: String,
    depth: usize,
    books: HashMap<String, BookState>,
    tickers: HashMap<String, TickerWire>,
}

impl StreamNormalizer {
    /// Create a normalizer publishing up to `depth` book levels per side.
    #[must_use]
    pub fn new(exchange: impl Into<String>, depth: usize) -> Self {
        Self {
            exchange: exchange.into(),
            depth,
            books: HashMap::new(),
            tickers: HashMap::new(),
        }
    }

    /// Drop all state (after reconnect or unsubscribe).
    pub fn reset(&mut self) {
        self.books.clear();
        self.tickers.clear();
    }

    /// Forget state for one topic.
    pub fn forget(&mut self, topic: &str) {
        self.books.remove(topic);
        self.tickers.remove(topic);
    }

    /// Normalize one data frame.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed frame or a delta without snapshot.
    pub fn normalize(&mut self, frame: WsTopicFrame) -> Result<Vec<NormalizedEvent>, CodecError> {
        let channel = frame.topic.split('.').next().unwrap_or_default().to_string();
        match channel.as_str() {
            CHANNEL_TICKERS => self.on_ticker(frame),
            CHANNEL_ORDERBOOK => self.on_book(frame),
            CHANNEL_TRADES => self.on_trades(frame),
            _ => {
                tracing::trace!(topic = %frame.topic, "Ignoring unhandled topic");
                Ok(Vec::new())
            }
        }
    }

    fn symbol(&self, ticker: &str) -> Result<Symbol, CodecError> {
        Ok(Symbol::new(&self.exchange, ticker)?)
    }

    fn on_ticker(&mut self, frame: WsTopicFrame) -> Result<Vec<NormalizedEvent>, CodecError> {
        let wire: TickerWire = serde_json::from_value(frame.data)?;
        let at = timestamp(frame.ts)?;
        let symbol = self.symbol(&wire.symbol)?;
        let open_interest = open_interest_event(symbol.clone(), wire.open_interest.as_ref(), at)?;

        let merged = match frame.kind {
            FrameKind::Snapshot => {
                self.tickers.insert(frame.topic.clone(), wire.clone());
                wire
            }
            FrameKind::Delta => {
                let Some(state) = self.tickers.get_mut(&frame.topic) else {
                    return Err(CodecError::OutOfSync { topic: frame.topic });
                };
                state.merge(wire);
                state.clone()
            }
        };

        let mut events = Vec::with_capacity(2);
        if merged.last_price.is_some() {
            events.push(ticker_event(symbol, &merged, at)?);
        }
        events.extend(open_interest);
        Ok(events)
    }

    fn on_book(&mut self, frame: WsTopicFrame) -> Result<Vec<NormalizedEvent>, CodecError> {
        let wire: OrderBookWire = serde_json::from_value(frame.data)?;
        let at = timestamp(frame.cts.unwrap_or(frame.ts))?;
        let symbol = self.symbol(&wire.symbol)?;

        if frame.kind == FrameKind::Delta && !self.books.contains_key(&frame.topic) && wire.update_id != 1 {
            return Err(CodecError::OutOfSync { topic: frame.topic });
        }
        let book = self.books.entry(frame.topic).or_default();
        book.apply(frame.kind, &wire)?;
        let view = book.view(self.depth);
        if view.bids.is_empty() && view.asks.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![NormalizedEvent::new(symbol, MarketPayload::OrderBook(view), at)])
    }

    fn on_trades(&self, frame: WsTopicFrame) -> Result<Vec<NormalizedEvent>, CodecError> {
        let trades: Vec<TradeWire> = serde_json::from_value(frame.data)?;
        trades
            .iter()
            .map(|trade| {
                trade_event(
                    self.symbol(&trade.symbol)?,
                    &trade.price,
                    &trade.size,
                    &trade.side,
                    &trade.trade_id,
                    timestamp(trade.time)?,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::market::DataClass;

    fn frame(text: &str) -> WsTopicFrame {
        match decode(text).unwrap() {
            Inbound::Topic(frame) => frame,
            Inbound::Op(op) => panic!("unexpected op frame {op:?}"),
        }
    }

    #[test]
    fn decodes_op_and_topic_frames() {
        let op = decode(r#"{"success":true,"ret_msg":"pong","conn_id":"c1","op":"ping"}"#).unwrap();
        assert!(matches!(op, Inbound::Op(ref r) if r.op == "ping" && r.success));

        let pong = decode(r#"{"op":"pong","args":["1675418560633"],"conn_id":"c1"}"#).unwrap();
        assert!(matches!(pong, Inbound::Op(ref r) if r.op == "pong"));

        assert!(decode(r#"{"hello":"world"}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn ticker_snapshot_then_delta() {
        let mut normalizer = StreamNormalizer::new("bybit", 50);
        let events = normalizer
            .normalize(frame(
                r#"{"topic":"tickers.BTCUSDT","type":"snapshot","ts":1673272861686,"data":{"symbol":"BTCUSDT","lastPrice":"17216.00","bid1Price":"17215.50","ask1Price":"17216.00","volume24h":"91705.276","openInterest":"68870.213"}}"#,
            ))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data_class, DataClass::Ticker);
        assert_eq!(events[1].data_class, DataClass::OpenInterest);

        let events = normalizer
            .normalize(frame(
                r#"{"topic":"tickers.BTCUSDT","type":"delta","ts":1673272861786,"data":{"symbol":"BTCUSDT","lastPrice":"17217.50"}}"#,
            ))
            .unwrap();
        assert_eq!(events.len(), 1);
        let MarketPayload::Ticker(ticker) = &events[0].payload else {
            panic!("expected ticker");
        };
        assert_eq!(ticker.last_price, dec!(17217.50));
        assert_eq!(ticker.bid_price, Some(dec!(17215.50)));
    }

    #[test]
    fn book_delta_updates_and_removes_levels() {
        let mut normalizer = StreamNormalizer::new("bybit", 50);
        normalizer
            .normalize(frame(
                r#"{"topic":"orderbook.50.BTCUSDT","type":"snapshot","ts":1,"data":{"s":"BTCUSDT","b":[["100","1"],["99","2"]],"a":[["101","1"],["102","3"]],"u":10,"seq":500}}"#,
            ))
            .unwrap();
        let events = normalizer
            .normalize(frame(
                r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","ts":2,"data":{"s":"BTCUSDT","b":[["100","0"],["99.5","4"]],"a":[],"u":11,"seq":501}}"#,
            ))
            .unwrap();

        let MarketPayload::OrderBook(book) = &events[0].payload else {
            panic!("expected book");
        };
        assert_eq!(book.bids[0], BookLevel::new(dec!(99.5), dec!(4)));
        assert_eq!(book.bids[1], BookLevel::new(dec!(99), dec!(2)));
        assert_eq!(book.asks[0].price, dec!(101));
        assert_eq!(book.sequence, 501);
    }

    #[test]
    fn book_delta_without_snapshot_is_out_of_sync() {
        let mut normalizer = StreamNormalizer::new("bybit", 50);
        let err = normalizer
            .normalize(frame(
                r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","ts":2,"data":{"s":"BTCUSDT","b":[["99","1"]],"a":[],"u":11}}"#,
            ))
            .unwrap_err();
        assert!(matches!(err, CodecError::OutOfSync { .. }));
    }

    #[test]
    fn trades_normalize_each_print() {
        let normalizer = StreamNormalizer::new("bybit", 50);
        let events = normalizer
            .on_trades(frame(
                r#"{"topic":"publicTrade.BTCUSDT","type":"snapshot","ts":1672304486868,"data":[{"T":1672304486865,"s":"BTCUSDT","S":"Buy","v":"0.001","p":"16578.50","L":"PlusTick","i":"20f43950-d8dd-5b31-9112-a178eb6023af","BT":false},{"T":1672304486866,"s":"BTCUSDT","S":"Sell","v":"0.002","p":"16578.00","i":"x2","BT":false}]}"#,
            ))
            .unwrap();
        assert_eq!(events.len(), 2);
        let MarketPayload::Trade(trade) = &events[1].payload else {
            panic!("expected trade");
        };
        assert_eq!(trade.side, TradeSide::Sell);
        assert_eq!(trade.trade_id, "x2");
    }

    #[test]
    fn malformed_number_is_rejected() {
        assert!(matches!(decimal("price", "abc"), Err(CodecError::Number { field: "price", .. })));
        assert!(side("Hold").is_err());
    }
}

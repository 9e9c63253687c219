//! Market Data Payloads
//!
//! One versioned schema per data class, expressed as an internally tagged
//! enum (`"kind": "ticker"`, ...). Every value that reaches the cache is one
//! of these variants; loosely typed JSON never crosses the write boundary.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::symbol::Symbol;

// =============================================================================
// Data Class
// =============================================================================

/// Named category of market data; governs TTL and validation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    /// Last price, best bid/ask, 24h volume.
    Ticker,
    /// Depth levels on both sides of the book.
    OrderBook,
    /// Individual public trade prints.
    Trade,
    /// Outstanding derivatives open interest.
    OpenInterest,
    /// Values computed downstream from other cached data.
    Derived,
}

impl DataClass {
    /// All data classes.
    pub const ALL: [Self; 5] = [
        Self::Ticker,
        Self::OrderBook,
        Self::Trade,
        Self::OpenInterest,
        Self::Derived,
    ];

    /// Stable lowercase name used in cache keys and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::OrderBook => "order_book",
            Self::Trade => "trade",
            Self::OpenInterest => "open_interest",
            Self::Derived => "derived",
        }
    }

    /// Current schema version for this class's payload.
    #[must_use]
    pub const fn schema_version(self) -> u16 {
        match self {
            Self::Ticker | Self::Trade | Self::OpenInterest | Self::Derived => 1,
            Self::OrderBook => 2,
        }
    }

    /// Whether exchanges publish this class (as opposed to downstream producers).
    #[must_use]
    pub const fn is_market(self) -> bool {
        !matches!(self, Self::Derived)
    }

    /// Parse from the name produced by [`Self::as_str`].
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.as_str() == name)
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payload Variants
// =============================================================================

/// Ticker snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerData {
    /// Last traded price.
    pub last_price: Decimal,
    /// Best bid, if the exchange published one.
    pub bid_price: Option<Decimal>,
    /// Best ask, if the exchange published one.
    pub ask_price: Option<Decimal>,
    /// Rolling 24h base volume.
    pub volume_24h: Option<Decimal>,
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Level price.
    pub price: Decimal,
    /// Resting size at this price.
    pub size: Decimal,
}

impl BookLevel {
    /// Create a level.
    #[must_use]
    pub const fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Order book depth, bids best-first (descending) and asks best-first (ascending).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookData {
    /// Bid levels, highest price first.
    pub bids: Vec<BookLevel>,
    /// Ask levels, lowest price first.
    pub asks: Vec<BookLevel>,
    /// Exchange update sequence.
    pub sequence: u64,
}

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    /// Buyer-initiated.
    Buy,
    /// Seller-initiated.
    Sell,
}

/// Single public trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeData {
    /// Execution price.
    pub price: Decimal,
    /// Executed size.
    pub size: Decimal,
    /// Aggressor side.
    pub side: TradeSide,
    /// Exchange trade id.
    pub trade_id: String,
}

/// Open interest reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenInterestData {
    /// Contracts (or base units) outstanding.
    pub open_interest: Decimal,
}

/// Downstream-computed value.
///
/// Producers that cannot compute a value must not write one; there is no
/// neutral default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedValue {
    /// Metric name, e.g. `momentum_score`.
    pub metric: String,
    /// Computed value.
    pub value: Decimal,
    /// Number of inputs the computation consumed.
    pub inputs: u32,
}

/// Tagged market data payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketPayload {
    /// Ticker snapshot.
    Ticker(TickerData),
    /// Order book depth.
    OrderBook(OrderBookData),
    /// Trade print.
    Trade(TradeData),
    /// Open interest.
    OpenInterest(OpenInterestData),
    /// Derived value.
    Derived(DerivedValue),
}

impl MarketPayload {
    /// Data class this variant belongs to.
    #[must_use]
    pub const fn data_class(&self) -> DataClass {
        match self {
            Self::Ticker(_) => DataClass::Ticker,
            Self::OrderBook(_) => DataClass::OrderBook,
            Self::Trade(_) => DataClass::Trade,
            Self::OpenInterest(_) => DataClass::OpenInterest,
            Self::Derived(_) => DataClass::Derived,
        }
    }
}

// =============================================================================
// Normalized Event
// =============================================================================

/// Exchange-agnostic market event handed from adapters to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Instrument.
    pub symbol: Symbol,
    /// Declared data class; must agree with `payload`.
    pub data_class: DataClass,
    /// Schema version the producer encoded.
    pub schema_version: u16,
    /// Payload.
    pub payload: MarketPayload,
    /// Exchange-side event time.
    pub source_timestamp: DateTime<Utc>,
}

impl NormalizedEvent {
    /// Create an event at the current schema version of its payload's class.
    #[must_use]
    pub const fn new(symbol: Symbol, payload: MarketPayload, source_timestamp: DateTime<Utc>) -> Self {
        let data_class = payload.data_class();
        Self {
            symbol,
            data_class,
            schema_version: data_class.schema_version(),
            payload,
            source_timestamp,
        }
    }
}

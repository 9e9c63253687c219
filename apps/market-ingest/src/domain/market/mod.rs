//! Market Data Domain
//!
//! Instruments, versioned payload schemas, validation, and the snapshot
//! types consumers read.

pub mod payload;
pub mod snapshot;
pub mod symbol;
pub mod validation;

pub use payload::{
    BookLevel, DataClass, DerivedValue, MarketPayload, NormalizedEvent, OpenInterestData,
    OrderBookData, TickerData, TradeData, TradeSide,
};
pub use snapshot::{FeedStatus, NotAvailableReason, Snapshot, SnapshotResult};
pub use symbol::{RESERVED_SYMBOLS, Symbol, is_reserved};
pub use validation::{
    MAX_CLOCK_SKEW, ValidationError, validate_class, validate_event, validate_payload,
};

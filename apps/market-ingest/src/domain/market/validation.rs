//! Payload Validation
//!
//! Shape and range checks applied at the cache-write boundary. A failed
//! check drops the event; nothing here ever repairs or substitutes a value.

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use super::payload::{DataClass, MarketPayload, NormalizedEvent, OrderBookData};

/// Tolerated exchange clock lead over the local clock.
pub const MAX_CLOCK_SKEW: TimeDelta = TimeDelta::seconds(5);

/// Validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Exchange or ticker missing.
    #[error("symbol is empty")]
    EmptySymbol,

    /// Ticker is a reserved placeholder.
    #[error("reserved sentinel symbol '{0}'")]
    ReservedSymbol(String),

    /// Symbol contains disallowed characters.
    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),

    /// Payload variant disagrees with the declared data class.
    #[error("payload kind '{actual}' does not match data class '{expected}'")]
    ClassMismatch {
        /// Declared class.
        expected: DataClass,
        /// Class of the payload variant.
        actual: DataClass,
    },

    /// Producer encoded a schema version other than the current one.
    #[error("schema version {found} for '{class}', expected {expected}")]
    SchemaVersion {
        /// Data class.
        class: DataClass,
        /// Version carried by the event.
        found: u16,
        /// Current version.
        expected: u16,
    },

    /// Numeric field outside its legal range.
    #[error("{field} out of range: {value}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// Required text field is blank.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    /// Book has no levels on either side.
    #[error("order book is empty")]
    EmptyBook,

    /// Levels not sorted best-first.
    #[error("order book {0} side is not sorted best-first")]
    UnsortedBook(&'static str),

    /// Best bid at or above best ask.
    #[error("order book crossed: best bid {bid} >= best ask {ask}")]
    CrossedBook {
        /// Best bid price.
        bid: Decimal,
        /// Best ask price.
        ask: Decimal,
    },

    /// Event time ahead of the local clock beyond tolerated skew.
    #[error("source timestamp {0} is in the future")]
    FutureTimestamp(DateTime<Utc>),

    /// Cache key component contains a separator or is empty.
    #[error("invalid cache key component '{0}'")]
    InvalidKeyComponent(String),
}

/// Validate a complete event against `now`.
///
/// # Errors
///
/// Returns the first [`ValidationError`] found.
pub fn validate_event(event: &NormalizedEvent, now: DateTime<Utc>) -> Result<(), ValidationError> {
    validate_class(event.data_class, event.schema_version, &event.payload)?;

    if event.source_timestamp > now + MAX_CLOCK_SKEW {
        return Err(ValidationError::FutureTimestamp(event.source_timestamp));
    }
    if event.source_timestamp.timestamp_millis() <= 0 {
        return Err(ValidationError::OutOfRange {
            field: "source_timestamp",
            value: event.source_timestamp.to_rfc3339(),
        });
    }

    validate_payload(&event.payload)
}

/// Check the declared class and schema version against the payload variant.
///
/// # Errors
///
/// Returns [`ValidationError::ClassMismatch`] or [`ValidationError::SchemaVersion`].
pub fn validate_class(
    declared: DataClass,
    schema_version: u16,
    payload: &MarketPayload,
) -> Result<(), ValidationError> {
    let actual = payload.data_class();
    if actual != declared {
        return Err(ValidationError::ClassMismatch {
            expected: declared,
            actual,
        });
    }
    let expected = declared.schema_version();
    if schema_version != expected {
        return Err(ValidationError::SchemaVersion {
            class: declared,
            found: schema_version,
            expected,
        });
    }
    Ok(())
}

/// Range checks for each payload variant.
///
/// # Errors
///
/// Returns the first [`ValidationError`] found.
pub fn validate_payload(payload: &MarketPayload) -> Result<(), ValidationError> {
    match payload {
        MarketPayload::Ticker(ticker) => {
            positive("last_price", ticker.last_price)?;
            if let Some(bid) = ticker.bid_price {
                positive("bid_price", bid)?;
            }
            if let Some(ask) = ticker.ask_price {
                positive("ask_price", ask)?;
            }
            if let (Some(bid), Some(ask)) = (ticker.bid_price, ticker.ask_price)
                && bid >= ask
            {
                return Err(ValidationError::CrossedBook { bid, ask });
            }
            if let Some(volume) = ticker.volume_24h {
                non_negative("volume_24h", volume)?;
            }
            Ok(())
        }
        MarketPayload::OrderBook(book) => validate_book(book),
        MarketPayload::Trade(trade) => {
            positive("price", trade.price)?;
            positive("size", trade.size)?;
            if trade.trade_id.trim().is_empty() {
                return Err(ValidationError::EmptyField("trade_id"));
            }
            Ok(())
        }
        MarketPayload::OpenInterest(oi) => non_negative("open_interest", oi.open_interest),
        MarketPayload::Derived(derived) => {
            if derived.metric.trim().is_empty() {
                return Err(ValidationError::EmptyField("metric"));
            }
            if derived.inputs == 0 {
                return Err(ValidationError::OutOfRange {
                    field: "inputs",
                    value: "0".to_string(),
                });
            }
            Ok(())
        }
    }
}

fn validate_book(book: &OrderBookData) -> Result<(), ValidationError> {
    if book.bids.is_empty() && book.asks.is_empty() {
        return Err(ValidationError::EmptyBook);
    }

    for level in book.bids.iter().chain(&book.asks) {
        positive("level price", level.price)?;
        positive("level size", level.size)?;
    }

    if book.bids.windows(2).any(|w| w[0].price <= w[1].price) {
        return Err(ValidationError::UnsortedBook("bid"));
    }
    if book.asks.windows(2).any(|w| w[0].price >= w[1].price) {
        return Err(ValidationError::UnsortedBook("ask"));
    }

    if let (Some(bid), Some(ask)) = (book.bids.first(), book.asks.first())
        && bid.price >= ask.price
    {
        return Err(ValidationError::CrossedBook {
            bid: bid.price,
            ask: ask.price,
        });
    }

    Ok(())
}

fn positive(field: &'static str, value: Decimal) -> Result<(), ValidationError> {
    if value > Decimal::ZERO {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: value.to_string(),
        })
    }
}

fn non_negative(field: &'static str, value: Decimal) -> Result<(), ValidationError> {
    if value >= Decimal::ZERO {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: value.to_string(),
        })
    }
}

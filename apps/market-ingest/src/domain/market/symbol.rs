//! Exchange-Qualified Symbols
//!
//! A [`Symbol`] pairs an exchange identifier with the exchange's own ticker
//! (`bybit` + `BTCUSDT`). Construction is the only validation point: once a
//! `Symbol` exists it is known to be well formed and never a reserved
//! sentinel, so a status string or placeholder can never travel through the
//! pipeline disguised as an instrument.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::validation::ValidationError;

/// Ticker values that upstream systems have used as placeholders.
///
/// Compared case-insensitively after trimming.
pub const RESERVED_SYMBOLS: &[&str] = &[
    "SYSTEM_STATUS",
    "SYSTEM STATUS",
    "SYSTEM",
    "N/A",
    "NA",
    "NONE",
    "NULL",
    "UNKNOWN",
    "PLACEHOLDER",
    "DEFAULT",
];

/// Maximum ticker length accepted from any exchange.
const MAX_TICKER_LEN: usize = 32;

/// Exchange-qualified tradable instrument identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawSymbol", into = "RawSymbol")]
pub struct Symbol {
    exchange: String,
    ticker: String,
}

impl Symbol {
    /// Create a symbol, normalizing case (`exchange` lowercase, `ticker` uppercase).
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if either part is empty, contains characters
    /// outside the allowed set, or the ticker is a reserved sentinel.
    pub fn new(exchange: impl AsRef<str>, ticker: impl AsRef<str>) -> Result<Self, ValidationError> {
        let exchange = exchange.as_ref().trim().to_ascii_lowercase();
        let ticker = ticker.as_ref().trim().to_ascii_uppercase();

        if exchange.is_empty() || ticker.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }

        if is_reserved(&ticker) {
            return Err(ValidationError::ReservedSymbol(ticker));
        }

        if !exchange
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(ValidationError::InvalidSymbol(exchange));
        }

        if ticker.len() > MAX_TICKER_LEN
            || !ticker
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ValidationError::InvalidSymbol(ticker));
        }

        Ok(Self { exchange, ticker })
    }

    /// Exchange identifier (lowercase).
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Exchange-native ticker (uppercase).
    #[must_use]
    pub fn ticker(&self) -> &str {
        &self.ticker
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.ticker)
    }
}

/// Check whether a ticker matches a reserved sentinel.
#[must_use]
pub fn is_reserved(ticker: &str) -> bool {
    let normalized = ticker.trim();
    RESERVED_SYMBOLS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(normalized))
}

/// Wire form used for serde so decoded symbols pass the same checks.
#[derive(Serialize, Deserialize)]
struct RawSymbol {
    exchange: String,
    ticker: String,
}

impl TryFrom<RawSymbol> for Symbol {
    type Error = ValidationError;

    fn try_from(raw: RawSymbol) -> Result<Self, Self::Error> {
        Self::new(raw.exchange, raw.ticker)
    }
}

impl From<Symbol> for RawSymbol {
    fn from(symbol: Symbol) -> Self {
        Self {
            exchange: symbol.exchange,
            ticker: symbol.ticker,
        }
    }
}

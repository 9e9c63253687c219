//! Subscription Management Types
//!
//! Domain types for tracking consumer interest in symbols and the upstream
//! subscriptions that interest implies.
//!
//! # Design
//!
//! The interest registry tracks:
//! - Which symbols each consumer has declared interest in
//! - Reference counting so an upstream subscription exists exactly while at
//!   least one consumer needs the symbol
//!
//! This allows multiple consumers to subscribe to the same symbol while
//! maintaining only one upstream subscription per `(exchange, channel, symbol)`.
//! The mapping from those subscriptions onto physical connections lives in
//! [`assignment`].

pub mod assignment;

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::market::Symbol;

pub use assignment::{AssignmentTable, Migration, Placement, Release};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a consumer.
pub type ConsumerId = u64;

/// One logical upstream subscription: `(exchange, channel, symbol)`.
///
/// The exchange is carried by the symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Instrument.
    pub symbol: Symbol,
    /// Exchange channel name, e.g. `tickers` or `orderbook.50`.
    pub channel: String,
}

impl SubscriptionKey {
    /// Create a key.
    #[must_use]
    pub fn new(symbol: Symbol, channel: impl Into<String>) -> Self {
        Self {
            symbol,
            channel: channel.into(),
        }
    }

    /// Owning exchange.
    #[must_use]
    pub fn exchange(&self) -> &str {
        self.symbol.exchange()
    }

    /// Exchange topic, e.g. `tickers.BTCUSDT`.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("{}.{}", self.channel, self.symbol.ticker())
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.exchange(), self.channel, self.symbol.ticker())
    }
}

// =============================================================================
// Interest Changes
// =============================================================================

/// Changes to upstream interest produced by a registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterestChanges {
    /// Symbols whose refcount went 0→1.
    pub added: Vec<Symbol>,
    /// Symbols whose refcount went 1→0.
    pub removed: Vec<Symbol>,
}

impl InterestChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// =============================================================================
// Interest Registry
// =============================================================================

/// Ref-counted consumer interest.
///
/// Not synchronized; the owning service wraps it in a lock.
///
/// # Example
///
/// ```rust
/// use market_ingest::domain::market::Symbol;
/// use market_ingest::domain::subscription::InterestRegistry;
///
/// let mut registry = InterestRegistry::default();
/// let btc = Symbol::new("bybit", "BTCUSDT").unwrap();
///
/// // Consumer 1 subscribes: upstream subscribe needed
/// assert_eq!(registry.add(1, &[btc.clone()]).added, vec![btc.clone()]);
///
/// // Consumer 2 also subscribes: no upstream change
/// assert!(registry.add(2, &[btc.clone()]).is_empty());
///
/// // Consumer 1 leaves: still covered by consumer 2
/// assert!(registry.remove(1, &[btc.clone()]).is_empty());
///
/// // Consumer 2 leaves: now unsubscribe upstream
/// assert_eq!(registry.remove(2, &[btc.clone()]).removed, vec![btc]);
/// ```
#[derive(Debug, Default)]
pub struct InterestRegistry {
    /// Map from consumer ID to their subscribed symbols.
    consumer_symbols: HashMap<ConsumerId, HashSet<Symbol>>,
    /// Map from symbol to reference count.
    symbol_refcount: HashMap<Symbol, usize>,
}

impl InterestRegistry {
    /// Add interest for a consumer.
    ///
    /// Returns symbols that need upstream subscription.
    pub fn add(&mut self, consumer: ConsumerId, symbols: &[Symbol]) -> InterestChanges {
        let consumer_set = self.consumer_symbols.entry(consumer).or_default();
        let mut added = Vec::new();

        for symbol in symbols {
            if !consumer_set.insert(symbol.clone()) {
                continue;
            }

            let refcount = self.symbol_refcount.entry(symbol.clone()).or_insert(0);
            *refcount += 1;
            if *refcount == 1 {
                added.push(symbol.clone());
            }
        }

        InterestChanges {
            added,
            removed: Vec::new(),
        }
    }

    /// Remove interest for a consumer.
    ///
    /// Returns symbols that need upstream unsubscription.
    pub fn remove(&mut self, consumer: ConsumerId, symbols: &[Symbol]) -> InterestChanges {
        let Some(consumer_set) = self.consumer_symbols.get_mut(&consumer) else {
            return InterestChanges::default();
        };

        let mut released = Vec::new();
        for symbol in symbols {
            if consumer_set.remove(symbol) {
                released.push(symbol.clone());
            }
        }

        if consumer_set.is_empty() {
            self.consumer_symbols.remove(&consumer);
        }

        InterestChanges {
            added: Vec::new(),
            removed: self.release(released),
        }
    }

    /// Remove every interest held by a consumer.
    pub fn remove_consumer(&mut self, consumer: ConsumerId) -> InterestChanges {
        let Some(consumer_set) = self.consumer_symbols.remove(&consumer) else {
            return InterestChanges::default();
        };

        InterestChanges {
            added: Vec::new(),
            removed: self.release(consumer_set),
        }
    }

    fn release(&mut self, symbols: impl IntoIterator<Item = Symbol>) -> Vec<Symbol> {
        let mut removed = Vec::new();
        for symbol in symbols {
            if let Some(refcount) = self.symbol_refcount.get_mut(&symbol) {
                *refcount = refcount.saturating_sub(1);
                if *refcount == 0 {
                    self.symbol_refcount.remove(&symbol);
                    removed.push(symbol);
                }
            }
        }
        removed
    }

    /// Whether any consumer needs the symbol.
    #[must_use]
    pub fn contains(&self, symbol: &Symbol) -> bool {
        self.symbol_refcount.contains_key(symbol)
    }

    /// All symbols with at least one interested consumer.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        self.symbol_refcount.keys().cloned().collect()
    }

    /// Symbols for a specific consumer.
    #[must_use]
    pub fn consumer_symbols(&self, consumer: ConsumerId) -> Vec<Symbol> {
        self.consumer_symbols
            .get(&consumer)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Counts for observability.
    #[must_use]
    pub fn stats(&self) -> InterestStats {
        InterestStats {
            symbol_count: self.symbol_refcount.len(),
            consumer_count: self.consumer_symbols.len(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterestStats {
    /// Number of unique symbols.
    pub symbol_count: usize,
    /// Number of consumers.
    pub consumer_count: usize,
}

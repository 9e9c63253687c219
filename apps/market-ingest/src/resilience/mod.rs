//! Resilience patterns for outbound exchange calls.
//!
//! Every outbound call passes a token-bucket [`RateLimiter`] and exactly one
//! [`CircuitBreaker`], both keyed by `(exchange, endpoint class)`.
//! Reconnect backoff for push streams lives in [`reconnect`].

mod circuit_breaker;
mod rate_limiter;
pub mod reconnect;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerMetrics,
    CircuitBreakerRegistry, CircuitBreakerState, CircuitOpenError,
};
pub use rate_limiter::{RateLimitError, RateLimitPolicy, RateLimiter, TokenBucket};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};

/// Class of outbound endpoint; limits and breakers are per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Push-stream connect and subscribe.
    Stream,
    /// Public market-data REST.
    MarketRest,
    /// Signed private REST.
    PrivateRest,
}

impl EndpointClass {
    /// All classes.
    pub const ALL: [Self; 3] = [Self::Stream, Self::MarketRest, Self::PrivateRest];

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::MarketRest => "market_rest",
            Self::PrivateRest => "private_rest",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(exchange, endpoint class)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey {
    /// Exchange identifier.
    pub exchange: String,
    /// Endpoint class.
    pub class: EndpointClass,
}

impl EndpointKey {
    /// Create a key.
    #[must_use]
    pub fn new(exchange: impl Into<String>, class: EndpointClass) -> Self {
        Self {
            exchange: exchange.into(),
            class,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.class)
    }
}

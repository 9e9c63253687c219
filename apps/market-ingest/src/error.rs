//! Error taxonomy for the ingestion service.
//!
//! Each subsystem owns a precise error enum; [`IngestError`] wraps them at
//! service boundaries and classifies every failure into an [`ErrorKind`]
//! that decides the handling policy.
//!
//! | Kind | Policy |
//! |------|--------|
//! | `TRANSIENT` | Retry with backoff; counts toward the circuit breaker |
//! | `RATE_LIMITED` | Wait for a bucket refill instead of guessing a backoff |
//! | `AUTH` | Fatal for the connection; surfaced to operators |
//! | `VALIDATION` | Drop and log; never cached |
//! | `CIRCUIT_OPEN` | Serve last-known-good (marked stale) or `NotAvailable` |
//! | `TIER_UNAVAILABLE` | Fall through to the next tier |
//! | `NOT_READY` | Caller waited past its readiness deadline |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::ports::{FetchError, StreamError};
use crate::application::services::{CacheError, ReadinessError};
use crate::domain::market::ValidationError;
use crate::infrastructure::config::ConfigError;
use crate::infrastructure::pool::PoolError;
use crate::resilience::{CircuitBreakerError, CircuitOpenError, RateLimitError};

/// Handling category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Timeout, reset, 5xx.
    Transient,
    /// Explicit throttling or local deadline exceeded.
    RateLimited,
    /// Credentials rejected.
    Auth,
    /// Malformed or out-of-range data.
    Validation,
    /// Rejected by an open circuit breaker.
    CircuitOpen,
    /// A cache tier could not be reached.
    TierUnavailable,
    /// Readiness deadline elapsed.
    NotReady,
}

impl ErrorKind {
    /// Reason string for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Auth => "AUTH",
            Self::Validation => "VALIDATION",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::TierUnavailable => "TIER_UNAVAILABLE",
            Self::NotReady => "NOT_READY",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Umbrella error for service operations.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Local rate-limit deadline exceeded.
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// Circuit breaker rejected the call.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// A guarded call exceeded the breaker's timeout.
    #[error("call through '{breaker}' timed out after {after:?}")]
    CallTimeout {
        /// Breaker name.
        breaker: String,
        /// Timeout applied.
        after: Duration,
    },

    /// Push-stream failure.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Exchange REST failure.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Cache coordinator failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Payload or key validation failure.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Connection pool failure.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Readiness gate did not open in time.
    #[error(transparent)]
    NotReady(#[from] ReadinessError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl<E> From<CircuitBreakerError<E>> for IngestError
where
    E: Into<Self>,
{
    fn from(error: CircuitBreakerError<E>) -> Self {
        match error {
            CircuitBreakerError::Open(open) => Self::CircuitOpen(open),
            CircuitBreakerError::Timeout { breaker, after } => Self::CallTimeout { breaker, after },
            CircuitBreakerError::Inner(inner) => inner.into(),
        }
    }
}

impl IngestError {
    /// Classify for handling.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimit(_) => ErrorKind::RateLimited,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::CallTimeout { .. } => ErrorKind::Transient,
            Self::Stream(e) => match e {
                StreamError::Auth(_) => ErrorKind::Auth,
                StreamError::Protocol(_) => ErrorKind::Validation,
                StreamError::Transport(_)
                | StreamError::Rejected(_)
                | StreamError::Closed
                | StreamError::Timeout(_)
                | StreamError::Idle(_) => ErrorKind::Transient,
            },
            Self::Fetch(e) => match e {
                FetchError::RateLimited { .. } => ErrorKind::RateLimited,
                FetchError::Auth(_) => ErrorKind::Auth,
                FetchError::Decode(_) | FetchError::Unsupported(_) => ErrorKind::Validation,
                FetchError::Transport(_) | FetchError::Status { .. } | FetchError::Empty { .. } => {
                    ErrorKind::Transient
                }
            },
            Self::Cache(e) => e.kind(),
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::Pool(e) => e.kind(),
            Self::NotReady(_) => ErrorKind::NotReady,
        }
    }

    /// Whether retrying later can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::CircuitOpen | ErrorKind::TierUnavailable
        )
    }
}

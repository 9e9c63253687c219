//! Stream Port (Driven Port)
//!
//! Interface to an exchange's push channel. The subscription manager owns
//! one [`StreamSession`] per physical connection and drives it from a
//! single task, so sessions need `Send` but not `Sync`.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::connection::ConnectionHealth;
use crate::domain::market::{DataClass, NormalizedEvent, Symbol};
use crate::domain::subscription::SubscriptionKey;

/// Push-stream failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Socket-level failure (reset, TLS, DNS).
    #[error("stream transport error: {0}")]
    Transport(String),

    /// Credentials rejected. Fatal for the connection.
    #[error("stream authentication failed: {0}")]
    Auth(String),

    /// The exchange refused a subscribe or unsubscribe request.
    #[error("stream request rejected: {0}")]
    Rejected(String),

    /// A frame could not be parsed.
    #[error("stream protocol error: {0}")]
    Protocol(String),

    /// The peer closed the socket.
    #[error("stream closed by peer")]
    Closed,

    /// An outbound request exceeded its deadline.
    #[error("stream request timed out after {0:?}")]
    Timeout(Duration),

    /// No data arrived within the idle window.
    #[error("no data for {0:?}")]
    Idle(Duration),
}

impl StreamError {
    /// Whether reconnecting cannot help.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Whether the failure counts against the stream circuit breaker.
    #[must_use]
    pub const fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::Rejected(_) | Self::Protocol(_))
    }
}

/// One live push-stream connection.
#[async_trait]
pub trait StreamSession: Send {
    /// Subscribe to topics on this connection.
    async fn subscribe(&mut self, keys: &[SubscriptionKey]) -> Result<(), StreamError>;

    /// Unsubscribe from topics on this connection.
    async fn unsubscribe(&mut self, keys: &[SubscriptionKey]) -> Result<(), StreamError>;

    /// Wait for the next frame.
    ///
    /// Returns the data events it carried; control frames (acks, pongs)
    /// yield an empty vector. Must be cancel-safe: the manager races it
    /// against its command channel.
    async fn next_event(&mut self) -> Result<Vec<NormalizedEvent>, StreamError>;

    /// Close the socket.
    async fn close(&mut self);
}

/// Factory for push-stream connections to one exchange.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Exchange identifier.
    fn exchange(&self) -> &str;

    /// Channel name carrying `data_class`, if the exchange streams it.
    fn channel_for(&self, data_class: DataClass) -> Option<String>;

    /// Data classes subscribed for every covered symbol.
    fn stream_classes(&self) -> Vec<DataClass>;

    /// Open a new connection.
    async fn connect(&self) -> Result<Box<dyn StreamSession>, StreamError>;
}

/// Receiver of normalized events, in per-symbol arrival order.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Hand over one event. May wait for downstream capacity.
    async fn deliver(&self, event: NormalizedEvent);
}

/// Read-only view of stream coverage, used to decide on REST fallback.
#[cfg_attr(test, mockall::automock)]
pub trait FeedHealth: Send + Sync {
    /// Symbols with at least one interested consumer.
    fn covered_symbols(&self) -> Vec<Symbol>;

    /// Worst health among the connections serving `symbol`.
    fn health_for(&self, symbol: &Symbol) -> Option<ConnectionHealth>;
}

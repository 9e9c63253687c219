//! Connection Health
//!
//! Per-connection state machine and health snapshot. Only the task that
//! owns a connection mutates its [`HealthCell`]; everything else reads
//! snapshots.
//!
//! # State Machine
//!
//! ```text
//! INIT → CONNECTING → HEALTHY ⇄ DEGRADED
//!            ↑           ↓         ↓
//!            └──── RECONNECTING ←──┘
//! any → CLOSED (auth failure, shutdown, connection no longer needed)
//! ```

use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Physical connection identifier, unique per process.
pub type ConnectionId = u64;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Created, not yet dialed.
    Init,
    /// Dialing and subscribing.
    Connecting,
    /// Receiving data.
    Healthy,
    /// Socket open but idle past the configured window.
    Degraded,
    /// Waiting out backoff before the next dial.
    Reconnecting,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether `next` is a legal successor.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Closed, Connecting, Degraded, Healthy, Init, Reconnecting};
        matches!(
            (self, next),
            (Init, Connecting)
                | (Connecting, Healthy | Reconnecting)
                | (Healthy, Degraded | Reconnecting)
                | (Degraded, Healthy | Reconnecting)
                | (Reconnecting, Connecting)
                | (Init | Connecting | Healthy | Degraded | Reconnecting, Closed)
        )
    }

    /// Whether data is expected to flow.
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Connecting => "CONNECTING",
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Reconnecting => "RECONNECTING",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    /// Owning connection.
    pub connection: ConnectionId,
    /// Exchange.
    pub exchange: String,
    /// Current state.
    pub state: ConnectionState,
    /// When the current state was entered.
    pub since: Instant,
    /// When the connection last stopped being healthy; `None` while healthy.
    pub unhealthy_since: Option<Instant>,
    /// Last data-bearing message.
    pub last_message_at: Option<Instant>,
    /// Failures since the last healthy period.
    pub consecutive_failures: u32,
    /// Keys currently active on the socket.
    pub subscriptions: usize,
    /// Most recent error text.
    pub last_error: Option<String>,
}

impl ConnectionHealth {
    /// How long the connection has been unhealthy at `now`.
    #[must_use]
    pub fn unhealthy_for(&self, now: Instant) -> Option<Duration> {
        self.unhealthy_since
            .map(|since| now.saturating_duration_since(since))
    }
}

/// Single-writer health record.
#[derive(Debug)]
pub struct HealthCell {
    inner: RwLock<ConnectionHealth>,
}

impl HealthCell {
    /// Create a cell in `INIT`.
    #[must_use]
    pub fn new(connection: ConnectionId, exchange: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            inner: RwLock::new(ConnectionHealth {
                connection,
                exchange: exchange.into(),
                state: ConnectionState::Init,
                since: now,
                unhealthy_since: Some(now),
                last_message_at: None,
                consecutive_failures: 0,
                subscriptions: 0,
                last_error: None,
            }),
        }
    }

    /// Snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionHealth {
        self.inner.read().clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    /// Move to `next`, logging the transition.
    ///
    /// Illegal transitions are ignored and return `false`.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut health = self.inner.write();
        let previous = health.state;
        if previous == next {
            return true;
        }
        if !previous.can_transition_to(next) {
            tracing::debug!(
                connection = health.connection,
                from = %previous,
                to = %next,
                "Ignoring illegal connection transition"
            );
            return false;
        }

        let now = Instant::now();
        health.state = next;
        health.since = now;
        if next == ConnectionState::Healthy {
            health.unhealthy_since = None;
            health.consecutive_failures = 0;
            health.last_error = None;
        } else if health.unhealthy_since.is_none() {
            health.unhealthy_since = Some(now);
        }
        let connection = health.connection;
        let exchange = health.exchange.clone();
        drop(health);

        match next {
            ConnectionState::Degraded | ConnectionState::Reconnecting => tracing::warn!(
                connection,
                exchange = %exchange,
                from = %previous,
                to = %next,
                "Connection state changed"
            ),
            _ => tracing::info!(
                connection,
                exchange = %exchange,
                from = %previous,
                to = %next,
                "Connection state changed"
            ),
        }
        true
    }

    /// Record a data-bearing message.
    pub fn record_message(&self) {
        self.inner.write().last_message_at = Some(Instant::now());
    }

    /// Record a failure.
    pub fn record_failure(&self, error: impl Into<String>) {
        let mut health = self.inner.write();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_error = Some(error.into());
    }

    /// Set the active subscription count.
    pub fn set_subscriptions(&self, count: usize) {
        self.inner.write().subscriptions = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_lifecycle() {
        use ConnectionState::*;
        assert!(Init.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Healthy));
        assert!(Healthy.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Healthy.can_transition_to(Closed));
    }

    #[test]
    fn closed_is_terminal() {
        for next in [
            ConnectionState::Init,
            ConnectionState::Connecting,
            ConnectionState::Healthy,
        ] {
            assert!(!ConnectionState::Closed.can_transition_to(next));
        }
        assert!(!ConnectionState::Init.can_transition_to(ConnectionState::Healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_since_tracks_healthy_periods() {
        let cell = HealthCell::new(1, "bybit");
        assert!(cell.snapshot().unhealthy_since.is_some());

        cell.transition(ConnectionState::Connecting);
        cell.transition(ConnectionState::Healthy);
        assert!(cell.snapshot().unhealthy_since.is_none());

        cell.transition(ConnectionState::Degraded);
        tokio::time::advance(Duration::from_secs(3)).await;
        cell.transition(ConnectionState::Reconnecting);

        let health = cell.snapshot();
        assert_eq!(
            health.unhealthy_for(Instant::now()),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn illegal_transition_is_ignored() {
        let cell = HealthCell::new(1, "bybit");
        assert!(!cell.transition(ConnectionState::Healthy));
        assert_eq!(cell.state(), ConnectionState::Init);
    }

    #[test]
    fn healthy_clears_failures() {
        let cell = HealthCell::new(1, "bybit");
        cell.transition(ConnectionState::Connecting);
        cell.record_failure("reset");
        cell.record_failure("reset");
        assert_eq!(cell.snapshot().consecutive_failures, 2);

        cell.transition(ConnectionState::Healthy);
        let health = cell.snapshot();
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_error.is_none());
    }
}

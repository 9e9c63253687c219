//! Heartbeat
//!
//! Bybit drops public connections that stay silent for too long, so the
//! session sends an application ping (`{"op":"ping"}`) every
//! `ping_interval`. Any inbound frame counts as proof of life; if nothing
//! arrives within `pong_timeout` of a ping the session is considered dead.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence after a ping that counts as a dead connection.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl HeartbeatConfig {
    /// Create a configuration.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }
}

/// Action requested by a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping now.
    SendPing,
    /// No reply to the last ping; restart the connection.
    Timeout,
}

/// Per-session heartbeat state.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    last_seen: Instant,
    ping_sent_at: Option<Instant>,
}

impl Heartbeat {
    /// Start tracking from now.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_seen: Instant::now(),
            ping_sent_at: None,
        }
    }

    /// Ticker driving [`Self::on_tick`]; the first tick is one interval out.
    #[must_use]
    pub fn interval(&self) -> Interval {
        let period = self.config.ping_interval.max(Duration::from_millis(10));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    /// Record inbound traffic.
    pub fn record_pong(&mut self) {
        self.last_seen = Instant::now();
        self.ping_sent_at = None;
    }

    /// Whether a ping is awaiting a reply.
    #[must_use]
    pub const fn is_waiting_for_pong(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn time_since_pong(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// Decide what to do on a tick at `now`.
    pub fn on_tick(&mut self, now: Instant) -> Option<HeartbeatEvent> {
        match self.ping_sent_at {
            Some(sent) if now.saturating_duration_since(sent) >= self.config.pong_timeout => {
                Some(HeartbeatEvent::Timeout)
            }
            Some(_) => None,
            None => {
                self.ping_sent_at = Some(now);
                Some(HeartbeatEvent::SendPing)
            }
        }
    }
}

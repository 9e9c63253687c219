//! Cache Warmer
//!
//! Periodically refreshes the most-read keys so consumers keep hitting
//! fresh values while the stream is quiet or a connection is recovering.
//!
//! The cadence and per-cycle budget follow the activity phase in force
//! (e.g. an active session vs. a quiet overnight period). Keys are warmed
//! most-read first (Zipf-style ranking from the coordinator's access
//! counts), and a cycle stops as soon as either its request budget or its
//! time budget is spent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::cache_coordinator::{CacheCoordinator, WriteOutcome};
use crate::application::ports::WarmSource;
use crate::error::ErrorKind;
use crate::infrastructure::metrics;

// =============================================================================
// Schedule
// =============================================================================

/// One activity phase of the warming schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmPhase {
    /// Phase name, used in logs and metrics.
    pub name: String,
    /// First UTC hour of the phase (inclusive).
    pub start_hour: u8,
    /// Last UTC hour of the phase (exclusive). May wrap past midnight.
    pub end_hour: u8,
    /// Pause between cycles.
    pub interval: Duration,
    /// Maximum keys refreshed per cycle.
    pub max_requests: usize,
    /// Maximum wall time per cycle.
    pub time_budget: Duration,
}

impl WarmPhase {
    /// Whether the phase covers `hour` (0-23, UTC).
    #[must_use]
    pub const fn contains(&self, hour: u8) -> bool {
        let (start, end) = (self.start_hour, self.end_hour);
        if start == end {
            true
        } else if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    /// Quiet-period fallback phase.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            name: "quiet".to_string(),
            start_hour: 0,
            end_hour: 0,
            interval: Duration::from_secs(60),
            max_requests: 20,
            time_budget: Duration::from_secs(5),
        }
    }
}

/// Phases checked in order; the first match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmSchedule {
    phases: Vec<WarmPhase>,
    fallback: WarmPhase,
}

impl Default for WarmSchedule {
    fn default() -> Self {
        Self::new(
            vec![WarmPhase {
                name: "active".to_string(),
                start_hour: 13,
                end_hour: 21,
                interval: Duration::from_secs(15),
                max_requests: 100,
                time_budget: Duration::from_secs(5),
            }],
            WarmPhase::quiet(),
        )
    }
}

impl WarmSchedule {
    /// Create a schedule. `fallback` applies outside every phase.
    #[must_use]
    pub const fn new(phases: Vec<WarmPhase>, fallback: WarmPhase) -> Self {
        Self { phases, fallback }
    }

    /// Phase in force at `now`.
    #[must_use]
    pub fn phase_at(&self, now: DateTime<Utc>) -> &WarmPhase {
        let hour = u8::try_from(now.hour()).unwrap_or(0);
        self.phases
            .iter()
            .find(|phase| phase.contains(hour))
            .unwrap_or(&self.fallback)
    }
}

// =============================================================================
// Warmer
// =============================================================================

/// Outcome of one warming cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    /// Phase the cycle ran under.
    pub phase: String,
    /// Keys written.
    pub warmed: usize,
    /// Keys the source could not rebuild, or already newer in cache.
    pub skipped: usize,
    /// Keys whose load or write failed.
    pub failed: usize,
    /// Whether the cycle stopped on its time budget or an open circuit.
    pub cut_short: bool,
}

/// Scheduled, budgeted cache refresh.
pub struct CacheWarmer {
    coordinator: Arc<CacheCoordinator>,
    source: Arc<dyn WarmSource>,
    schedule: WarmSchedule,
}

impl std::fmt::Debug for CacheWarmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWarmer")
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl CacheWarmer {
    /// Create a warmer.
    #[must_use]
    pub fn new(coordinator: Arc<CacheCoordinator>, source: Arc<dyn WarmSource>, schedule: WarmSchedule) -> Self {
        Self {
            coordinator,
            source,
            schedule,
        }
    }

    /// Schedule in force.
    #[must_use]
    pub const fn schedule(&self) -> &WarmSchedule {
        &self.schedule
    }

    /// Run one cycle under the phase in force at `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> WarmReport {
        let phase = self.schedule.phase_at(now);
        let deadline = Instant::now() + phase.time_budget;
        let keys = self.coordinator.access().ranked(phase.max_requests);
        let mut report = WarmReport {
            phase: phase.name.clone(),
            ..WarmReport::default()
        };

        for (key, reads) in keys {
            let loaded = match tokio::time::timeout_at(deadline, self.source.load(&key)).await {
                Ok(loaded) => loaded,
                Err(_) => {
                    report.cut_short = true;
                    break;
                }
            };
            match loaded {
                Ok(Some(write)) => match self.coordinator.set(write).await {
                    Ok(WriteOutcome::Written { .. }) => report.warmed += 1,
                    Ok(WriteOutcome::Superseded { .. }) => report.skipped += 1,
                    Err(error) => {
                        tracing::debug!(key = %key, error = %error, "Warm write failed");
                        report.failed += 1;
                    }
                },
                Ok(None) => report.skipped += 1,
                Err(error) if error.kind() == ErrorKind::CircuitOpen => {
                    tracing::debug!(key = %key, reads, "Circuit open; ending warm cycle");
                    report.failed += 1;
                    report.cut_short = true;
                    break;
                }
                Err(error) => {
                    tracing::debug!(key = %key, reads, error = %error, "Warm load failed");
                    report.failed += 1;
                }
            }

            if Instant::now() >= deadline {
                tracing::debug!(phase = %report.phase, "Time budget spent; ending warm cycle");
                report.cut_short = true;
                break;
            }
        }

        self.coordinator.access().decay();
        metrics::record_keys_warmed(&report.phase, report.warmed);
        tracing::info!(
            phase = %report.phase,
            warmed = report.warmed,
            skipped = report.skipped,
            failed = report.failed,
            cut_short = report.cut_short,
            "Cache warm cycle finished"
        );
        report
    }

    /// Run cycles until cancelled, pausing per the phase in force.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let warmer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = warmer.schedule.phase_at(Utc::now()).interval;
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                warmer.run_cycle(Utc::now()).await;
            }
            tracing::debug!("Cache warmer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    use std::collections::HashMap;

    use super::*;
    use crate::application::ports::{CacheTier, TierError};
    use crate::application::services::cache_coordinator::{CacheTiers, CoordinatorConfig};
    use crate::domain::cache::{CacheEntry, CacheKey, CacheWrite, KeyNamespace, TierLevel};
    use crate::domain::market::{DataClass, MarketPayload, NormalizedEvent, Symbol, TickerData};
    use crate::error::IngestError;
    use crate::infrastructure::cache::MemoryTier;
    use crate::resilience::CircuitOpenError;

    fn ns() -> KeyNamespace {
        KeyNamespace::new("md", 1).unwrap()
    }

    fn coordinator() -> Arc<CacheCoordinator> {
        Arc::new(CacheCoordinator::new(
            CoordinatorConfig::new(ns()),
            CacheTiers {
                hot: Arc::new(MemoryTier::new(TierLevel::Hot, 100)),
                warm: Arc::new(MemoryTier::new(TierLevel::Warm, 100)),
                durable: Arc::new(MemoryTier::new(TierLevel::Durable, 100)),
            },
        ))
    }

    /// Memory tier whose writes take `delay`.
    struct SlowTier {
        inner: MemoryTier,
        delay: Duration,
    }

    #[async_trait]
    impl CacheTier for SlowTier {
        fn level(&self) -> TierLevel {
            self.inner.level()
        }

        async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, entry: &CacheEntry, ttl: Duration) -> Result<(), TierError> {
            tokio::time::sleep(self.delay).await;
            self.inner.set(key, entry, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), TierError> {
            self.inner.delete(key).await
        }

        async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, CacheEntry>, TierError> {
            self.inner.multi_get(keys).await
        }
    }

    fn key(ticker: &str) -> CacheKey {
        CacheKey::latest(&ns(), Symbol::new("bybit", ticker).unwrap(), DataClass::Ticker)
    }

    struct RecordingSource {
        loaded: Mutex<Vec<String>>,
        open_after: Option<usize>,
    }

    #[async_trait]
    impl WarmSource for RecordingSource {
        async fn load(&self, key: &CacheKey) -> Result<Option<CacheWrite>, IngestError> {
            let mut loaded = self.loaded.lock();
            if self.open_after.is_some_and(|n| loaded.len() >= n) {
                return Err(IngestError::CircuitOpen(CircuitOpenError {
                    breaker: "bybit/market_rest".to_string(),
                    retry_in: Duration::from_secs(30),
                }));
            }
            loaded.push(key.symbol().ticker().to_string());
            drop(loaded);
            let event = NormalizedEvent::new(
                key.symbol().clone(),
                MarketPayload::Ticker(TickerData {
                    last_price: dec!(100),
                    bid_price: None,
                    ask_price: None,
                    volume_24h: None,
                }),
                Utc::now(),
            );
            Ok(Some(CacheWrite::from_event(&ns(), event)))
        }
    }

    fn phase(name: &str, start_hour: u8, end_hour: u8, max_requests: usize) -> WarmPhase {
        WarmPhase {
            name: name.to_string(),
            start_hour,
            end_hour,
            interval: Duration::from_secs(10),
            max_requests,
            time_budget: Duration::from_secs(5),
        }
    }

    #[test]
    fn phase_windows_may_wrap_midnight() {
        let overnight = phase("overnight", 22, 6, 10);
        assert!(overnight.contains(23));
        assert!(overnight.contains(0));
        assert!(overnight.contains(5));
        assert!(!overnight.contains(6));
        assert!(!overnight.contains(12));
    }

    #[test]
    fn schedule_falls_back_outside_every_phase() {
        let schedule = WarmSchedule::new(vec![phase("active", 13, 21, 100)], WarmPhase::quiet());
        let afternoon = Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 3, 4, 2, 0, 0).unwrap();
        assert_eq!(schedule.phase_at(afternoon).name, "active");
        assert_eq!(schedule.phase_at(night).name, "quiet");
    }

    #[tokio::test]
    async fn warms_most_read_keys_first_within_budget() {
        let coordinator = coordinator();
        for (ticker, reads) in [("BTCUSDT", 5), ("ETHUSDT", 3), ("SOLUSDT", 1)] {
            for _ in 0..reads {
                coordinator.access().record(&key(ticker));
            }
        }
        let source = Arc::new(RecordingSource {
            loaded: Mutex::new(Vec::new()),
            open_after: None,
        });
        let schedule = WarmSchedule::new(Vec::new(), phase("all", 0, 0, 2));
        let warmer = CacheWarmer::new(Arc::clone(&coordinator), Arc::clone(&source) as Arc<dyn WarmSource>, schedule);

        let report = warmer.run_cycle(Utc::now()).await;

        assert_eq!(report.warmed, 2);
        assert_eq!(*source.loaded.lock(), vec!["BTCUSDT", "ETHUSDT"]);
        assert!(coordinator.assigned_ttl(&key("BTCUSDT")).is_some());
        assert!(coordinator.assigned_ttl(&key("SOLUSDT")).is_none());
    }

    #[tokio::test]
    async fn open_circuit_ends_the_cycle() {
        let coordinator = coordinator();
        for ticker in ["BTCUSDT", "ETHUSDT", "SOLUSDT"] {
            coordinator.access().record(&key(ticker));
        }
        let source = Arc::new(RecordingSource {
            loaded: Mutex::new(Vec::new()),
            open_after: Some(1),
        });
        let warmer = CacheWarmer::new(
            coordinator,
            Arc::clone(&source) as Arc<dyn WarmSource>,
            WarmSchedule::new(Vec::new(), phase("all", 0, 0, 10)),
        );

        let report = warmer.run_cycle(Utc::now()).await;

        assert_eq!(report.warmed, 1);
        assert_eq!(report.failed, 1);
        assert!(report.cut_short);
        assert_eq!(source.loaded.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_writes_count_against_the_time_budget() {
        let coordinator = Arc::new(CacheCoordinator::new(
            CoordinatorConfig::new(ns()),
            CacheTiers {
                hot: Arc::new(MemoryTier::new(TierLevel::Hot, 100)),
                warm: Arc::new(SlowTier {
                    inner: MemoryTier::new(TierLevel::Warm, 100),
                    delay: Duration::from_millis(200),
                }),
                durable: Arc::new(MemoryTier::new(TierLevel::Durable, 100)),
            },
        ));
        for (ticker, reads) in [("BTCUSDT", 3), ("ETHUSDT", 2), ("SOLUSDT", 1)] {
            for _ in 0..reads {
                coordinator.access().record(&key(ticker));
            }
        }
        let source = Arc::new(RecordingSource {
            loaded: Mutex::new(Vec::new()),
            open_after: None,
        });
        let budgeted = WarmPhase {
            time_budget: Duration::from_millis(300),
            ..phase("all", 0, 0, 10)
        };
        let warmer = CacheWarmer::new(
            coordinator,
            Arc::clone(&source) as Arc<dyn WarmSource>,
            WarmSchedule::new(Vec::new(), budgeted),
        );

        let started = Instant::now();
        let report = warmer.run_cycle(Utc::now()).await;

        assert!(report.cut_short);
        assert_eq!(report.warmed, 2);
        assert_eq!(*source.loaded.lock(), vec!["BTCUSDT", "ETHUSDT"]);
        assert!(started.elapsed() < Duration::from_millis(600));
    }
}

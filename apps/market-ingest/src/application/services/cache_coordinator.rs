//! Cache Coordinator
//!
//! The single entry point to the hot / warm / durable tier stack.
//!
//! # Reads
//!
//! Tiers are consulted fastest first. A hit in a slower tier is promoted
//! into every faster tier with a TTL no longer than the value's remaining
//! TTL (and the faster tier's own cap). A tier that errors is skipped, so an
//! outage falls through to the next tier; a full miss is reported as such
//! and never filled with a default.
//!
//! # Writes
//!
//! Every value has exactly one tier-of-record, chosen per data class. A
//! write goes to that tier only, then deletes promoted copies from the
//! faster tiers. Writes to one key are serialized on a lock stripe and
//! resolved last-writer-wins by `source_timestamp`.
//!
//! # TTL Hierarchy
//!
//! `ttl = base(class) + depth * step`, raised above the TTL of every direct
//! dependency. A dependency that has not been written yet counts with the
//! TTL its own class and depth give it, so writing a derived key before its
//! inputs still leaves it outliving them.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::application::ports::{CacheTier, TierError};
use crate::domain::cache::{
    CacheEntry, CacheKey, CacheWrite, DependencyError, DependencyGraph, KeyNamespace, TierLevel,
    TtlPolicy,
};
use crate::domain::market::{
    DataClass, MAX_CLOCK_SKEW, NotAvailableReason, Snapshot, SnapshotResult, Symbol, ValidationError,
    validate_class, validate_payload,
};
use crate::error::ErrorKind;
use crate::infrastructure::metrics;

const LOCK_STRIPES: usize = 64;

// =============================================================================
// Configuration
// =============================================================================

/// Per-data-class cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassPolicy {
    /// Authoritative tier for the class.
    pub tier_of_record: TierLevel,
    /// Age after which a served value is marked stale.
    pub stale_after: Duration,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Key namespace for `latest` keys.
    pub namespace: KeyNamespace,
    /// TTL hierarchy.
    pub ttl: TtlPolicy,
    /// Per-class policy; classes not listed use [`Self::default_class`].
    pub classes: BTreeMap<DataClass, ClassPolicy>,
    /// Policy for unlisted classes.
    pub default_class: ClassPolicy,
    /// Upper bound on promoted copies in the hot tier.
    pub hot_ttl_cap: Duration,
    /// Upper bound on promoted copies in the warm tier.
    pub warm_ttl_cap: Duration,
    /// Deadline for every tier operation.
    pub tier_timeout: Duration,
}

impl CoordinatorConfig {
    /// Defaults under `namespace`.
    #[must_use]
    pub fn new(namespace: KeyNamespace) -> Self {
        let warm = |secs| ClassPolicy {
            tier_of_record: TierLevel::Warm,
            stale_after: Duration::from_secs(secs),
        };
        let durable = |secs| ClassPolicy {
            tier_of_record: TierLevel::Durable,
            stale_after: Duration::from_secs(secs),
        };
        Self {
            namespace,
            ttl: TtlPolicy::default(),
            classes: BTreeMap::from([
                (DataClass::Ticker, warm(10)),
                (DataClass::OrderBook, warm(5)),
                (DataClass::Trade, warm(30)),
                (DataClass::OpenInterest, durable(120)),
                (DataClass::Derived, durable(60)),
            ]),
            default_class: warm(30),
            hot_ttl_cap: Duration::from_secs(5),
            warm_ttl_cap: Duration::from_secs(60),
            tier_timeout: Duration::from_millis(250),
        }
    }

    /// Policy for a class.
    #[must_use]
    pub fn class(&self, data_class: DataClass) -> ClassPolicy {
        self.classes
            .get(&data_class)
            .copied()
            .unwrap_or(self.default_class)
    }

    fn promotion_cap(&self, tier: TierLevel) -> Duration {
        match tier {
            TierLevel::Hot => self.hot_ttl_cap,
            TierLevel::Warm => self.warm_ttl_cap,
            TierLevel::Durable => Duration::MAX,
        }
    }
}

// =============================================================================
// Results and Errors
// =============================================================================

/// Coordinator failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The value failed validation at the write boundary.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The declared dependencies are invalid.
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// The tier-of-record write failed.
    #[error(transparent)]
    Tier(#[from] TierError),
}

impl CacheError {
    /// Classify for handling.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Dependency(_) => ErrorKind::Validation,
            Self::Tier(_) => ErrorKind::TierUnavailable,
        }
    }
}

/// Result of a coordinator read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Found.
    Hit {
        /// Stored value.
        entry: CacheEntry,
        /// Tier that served it.
        tier: TierLevel,
    },
    /// Not in any reachable tier.
    Miss {
        /// Tiers that errored and were skipped.
        unreachable: Vec<TierLevel>,
        /// Whether an undecodable or invalid stored value was discarded.
        discarded_invalid: bool,
    },
    /// Every tier errored.
    Unavailable,
}

impl Lookup {
    /// The entry on a hit.
    #[must_use]
    pub const fn entry(&self) -> Option<&CacheEntry> {
        match self {
            Self::Hit { entry, .. } => Some(entry),
            Self::Miss { .. } | Self::Unavailable => None,
        }
    }
}

/// Result of a coordinator write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored at the tier-of-record.
    Written {
        /// Tier-of-record.
        tier: TierLevel,
        /// TTL assigned.
        ttl: Duration,
    },
    /// Ignored: a value with a later `source_timestamp` is already stored.
    Superseded {
        /// Timestamp of the stored value.
        existing: DateTime<Utc>,
    },
}

/// Result of [`CacheCoordinator::invalidate_cascade`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Rendered keys removed, root first, then breadth-first dependents.
    pub invalidated: Vec<String>,
    /// `(key, tier)` deletes that failed.
    pub failed: Vec<(String, TierLevel)>,
}

impl CascadeReport {
    /// Whether every delete succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// =============================================================================
// Access Tracking
// =============================================================================

/// Read-frequency counts used to rank keys for warming.
#[derive(Debug, Default)]
pub struct AccessTracker {
    counts: DashMap<CacheKey, u64>,
}

impl AccessTracker {
    /// Count one read.
    pub fn record(&self, key: &CacheKey) {
        *self.counts.entry(key.clone()).or_insert(0) += 1;
    }

    /// The `limit` most-read keys, most-read first.
    #[must_use]
    pub fn ranked(&self, limit: usize) -> Vec<(CacheKey, u64)> {
        let mut ranked: Vec<(CacheKey, u64)> = self
            .counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.render().cmp(&b.0.render())));
        ranked.truncate(limit);
        ranked
    }

    /// Halve every count, forgetting keys that reach zero.
    pub fn decay(&self) {
        self.counts.retain(|_, count| {
            *count /= 2;
            *count > 0
        });
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether nothing has been read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// The three tiers, fastest first.
#[derive(Clone)]
pub struct CacheTiers {
    /// In-process tier.
    pub hot: Arc<dyn CacheTier>,
    /// Shared medium-TTL tier.
    pub warm: Arc<dyn CacheTier>,
    /// Shared long-TTL tier.
    pub durable: Arc<dyn CacheTier>,
}

impl CacheTiers {
    fn get(&self, level: TierLevel) -> &dyn CacheTier {
        match level {
            TierLevel::Hot => self.hot.as_ref(),
            TierLevel::Warm => self.warm.as_ref(),
            TierLevel::Durable => self.durable.as_ref(),
        }
    }
}

/// Tier promotion, hierarchical TTL and dependency-aware invalidation.
pub struct CacheCoordinator {
    config: CoordinatorConfig,
    tiers: CacheTiers,
    graph: RwLock<DependencyGraph>,
    watermarks: DashMap<String, DateTime<Utc>>,
    assigned_ttls: DashMap<CacheKey, Duration>,
    stripes: Vec<Mutex<()>>,
    access: AccessTracker,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("namespace", &self.config.namespace)
            .field("tracked_keys", &self.watermarks.len())
            .finish_non_exhaustive()
    }
}

impl CacheCoordinator {
    /// Create a coordinator over `tiers`.
    #[must_use]
    pub fn new(config: CoordinatorConfig, tiers: CacheTiers) -> Self {
        Self {
            config,
            tiers,
            graph: RwLock::new(DependencyGraph::new()),
            watermarks: DashMap::new(),
            assigned_ttls: DashMap::new(),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            access: AccessTracker::default(),
        }
    }

    /// Configuration in force.
    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Namespace of `latest` keys.
    #[must_use]
    pub const fn namespace(&self) -> &KeyNamespace {
        &self.config.namespace
    }

    /// Read-frequency ranking.
    #[must_use]
    pub const fn access(&self) -> &AccessTracker {
        &self.access
    }

    /// `latest` key for a symbol and class.
    #[must_use]
    pub fn latest_key(&self, symbol: &Symbol, data_class: DataClass) -> CacheKey {
        CacheKey::latest(&self.config.namespace, symbol.clone(), data_class)
    }

    /// TTL assigned by the last successful write of `key`.
    #[must_use]
    pub fn assigned_ttl(&self, key: &CacheKey) -> Option<Duration> {
        self.assigned_ttls.get(key).map(|ttl| *ttl)
    }

    /// Read through the tier stack, promoting hits from slower tiers.
    pub async fn get(&self, key: &CacheKey) -> Lookup {
        self.access.record(key);
        let rendered = key.render();
        let mut unreachable = Vec::new();
        let mut discarded_invalid = false;

        for level in TierLevel::ALL {
            match self.read(level, &rendered).await {
                Ok(Some(entry)) => {
                    if let Err(error) = check_stored(&entry, &rendered) {
                        tracing::warn!(
                            key = %rendered,
                            tier = %level,
                            error = %error,
                            "Discarding invalid stored value"
                        );
                        discarded_invalid = true;
                        let _ = self.delete_from(level, &rendered).await;
                        continue;
                    }
                    metrics::record_cache_hit(level);
                    self.promote(key, &rendered, &entry, level).await;
                    return Lookup::Hit { entry, tier: level };
                }
                Ok(None) => {}
                Err(error) if error.is_corrupt() => {
                    discarded_invalid = true;
                    let _ = self.delete_from(level, &rendered).await;
                }
                Err(_) => unreachable.push(level),
            }
        }

        metrics::record_cache_miss();
        if unreachable.len() == TierLevel::ALL.len() {
            Lookup::Unavailable
        } else {
            Lookup::Miss {
                unreachable,
                discarded_invalid,
            }
        }
    }

    /// Validate and store a value at its tier-of-record.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Validation`] for a non-conforming value,
    /// [`CacheError::Dependency`] for a self-referencing or cyclic dependency
    /// and [`CacheError::Tier`] if the tier-of-record write fails.
    pub async fn set(&self, write: CacheWrite) -> Result<WriteOutcome, CacheError> {
        let data_class = write.data_class();
        validate_class(data_class, write.schema_version, &write.payload)?;
        validate_payload(&write.payload)?;
        let now = Utc::now();
        if write.source_timestamp > now + MAX_CLOCK_SKEW {
            return Err(ValidationError::FutureTimestamp(write.source_timestamp).into());
        }

        let rendered = write.key.render();
        let guard = self.lock(&rendered).await;

        if let Some(existing) = self.watermarks.get(&rendered).map(|ts| *ts)
            && existing > write.source_timestamp
        {
            tracing::debug!(
                key = %rendered,
                existing = %existing,
                incoming = %write.source_timestamp,
                "Ignoring write older than stored value"
            );
            return Ok(WriteOutcome::Superseded { existing });
        }

        let ttl = {
            let mut graph = self.graph.write();
            graph.set_dependencies(&write.key, &write.depends_on)?;
            self.expected_ttl(&graph, &write.key)
        };
        let tier = self.config.class(data_class).tier_of_record;

        let entry = CacheEntry {
            key: rendered.clone(),
            symbol: write.key.symbol().clone(),
            data_class,
            schema_version: write.schema_version,
            payload: write.payload,
            source_timestamp: write.source_timestamp,
            written_at: now,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            tier_of_record: tier,
            promoted: false,
            depends_on: write.depends_on.iter().map(CacheKey::render).collect(),
        };

        self.write_to(tier, &rendered, &entry, ttl).await?;

        for faster in TierLevel::ALL.into_iter().filter(|level| *level < tier) {
            if let Err(error) = self.delete_from(faster, &rendered).await {
                tracing::warn!(
                    key = %rendered,
                    tier = %faster,
                    error = %error,
                    "Failed to invalidate promoted copy"
                );
            }
        }

        self.watermarks.insert(rendered, write.source_timestamp);
        self.assigned_ttls.insert(write.key.clone(), ttl);
        drop(guard);

        self.extend_dependents(&write.key).await;
        Ok(WriteOutcome::Written { tier, ttl })
    }

    /// Lengthen stored dependents of `key` whose TTL no longer exceeds their inputs'.
    async fn extend_dependents(&self, key: &CacheKey) {
        let dependents = self.graph.read().dependents_bfs(key);
        for dependent in dependents {
            let Some(assigned) = self.assigned_ttl(&dependent) else {
                continue;
            };
            let required = self.expected_ttl(&self.graph.read(), &dependent);
            if required <= assigned {
                continue;
            }

            let rendered = dependent.render();
            let _guard = self.lock(&rendered).await;
            let tier = self.config.class(dependent.data_class()).tier_of_record;
            if let Ok(Some(mut entry)) = self.read(tier, &rendered).await {
                entry.ttl_ms = u64::try_from(required.as_millis()).unwrap_or(u64::MAX);
                let remaining = entry.remaining_ttl(Utc::now());
                if !remaining.is_zero()
                    && let Err(error) = self.write_to(tier, &rendered, &entry, remaining).await
                {
                    tracing::warn!(key = %rendered, error = %error, "Failed to extend dependent ttl");
                    continue;
                }
            }
            tracing::debug!(
                key = %rendered,
                from_ms = assigned.as_millis(),
                to_ms = required.as_millis(),
                "Extended dependent ttl"
            );
            self.assigned_ttls.insert(dependent, required);
        }
    }

    /// TTL a write of `key` gets under the current graph.
    ///
    /// Dependencies that were never written here (or were written before a
    /// restart) count with the TTL their own class and depth would get, so
    /// the result does not depend on write order.
    fn expected_ttl(&self, graph: &DependencyGraph, key: &CacheKey) -> Duration {
        let inputs: Vec<Duration> = graph
            .dependencies_of(key)
            .iter()
            .map(|dep| self.expected_ttl(graph, dep))
            .collect();
        let policy = self.config.ttl.ttl_for(key.data_class(), graph.depth(key), inputs);
        self.assigned_ttl(key).map_or(policy, |assigned| assigned.max(policy))
    }

    /// Delete `key` and every key transitively derived from it from every tier.
    pub async fn invalidate_cascade(&self, key: &CacheKey) -> CascadeReport {
        let mut keys = vec![key.clone()];
        keys.extend(self.graph.read().dependents_bfs(key));

        let mut report = CascadeReport::default();
        for key in keys {
            let rendered = key.render();
            let _guard = self.lock(&rendered).await;
            for level in TierLevel::ALL {
                if self.delete_from(level, &rendered).await.is_err() {
                    report.failed.push((rendered.clone(), level));
                }
            }
            self.watermarks.remove(&rendered);
            self.assigned_ttls.remove(&key);
            report.invalidated.push(rendered);
        }

        metrics::record_cascade_deletions(report.invalidated.len());
        tracing::info!(
            root = %key,
            invalidated = report.invalidated.len(),
            failed = report.failed.len(),
            "Cascade invalidation complete"
        );
        report
    }

    /// Consumer read of the latest value with a freshness indicator.
    pub async fn get_snapshot(&self, symbol: &Symbol, data_class: DataClass) -> SnapshotResult {
        self.snapshot(&self.latest_key(symbol, data_class)).await
    }

    /// Consumer read of any key with a freshness indicator.
    pub async fn snapshot(&self, key: &CacheKey) -> SnapshotResult {
        let (entry, tier) = match self.get(key).await {
            Lookup::Hit { entry, tier } => (entry, tier),
            Lookup::Miss {
                discarded_invalid: true,
                ..
            } => {
                return SnapshotResult::NotAvailable {
                    reason: NotAvailableReason::InvalidStoredValue,
                };
            }
            Lookup::Miss { .. } => {
                return SnapshotResult::NotAvailable {
                    reason: NotAvailableReason::Missing,
                };
            }
            Lookup::Unavailable => {
                return SnapshotResult::NotAvailable {
                    reason: NotAvailableReason::AllTiersUnavailable,
                };
            }
        };

        let age = entry.age(Utc::now());
        let stale_after = self.config.class(entry.data_class).stale_after;
        let snapshot = Snapshot {
            symbol: entry.symbol,
            data_class: entry.data_class,
            payload: entry.payload,
            source_timestamp: entry.source_timestamp,
            written_at: entry.written_at,
            served_from: tier,
        };
        if age > stale_after {
            SnapshotResult::Stale { snapshot, age }
        } else {
            SnapshotResult::Fresh(snapshot)
        }
    }

    // -------------------------------------------------------------------------
    // Tier access
    // -------------------------------------------------------------------------

    async fn promote(&self, key: &CacheKey, rendered: &str, entry: &CacheEntry, from: TierLevel) {
        let remaining = entry.remaining_ttl(Utc::now());
        if remaining.is_zero() {
            return;
        }

        let _guard = self.lock(rendered).await;
        if let Some(current) = self.watermarks.get(rendered).map(|ts| *ts)
            && current > entry.source_timestamp
        {
            return;
        }

        let copy = entry.promoted_copy();
        for faster in TierLevel::ALL.into_iter().filter(|level| *level < from) {
            let ttl = remaining.min(self.config.promotion_cap(faster));
            if self.write_to(faster, rendered, &copy, ttl).await.is_ok() {
                metrics::record_promotion(faster);
                tracing::trace!(key = %key, from = %from, to = %faster, ttl_ms = ttl.as_millis(), "Promoted");
            }
        }
    }

    async fn read(&self, level: TierLevel, key: &str) -> Result<Option<CacheEntry>, TierError> {
        let tier = self.tiers.get(level);
        self.bounded(level, "get", tier.get(key)).await
    }

    async fn write_to(
        &self,
        level: TierLevel,
        key: &str,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<(), TierError> {
        let tier = self.tiers.get(level);
        self.bounded(level, "set", tier.set(key, entry, ttl)).await
    }

    async fn delete_from(&self, level: TierLevel, key: &str) -> Result<(), TierError> {
        let tier = self.tiers.get(level);
        self.bounded(level, "delete", tier.delete(key)).await
    }

    async fn bounded<T>(
        &self,
        level: TierLevel,
        operation: &'static str,
        call: impl Future<Output = Result<T, TierError>>,
    ) -> Result<T, TierError> {
        let after = self.config.tier_timeout;
        let result = tokio::time::timeout(after, call)
            .await
            .unwrap_or(Err(TierError::Timeout { tier: level, after }));
        if let Err(error) = &result {
            metrics::record_tier_error(level, operation);
            tracing::warn!(tier = %level, operation, error = %error, "Cache tier operation failed");
        }
        result
    }

    async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = usize::try_from(hasher.finish() % LOCK_STRIPES as u64).unwrap_or(0);
        self.stripes[stripe].lock().await
    }
}

/// Reject stored values that do not match the key they were read under.
fn check_stored(entry: &CacheEntry, key: &str) -> Result<(), ValidationError> {
    if entry.key != key {
        return Err(ValidationError::InvalidKeyComponent(entry.key.clone()));
    }
    validate_class(entry.data_class, entry.schema_version, &entry.payload)?;
    validate_payload(&entry.payload)
}

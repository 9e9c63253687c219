//! In-process cache tier backed by moka.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;

use crate::application::ports::{CacheTier, TierError};
use crate::domain::cache::{CacheEntry, TierLevel};

#[derive(Debug, Clone)]
struct Slot {
    entry: Arc<CacheEntry>,
    ttl: Duration,
}

/// Each slot expires after the TTL it was written with, including on overwrite.
struct SlotExpiry;

impl Expiry<String, Slot> for SlotExpiry {
    fn expire_after_create(&self, _key: &String, value: &Slot, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Slot,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded in-process tier.
#[derive(Clone)]
pub struct MemoryTier {
    level: TierLevel,
    cache: Cache<String, Slot>,
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("level", &self.level)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl MemoryTier {
    /// Create a tier holding at most `capacity` entries.
    #[must_use]
    pub fn new(level: TierLevel, capacity: u64) -> Self {
        let cache = Cache::builder()
            .name(level.as_str())
            .max_capacity(capacity)
            .expire_after(SlotExpiry)
            .build();
        Self { level, cache }
    }

    /// TTL the key was last written with, if present.
    pub async fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.cache.get(key).await.map(|slot| slot.ttl)
    }

    /// Approximate entry count; eviction bookkeeping runs lazily.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Whether no entry has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn level(&self) -> TierLevel {
        self.level
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        Ok(self.cache.get(key).await.map(|slot| slot.entry.as_ref().clone()))
    }

    async fn set(&self, key: &str, entry: &CacheEntry, ttl: Duration) -> Result<(), TierError> {
        if ttl.is_zero() {
            self.cache.invalidate(key).await;
            return Ok(());
        }
        let slot = Slot {
            entry: Arc::new(entry.clone()),
            ttl,
        };
        self.cache.insert(key.to_string(), slot).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, CacheEntry>, TierError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(slot) = self.cache.get(key).await {
                found.insert(key.clone(), slot.entry.as_ref().clone());
            }
        }
        Ok(found)
    }
}

//! Shared cache tier backed by Redis.
//!
//! Entries are stored as JSON under `{prefix}{key}` with a millisecond
//! expiry (`SET .. PX`). A connection or protocol failure surfaces as
//! [`TierError::Unavailable`]; a value that does not decode surfaces as
//! [`TierError::Corrupt`]. Neither is ever reported as a miss.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::application::ports::{CacheTier, TierError};
use crate::domain::cache::{CacheEntry, TierLevel};

/// Redis-backed tier.
#[derive(Clone)]
pub struct RedisTier {
    level: TierLevel,
    prefix: String,
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTier")
            .field("level", &self.level)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisTier {
    /// Connect to `url`. The connection manager reconnects on its own after
    /// the initial connection succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`TierError::Unavailable`] if the URL is invalid or the first
    /// connection fails within `connect_timeout`.
    pub async fn connect(
        level: TierLevel,
        url: &str,
        prefix: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, TierError> {
        let unavailable = |reason: String| TierError::Unavailable { tier: level, reason };

        let client = redis::Client::open(url).map_err(|e| unavailable(e.to_string()))?;
        let connection = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| TierError::Timeout {
                tier: level,
                after: connect_timeout,
            })?
            .map_err(|e| unavailable(e.to_string()))?;

        tracing::info!(tier = %level, "Connected to Redis cache tier");
        Ok(Self {
            level,
            prefix: prefix.into(),
            connection,
        })
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn unavailable(&self, error: &redis::RedisError) -> TierError {
        TierError::Unavailable {
            tier: self.level,
            reason: error.to_string(),
        }
    }

    fn decode(&self, key: &str, raw: &[u8]) -> Result<CacheEntry, TierError> {
        CacheEntry::from_bytes(raw).map_err(|e| TierError::Corrupt {
            tier: self.level,
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn level(&self) -> TierLevel {
        self.level
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        let mut connection = self.connection.clone();
        let raw: Option<Vec<u8>> = connection
            .get(self.storage_key(key))
            .await
            .map_err(|e| self.unavailable(&e))?;
        raw.map(|bytes| self.decode(key, &bytes)).transpose()
    }

    async fn set(&self, key: &str, entry: &CacheEntry, ttl: Duration) -> Result<(), TierError> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return self.delete(key).await;
        }
        let bytes = entry.to_bytes().map_err(|e| TierError::Corrupt {
            tier: self.level,
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let mut connection = self.connection.clone();
        let _: () = connection
            .pset_ex(self.storage_key(key), bytes, millis)
            .await
            .map_err(|e| self.unavailable(&e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        let mut connection = self.connection.clone();
        let _removed: i64 = connection
            .del(self.storage_key(key))
            .await
            .map_err(|e| self.unavailable(&e))?;
        Ok(())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, CacheEntry>, TierError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let storage_keys: Vec<String> = keys.iter().map(|key| self.storage_key(key)).collect();

        let mut connection = self.connection.clone();
        let values: Vec<Option<Vec<u8>>> = connection
            .mget(storage_keys)
            .await
            .map_err(|e| self.unavailable(&e))?;

        let mut found = HashMap::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(values) {
            if let Some(bytes) = raw {
                found.insert(key.clone(), self.decode(key, &bytes)?);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_url_is_unavailable_not_miss() {
        let err = RedisTier::connect(
            TierLevel::Warm,
            "not-a-redis-url",
            "mi:warm:",
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TierError::Unavailable { tier: TierLevel::Warm, .. }));
    }
}

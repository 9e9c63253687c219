//! Connection Assignment
//!
//! Maps each logical [`SubscriptionKey`] to the physical connection serving
//! it and keeps every connection at or below its exchange's
//! per-connection subscription limit.
//!
//! The table is pure bookkeeping. It decides placements and migrations; the
//! stream manager carries them out against real sessions.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::SubscriptionKey;
use crate::domain::connection::ConnectionId;

/// Where a newly assigned key was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Connection now serving the key.
    pub connection: ConnectionId,
    /// Whether the connection was created for this placement.
    pub is_new: bool,
}

/// Result of releasing a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    /// Connection that served the key.
    pub connection: ConnectionId,
    /// Whether the connection serves nothing anymore and was dropped.
    pub now_empty: bool,
}

/// A key moving from an over-limit connection.
///
/// Carried out make-before-break: subscribe on `to`, then unsubscribe `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Key being moved.
    pub key: SubscriptionKey,
    /// Over-limit source connection.
    pub from: ConnectionId,
    /// Target connection.
    pub to: ConnectionId,
    /// Whether the target was created by this rebalance.
    pub to_is_new: bool,
}

#[derive(Debug)]
struct Slot {
    exchange: String,
    keys: BTreeSet<SubscriptionKey>,
}

/// Logical-to-physical subscription map.
#[derive(Debug)]
pub struct AssignmentTable {
    limits: HashMap<String, usize>,
    default_limit: usize,
    by_key: HashMap<SubscriptionKey, ConnectionId>,
    by_conn: BTreeMap<ConnectionId, Slot>,
    next_id: ConnectionId,
}

impl AssignmentTable {
    /// Create a table with a default per-connection limit.
    #[must_use]
    pub fn new(default_limit: usize) -> Self {
        Self {
            limits: HashMap::new(),
            default_limit: default_limit.max(1),
            by_key: HashMap::new(),
            by_conn: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Override the limit for one exchange. Takes effect on the next
    /// assignment or [`Self::rebalance`].
    pub fn set_limit(&mut self, exchange: impl Into<String>, limit: usize) {
        self.limits.insert(exchange.into(), limit.max(1));
    }

    /// Per-connection limit for an exchange.
    #[must_use]
    pub fn limit_for(&self, exchange: &str) -> usize {
        self.limits.get(exchange).copied().unwrap_or(self.default_limit)
    }

    /// Assign a key to the least-loaded connection with room, creating one
    /// if every connection is full.
    ///
    /// Returns `None` if the key is already assigned.
    pub fn assign(&mut self, key: SubscriptionKey) -> Option<Placement> {
        if self.by_key.contains_key(&key) {
            return None;
        }

        let exchange = key.exchange().to_string();
        let (connection, is_new) = match self.least_loaded_with_room(&exchange, None) {
            Some(id) => (id, false),
            None => (self.open_slot(exchange), true),
        };

        self.insert(connection, key);
        Some(Placement { connection, is_new })
    }

    /// Release a key.
    ///
    /// Returns `None` if the key was not assigned. Empty connections are
    /// dropped from the table.
    pub fn release(&mut self, key: &SubscriptionKey) -> Option<Release> {
        let connection = self.by_key.remove(key)?;
        let now_empty = match self.by_conn.get_mut(&connection) {
            Some(slot) => {
                slot.keys.remove(key);
                slot.keys.is_empty()
            }
            None => true,
        };
        if now_empty {
            self.by_conn.remove(&connection);
        }
        Some(Release {
            connection,
            now_empty,
        })
    }

    /// Move excess keys off every over-limit connection.
    ///
    /// The table reflects the target layout when this returns.
    pub fn rebalance(&mut self) -> Vec<Migration> {
        let over: Vec<(ConnectionId, usize)> = self
            .by_conn
            .iter()
            .filter_map(|(id, slot)| {
                let limit = self.limit_for(&slot.exchange);
                (slot.keys.len() > limit).then(|| (*id, slot.keys.len() - limit))
            })
            .collect();

        let mut migrations = Vec::new();
        for (from, excess) in over {
            let Some(slot) = self.by_conn.get(&from) else {
                continue;
            };
            let exchange = slot.exchange.clone();
            let moving: Vec<SubscriptionKey> = slot.keys.iter().rev().take(excess).cloned().collect();

            for key in moving {
                let (to, to_is_new) = match self.least_loaded_with_room(&exchange, Some(from)) {
                    Some(id) => (id, false),
                    None => (self.open_slot(exchange.clone()), true),
                };
                if let Some(slot) = self.by_conn.get_mut(&from) {
                    slot.keys.remove(&key);
                }
                self.insert(to, key.clone());
                migrations.push(Migration {
                    key,
                    from,
                    to,
                    to_is_new,
                });
            }
        }
        migrations
    }

    /// Put a migrated key back on its source connection.
    ///
    /// Used when the target never confirmed the subscription. Returns the
    /// target's release, or `None` if the key is no longer on the target or
    /// the source is gone.
    pub fn revert(&mut self, migration: &Migration) -> Option<Release> {
        if self.by_key.get(&migration.key) != Some(&migration.to) {
            return None;
        }
        self.by_conn
            .get_mut(&migration.from)?
            .keys
            .insert(migration.key.clone());
        self.by_key.insert(migration.key.clone(), migration.from);

        let now_empty = match self.by_conn.get_mut(&migration.to) {
            Some(slot) => {
                slot.keys.remove(&migration.key);
                slot.keys.is_empty()
            }
            None => true,
        };
        if now_empty {
            self.by_conn.remove(&migration.to);
        }
        Some(Release {
            connection: migration.to,
            now_empty,
        })
    }

    /// Connection serving a key.
    #[must_use]
    pub fn connection_of(&self, key: &SubscriptionKey) -> Option<ConnectionId> {
        self.by_key.get(key).copied()
    }

    /// Keys served by a connection, in stable order.
    #[must_use]
    pub fn keys_on(&self, connection: ConnectionId) -> Vec<SubscriptionKey> {
        self.by_conn
            .get(&connection)
            .map(|slot| slot.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of keys on a connection.
    #[must_use]
    pub fn load(&self, connection: ConnectionId) -> usize {
        self.by_conn.get(&connection).map_or(0, |slot| slot.keys.len())
    }

    /// Exchange a connection belongs to.
    #[must_use]
    pub fn exchange_of(&self, connection: ConnectionId) -> Option<&str> {
        self.by_conn.get(&connection).map(|slot| slot.exchange.as_str())
    }

    /// Every connection id with its load.
    #[must_use]
    pub fn connections(&self) -> Vec<(ConnectionId, usize)> {
        self.by_conn
            .iter()
            .map(|(id, slot)| (*id, slot.keys.len()))
            .collect()
    }

    /// Total assigned keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether nothing is assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn least_loaded_with_room(
        &self,
        exchange: &str,
        exclude: Option<ConnectionId>,
    ) -> Option<ConnectionId> {
        let limit = self.limit_for(exchange);
        self.by_conn
            .iter()
            .filter(|(id, slot)| {
                Some(**id) != exclude && slot.exchange == exchange && slot.keys.len() < limit
            })
            .min_by_key(|(id, slot)| (slot.keys.len(), **id))
            .map(|(id, _)| *id)
    }

    fn open_slot(&mut self, exchange: String) -> ConnectionId {
        let id = self.next_id;
        self.next_id += 1;
        self.by_conn.insert(
            id,
            Slot {
                exchange,
                keys: BTreeSet::new(),
            },
        );
        id
    }

    fn insert(&mut self, connection: ConnectionId, key: SubscriptionKey) {
        if let Some(slot) = self.by_conn.get_mut(&connection) {
            slot.keys.insert(key.clone());
        }
        self.by_key.insert(key, connection);
    }
}

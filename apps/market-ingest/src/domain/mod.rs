//! Domain Layer - Core business logic and types.
//!
//! Pure types with no I/O: instruments and payloads, subscription
//! bookkeeping, connection health, and cache keys, entries, TTLs and
//! dependencies.

/// Symbols, payload schemas, validation, and consumer snapshots.
pub mod market;

/// Consumer interest and connection assignment.
pub mod subscription;

/// Connection health state machine.
pub mod connection;

/// Cache keys, entries, TTL hierarchy, and dependency graph.
pub mod cache;

//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and the port interfaces
//! through which they reach cache stores and exchanges.

/// Port interfaces for cache tiers and exchange access.
pub mod ports;

/// Application services for caching, subscriptions and ingestion.
pub mod services;

//! Cache Tier Adapters
//!
//! - [`MemoryTier`]: moka-backed in-process store with per-entry expiry.
//!   Always the hot tier; also usable as a warm or durable backend for a
//!   single-instance deployment.
//! - [`RedisTier`]: shared store over a Redis connection manager, used for
//!   the warm and durable tiers.

mod memory;
mod redis_tier;

pub use memory::MemoryTier;
pub use redis_tier::RedisTier;

//! Cache Domain
//!
//! Keys, stored entries, the TTL hierarchy and the dependency graph. The
//! coordinator in the application layer composes these with the tier
//! adapters.

pub mod dependency;
pub mod entry;
pub mod key;
pub mod ttl;

pub use dependency::{DependencyError, DependencyGraph};
pub use entry::{CacheEntry, CacheWrite, TierLevel};
pub use key::{Bucket, CacheKey, KeyDomain, KeyNamespace};
pub use ttl::{TtlPolicy, TtlPolicyError};

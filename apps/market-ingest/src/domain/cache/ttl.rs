//! Hierarchical TTL
//!
//! `ttl(class, depth) = base(class) + depth * step`. A derived key is
//! additionally floored at `max(dependency ttl) + step`, so it always
//! outlives everything it was computed from, even when its class base is
//! shorter than a dependency's.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::domain::market::DataClass;

/// Invalid TTL configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TtlPolicyError {
    /// Depth step must be positive.
    #[error("dependency depth step must be greater than zero")]
    ZeroStep,
    /// Base TTL must be positive.
    #[error("base ttl for '{0}' must be greater than zero")]
    ZeroBase(DataClass),
}

/// Per-class base TTLs plus the per-depth increment.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    base: BTreeMap<DataClass, Duration>,
    fallback: Duration,
    depth_step: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        let base = BTreeMap::from([
            (DataClass::Ticker, Duration::from_secs(30)),
            (DataClass::OrderBook, Duration::from_secs(10)),
            (DataClass::Trade, Duration::from_secs(60)),
            (DataClass::OpenInterest, Duration::from_secs(300)),
            (DataClass::Derived, Duration::from_secs(120)),
        ]);
        Self {
            base,
            fallback: Duration::from_secs(60),
            depth_step: Duration::from_secs(30),
        }
    }
}

impl TtlPolicy {
    /// Create a policy.
    ///
    /// Classes missing from `base` use `fallback`.
    ///
    /// # Errors
    ///
    /// Returns [`TtlPolicyError`] for a zero step or zero base.
    pub fn new(
        base: impl IntoIterator<Item = (DataClass, Duration)>,
        fallback: Duration,
        depth_step: Duration,
    ) -> Result<Self, TtlPolicyError> {
        if depth_step.is_zero() {
            return Err(TtlPolicyError::ZeroStep);
        }
        let base: BTreeMap<_, _> = base.into_iter().collect();
        if let Some((class, _)) = base.iter().find(|(_, ttl)| ttl.is_zero()) {
            return Err(TtlPolicyError::ZeroBase(*class));
        }
        if fallback.is_zero() {
            return Err(TtlPolicyError::ZeroBase(DataClass::Derived));
        }
        Ok(Self {
            base,
            fallback,
            depth_step,
        })
    }

    /// Base TTL of a class.
    #[must_use]
    pub fn base(&self, data_class: DataClass) -> Duration {
        self.base.get(&data_class).copied().unwrap_or(self.fallback)
    }

    /// Per-depth increment.
    #[must_use]
    pub const fn depth_step(&self) -> Duration {
        self.depth_step
    }

    /// `base(class) + depth * step`.
    #[must_use]
    pub fn ttl(&self, data_class: DataClass, depth: u32) -> Duration {
        self.base(data_class)
            .saturating_add(self.depth_step.saturating_mul(depth))
    }

    /// TTL for a key whose direct dependencies currently hold `dependency_ttls`.
    ///
    /// Strictly greater than every element of `dependency_ttls`.
    #[must_use]
    pub fn ttl_for(
        &self,
        data_class: DataClass,
        depth: u32,
        dependency_ttls: impl IntoIterator<Item = Duration>,
    ) -> Duration {
        let hierarchical = self.ttl(data_class, depth);
        dependency_ttls
            .into_iter()
            .max()
            .map_or(hierarchical, |longest| {
                hierarchical.max(longest.saturating_add(self.depth_step))
            })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn depth_increases_ttl() {
        let policy = TtlPolicy::default();
        assert!(policy.ttl(DataClass::Derived, 2) > policy.ttl(DataClass::Derived, 1));
    }

    #[test]
    fn dependency_floor_applies_across_classes() {
        let policy = TtlPolicy::new(
            [
                (DataClass::OpenInterest, Duration::from_secs(600)),
                (DataClass::Derived, Duration::from_secs(10)),
            ],
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .unwrap();

        // Depth-1 derived value from a 600s open-interest key.
        let ttl = policy.ttl_for(DataClass::Derived, 1, [Duration::from_secs(600)]);
        assert_eq!(ttl, Duration::from_secs(605));
    }

    #[test]
    fn rejects_zero_step_and_base() {
        assert_eq!(
            TtlPolicy::new(Vec::new(), Duration::from_secs(1), Duration::ZERO).unwrap_err(),
            TtlPolicyError::ZeroStep
        );
        assert!(
            TtlPolicy::new(
                [(DataClass::Trade, Duration::ZERO)],
                Duration::from_secs(1),
                Duration::from_secs(1)
            )
            .is_err()
        );
    }

    proptest! {
        #[test]
        fn derived_ttl_exceeds_every_dependency(
            step in 1u64..120,
            base in 1u64..3_600,
            depth in 0u32..8,
            deps in proptest::collection::vec(1u64..100_000, 0..6),
        ) {
            let policy = TtlPolicy::new(
                [(DataClass::Derived, Duration::from_secs(base))],
                Duration::from_secs(60),
                Duration::from_secs(step),
            ).unwrap();
            let deps: Vec<Duration> = deps.into_iter().map(Duration::from_secs).collect();
            let ttl = policy.ttl_for(DataClass::Derived, depth, deps.iter().copied());
            for dep in deps {
                prop_assert!(ttl > dep);
            }
        }
    }
}

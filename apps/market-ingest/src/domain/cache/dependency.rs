//! Dependency Graph
//!
//! Directed edges "A is derived from B", kept as forward and reverse
//! adjacency maps. Used for TTL depth and cascade invalidation only; values
//! are never computed from it. The graph is acyclic: edges that would close
//! a cycle are rejected.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use super::key::CacheKey;

/// Rejected edge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    /// A key cannot depend on itself.
    #[error("key '{0}' cannot depend on itself")]
    SelfReference(String),
    /// Edge would create a cycle.
    #[error("dependency '{dependency}' of '{key}' would create a cycle")]
    Cycle {
        /// Dependent key.
        key: String,
        /// Dependency that already depends on `key`.
        dependency: String,
    },
}

/// Acyclic key dependency graph.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    depends_on: HashMap<CacheKey, HashSet<CacheKey>>,
    dependents: HashMap<CacheKey, HashSet<CacheKey>>,
}

impl DependencyGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the direct dependencies of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError`] and leaves the graph unchanged if any edge
    /// is a self-reference or would close a cycle.
    pub fn set_dependencies(
        &mut self,
        key: &CacheKey,
        dependencies: &[CacheKey],
    ) -> Result<(), DependencyError> {
        for dependency in dependencies {
            if dependency == key {
                return Err(DependencyError::SelfReference(key.render()));
            }
            if self.reaches(dependency, key) {
                return Err(DependencyError::Cycle {
                    key: key.render(),
                    dependency: dependency.render(),
                });
            }
        }

        self.detach_forward(key);
        if dependencies.is_empty() {
            return Ok(());
        }

        let forward: HashSet<CacheKey> = dependencies.iter().cloned().collect();
        for dependency in &forward {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(key.clone());
        }
        self.depends_on.insert(key.clone(), forward);
        Ok(())
    }

    /// Direct dependencies of `key`.
    #[must_use]
    pub fn dependencies_of(&self, key: &CacheKey) -> Vec<CacheKey> {
        self.depends_on
            .get(key)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Longest dependency chain below `key`; 0 for a leaf.
    #[must_use]
    pub fn depth(&self, key: &CacheKey) -> u32 {
        let mut memo = HashMap::new();
        self.depth_memo(key, &mut memo)
    }

    fn depth_memo<'a>(&'a self, key: &'a CacheKey, memo: &mut HashMap<&'a CacheKey, u32>) -> u32 {
        if let Some(depth) = memo.get(key) {
            return *depth;
        }
        let depth = self.depends_on.get(key).map_or(0, |deps| {
            deps.iter()
                .map(|dep| self.depth_memo(dep, memo))
                .max()
                .map_or(0, |d| d + 1)
        });
        memo.insert(key, depth);
        depth
    }

    /// Every key transitively derived from `key`, breadth-first, excluding `key`.
    #[must_use]
    pub fn dependents_bfs(&self, key: &CacheKey) -> Vec<CacheKey> {
        let mut seen: HashSet<&CacheKey> = HashSet::from([key]);
        let mut queue: VecDeque<&CacheKey> = VecDeque::from([key]);
        let mut order = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(children) = self.dependents.get(current) else {
                continue;
            };
            for child in children {
                if seen.insert(child) {
                    order.push(child.clone());
                    queue.push_back(child);
                }
            }
        }
        order
    }

    /// Drop `key` and every edge touching it.
    pub fn remove(&mut self, key: &CacheKey) {
        self.detach_forward(key);
        if let Some(children) = self.dependents.remove(key) {
            for child in children {
                if let Some(deps) = self.depends_on.get_mut(&child) {
                    deps.remove(key);
                    if deps.is_empty() {
                        self.depends_on.remove(&child);
                    }
                }
            }
        }
    }

    /// Number of keys with at least one dependency.
    #[must_use]
    pub fn len(&self) -> usize {
        self.depends_on.len()
    }

    /// Whether the graph has no edges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.depends_on.is_empty()
    }

    fn detach_forward(&mut self, key: &CacheKey) {
        let Some(previous) = self.depends_on.remove(key) else {
            return;
        };
        for dependency in previous {
            if let Some(children) = self.dependents.get_mut(&dependency) {
                children.remove(key);
                if children.is_empty() {
                    self.dependents.remove(&dependency);
                }
            }
        }
    }

    /// Whether `to` is reachable from `from` along depends-on edges.
    fn reaches(&self, from: &CacheKey, to: &CacheKey) -> bool {
        let mut seen: HashSet<&CacheKey> = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(deps) = self.depends_on.get(current) {
                stack.extend(deps.iter());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cache::key::{Bucket, KeyNamespace};
    use crate::domain::market::{DataClass, Symbol};

    fn key(metric: &str) -> CacheKey {
        let ns = KeyNamespace::new("mi", 1).unwrap();
        let symbol = Symbol::new("bybit", "BTCUSDT").unwrap();
        if metric == "ticker" {
            CacheKey::latest(&ns, symbol, DataClass::Ticker)
        } else {
            CacheKey::derived(&ns, metric, symbol, Bucket::Latest).unwrap()
        }
    }

    #[test]
    fn depth_follows_longest_chain() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&key("a"), &[key("ticker")]).unwrap();
        graph.set_dependencies(&key("b"), &[key("a"), key("ticker")]).unwrap();

        assert_eq!(graph.depth(&key("ticker")), 0);
        assert_eq!(graph.depth(&key("a")), 1);
        assert_eq!(graph.depth(&key("b")), 2);
    }

    #[test]
    fn bfs_visits_transitive_dependents_once() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&key("a"), &[key("ticker")]).unwrap();
        graph.set_dependencies(&key("b"), &[key("ticker")]).unwrap();
        graph.set_dependencies(&key("c"), &[key("a"), key("b")]).unwrap();

        let order = graph.dependents_bfs(&key("ticker"));
        assert_eq!(order.len(), 3);
        assert_eq!(order.last(), Some(&key("c")));
    }

    #[test]
    fn rejects_cycles_and_self_edges() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&key("a"), &[key("b")]).unwrap();
        graph.set_dependencies(&key("b"), &[key("c")]).unwrap();

        assert!(matches!(
            graph.set_dependencies(&key("c"), &[key("a")]),
            Err(DependencyError::Cycle { .. })
        ));
        assert!(matches!(
            graph.set_dependencies(&key("a"), &[key("a")]),
            Err(DependencyError::SelfReference(_))
        ));
        assert_eq!(graph.dependencies_of(&key("a")), vec![key("b")]);
    }

    #[test]
    fn replacing_dependencies_drops_old_edges() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&key("a"), &[key("ticker")]).unwrap();
        graph.set_dependencies(&key("a"), &[key("b")]).unwrap();
        assert!(graph.dependents_bfs(&key("ticker")).is_empty());
        assert_eq!(graph.dependents_bfs(&key("b")), vec![key("a")]);
    }

    #[test]
    fn remove_detaches_both_directions() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&key("a"), &[key("ticker")]).unwrap();
        graph.remove(&key("ticker"));
        assert_eq!(graph.depth(&key("a")), 0);
        assert!(graph.is_empty());
    }
}

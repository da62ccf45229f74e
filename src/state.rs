//! Versions of a store's state.

use std::fmt;
use std::sync::Arc;

use ahash::HashSet;
use parking_lot::RwLock;

use crate::key::{NodeKey, Value};
use crate::loadable::Loadable;
use crate::version_map::VersionMap;

/// Monotonically increasing version identifier.
///
/// Ids are allocated by the [`Engine`](crate::Engine), so they are unique
/// across every store that shares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VersionId(pub u64);

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A shared handle on one version.
pub type Version = Arc<TreeState>;

/// The state of a store at one version.
///
/// Source values and dirty keys only change while the version is the store's
/// pending next version. Settled derived values may be cached into any version
/// at any time, since they are a pure function of the version's sources.
pub struct TreeState {
    version: VersionId,
    values: RwLock<VersionMap<Loadable>>,
    dirty: RwLock<HashSet<NodeKey>>,
    nonvalidated: RwLock<VersionMap<Value>>,
}

impl TreeState {
    /// An empty version.
    pub fn new(version: VersionId) -> Self {
        Self {
            version,
            values: RwLock::new(VersionMap::new()),
            dirty: RwLock::new(HashSet::default()),
            nonvalidated: RwLock::new(VersionMap::new()),
        }
    }

    /// A copy of this version under a new id, with no dirty keys.
    pub fn successor(&self, version: VersionId) -> Self {
        Self {
            version,
            values: RwLock::new(self.values.read().clone()),
            dirty: RwLock::new(HashSet::default()),
            nonvalidated: RwLock::new(self.nonvalidated.read().clone()),
        }
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    /// The container stored for `key` in this version.
    pub fn value(&self, key: &NodeKey) -> Option<Loadable> {
        self.values.read().get(key).cloned()
    }

    pub fn has_value(&self, key: &NodeKey) -> bool {
        self.values.read().contains(key)
    }

    /// Store a container, returning the one it replaced.
    pub fn set_value(&self, key: NodeKey, value: Loadable) -> Option<Loadable> {
        self.values.write().set(key, value)
    }

    pub fn remove_value(&self, key: &NodeKey) -> Option<Loadable> {
        self.values.write().delete(key)
    }

    /// A cheap copy of every stored container.
    pub fn values(&self) -> VersionMap<Loadable> {
        self.values.read().clone()
    }

    pub fn mark_dirty(&self, key: NodeKey) {
        self.dirty.write().insert(key);
    }

    pub fn is_dirty(&self, key: &NodeKey) -> bool {
        self.dirty.read().contains(key)
    }

    /// Keys written since the previous version.
    pub fn dirty_keys(&self) -> HashSet<NodeKey> {
        self.dirty.read().clone()
    }

    /// A raw value that has not been validated yet.
    pub fn nonvalidated(&self, key: &NodeKey) -> Option<Value> {
        self.nonvalidated.read().get(key).cloned()
    }

    pub fn set_nonvalidated(&self, key: NodeKey, value: Value) {
        self.nonvalidated.write().set(key, value);
    }

    pub fn remove_nonvalidated(&self, key: &NodeKey) -> Option<Value> {
        self.nonvalidated.write().delete(key)
    }
}

impl fmt::Debug for TreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeState")
            .field("version", &self.version)
            .field("values", &*self.values.read())
            .field("dirty", &*self.dirty.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successor_copies_values_not_dirty() {
        let first = TreeState::new(VersionId(1));
        first.set_value(NodeKey::from("a"), Loadable::resolved(1));
        first.mark_dirty(NodeKey::from("a"));
        first.set_nonvalidated(NodeKey::from("b"), Value::new(2));

        let second = first.successor(VersionId(2));
        assert_eq!(second.version(), VersionId(2));
        assert!(second.has_value(&NodeKey::from("a")));
        assert!(second.nonvalidated(&NodeKey::from("b")).is_some());
        assert!(second.dirty_keys().is_empty());

        second.remove_value(&NodeKey::from("a"));
        assert!(first.has_value(&NodeKey::from("a")));
    }
}

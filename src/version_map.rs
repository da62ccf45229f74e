//! Persistent key to value map shared between versions.

use std::fmt;

use crate::key::NodeKey;

/// A persistent map from node keys to per-version values.
///
/// Cloning is O(1) and the clone shares every entry with the original;
/// subsequent writes to either copy only the touched path.
#[derive(Clone)]
pub struct VersionMap<V: Clone> {
    entries: im::HashMap<NodeKey, V>,
}

impl<V: Clone> Default for VersionMap<V> {
    fn default() -> Self {
        Self {
            entries: im::HashMap::new(),
        }
    }
}

impl<V: Clone> VersionMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &NodeKey) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace, returning the previous value.
    pub fn set(&mut self, key: NodeKey, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    pub fn delete(&mut self, key: &NodeKey) -> Option<V> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeKey, &V)> {
        self.entries.iter()
    }
}

impl<V: Clone + fmt::Debug> fmt::Debug for VersionMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

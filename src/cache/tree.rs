//! Route-keyed decision trie.
//!
//! A route is the ordered list of `(dependency key, dependency value)` pairs a
//! derivation read. Each branch of the trie is keyed by one dependency and
//! fans out on that dependency's value; each leaf holds one cached result.
//! Looking a result up only needs a way to ask "what is dependency X now",
//! which is how derivations with data-dependent dependencies stay memoizable.

use std::hash::{Hash, Hasher};

use ahash::HashMap;
use parking_lot::Mutex;
use slab::Slab;

use super::{Cache, Equality, KeyMapper, LruCache, ValueKey};
use crate::error::NodeError;
use crate::key::NodeKey;
use crate::loadable::Loadable;

/// Handle on a node of a [`TreeCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrieNodeId(usize);

/// The value a branch fans out on, mapped through the equality policy.
#[derive(Debug, Clone)]
pub enum RouteValue {
    Value(ValueKey),
    /// Errors always compare by identity.
    Error(NodeError),
    /// Pending dependencies compare by pending id.
    Pending(u64),
}

impl RouteValue {
    pub fn from_loadable(loadable: &Loadable, equality: Equality) -> Self {
        match loadable {
            Loadable::Resolved(value) => RouteValue::Value(equality.map_key(value)),
            Loadable::Errored(error) => RouteValue::Error(error.clone()),
            Loadable::Pending(pending) => RouteValue::Pending(pending.id()),
        }
    }
}

impl PartialEq for RouteValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RouteValue::Value(a), RouteValue::Value(b)) => a == b,
            (RouteValue::Error(a), RouteValue::Error(b)) => a.same_as(b),
            (RouteValue::Pending(a), RouteValue::Pending(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for RouteValue {}

impl Hash for RouteValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            RouteValue::Value(v) => v.hash(state),
            RouteValue::Error(e) => e.hash_identity(state),
            RouteValue::Pending(id) => id.hash(state),
        }
    }
}

type ParentLink = Option<(usize, RouteValue)>;

enum TrieNode<T> {
    Branch {
        dep_key: NodeKey,
        children: HashMap<RouteValue, usize>,
        parent: ParentLink,
    },
    Leaf {
        value: T,
        parent: ParentLink,
    },
}

impl<T> TrieNode<T> {
    fn parent(&self) -> &ParentLink {
        match self {
            TrieNode::Branch { parent, .. } | TrieNode::Leaf { parent, .. } => parent,
        }
    }
}

/// A route contradicted the shape of the trie.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("route changed at depth {depth}: cached {cached:?}, written {written:?}")]
pub struct ChangedPath {
    pub depth: usize,
    /// Dependency key recorded in the trie, `None` where a leaf sits.
    pub cached: Option<NodeKey>,
    /// Dependency key in the written route, `None` past its end.
    pub written: Option<NodeKey>,
}

/// Outcome of a successful [`TreeCache::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inserted {
    pub leaf: TrieNodeId,
    /// Set when a changed path forced the trie to be cleared first.
    pub reset: Option<ChangedPath>,
}

/// Position reached while walking the trie.
///
/// Cursors go stale when nodes are removed; a stale cursor only ever yields
/// [`TrieStep::Miss`].
#[derive(Debug, Clone, Copy)]
pub struct TrieCursor {
    node: Option<usize>,
    generation: u64,
}

/// What a cursor points at.
#[derive(Debug)]
pub enum TrieStep<'a, T> {
    /// A branch asking for the value of this dependency.
    Branch(&'a NodeKey),
    /// A cached result.
    Leaf(&'a T),
    Miss,
}

/// Route-keyed cache of derivation results.
pub struct TreeCache<T> {
    nodes: Slab<TrieNode<T>>,
    root: Option<usize>,
    generation: u64,
    equality: Equality,
    lru: Option<LruCache<usize, ()>>,
    leaves: usize,
}

impl<T> TreeCache<T> {
    /// An empty trie. With `max_leaves`, the least recently used leaf is
    /// deleted once the bound is exceeded.
    pub fn new(equality: Equality, max_leaves: Option<usize>) -> Self {
        Self {
            nodes: Slab::new(),
            root: None,
            generation: 0,
            equality,
            lru: max_leaves.map(LruCache::new),
            leaves: 0,
        }
    }

    pub fn equality(&self) -> Equality {
        self.equality
    }

    /// The root node, `None` when empty.
    pub fn root(&self) -> Option<TrieNodeId> {
        self.root.map(TrieNodeId)
    }

    /// Number of leaves.
    pub fn size(&self) -> usize {
        self.leaves
    }

    /// The value of a leaf.
    pub fn leaf(&self, id: TrieNodeId) -> Option<&T> {
        match self.nodes.get(id.0) {
            Some(TrieNode::Leaf { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// A cursor at the root.
    pub fn cursor(&self) -> TrieCursor {
        TrieCursor {
            node: self.root,
            generation: self.generation,
        }
    }

    pub fn inspect(&self, cursor: &TrieCursor) -> TrieStep<'_, T> {
        if cursor.generation != self.generation {
            return TrieStep::Miss;
        }
        match cursor.node.and_then(|id| self.nodes.get(id)) {
            Some(TrieNode::Branch { dep_key, .. }) => TrieStep::Branch(dep_key),
            Some(TrieNode::Leaf { value, .. }) => TrieStep::Leaf(value),
            None => TrieStep::Miss,
        }
    }

    /// Follow the child of the branch under `cursor` matching `value`.
    pub fn descend(&self, cursor: &TrieCursor, value: &Loadable) -> TrieCursor {
        let node = match cursor.node.and_then(|id| self.nodes.get(id)) {
            Some(TrieNode::Branch { children, .. }) if cursor.generation == self.generation => {
                children
                    .get(&RouteValue::from_loadable(value, self.equality))
                    .copied()
            }
            _ => None,
        };
        TrieCursor {
            node,
            generation: cursor.generation,
        }
    }

    /// Count a hit on the leaf under `cursor` for eviction purposes.
    pub fn touch(&mut self, cursor: &TrieCursor) {
        if cursor.generation != self.generation {
            return;
        }
        if let (Some(lru), Some(id)) = (&mut self.lru, cursor.node) {
            lru.touch(&id);
        }
    }

    /// Walk from the root, asking `resolve` for the value of each branch's
    /// dependency, and return the leaf reached.
    ///
    /// `visit` sees every dependency consulted on the way.
    pub fn get(
        &mut self,
        mut resolve: impl FnMut(&NodeKey) -> Loadable,
        mut visit: impl FnMut(&NodeKey, &Loadable),
    ) -> Option<&T> {
        let mut cursor = self.cursor();
        loop {
            let key = match self.inspect(&cursor) {
                TrieStep::Branch(key) => key.clone(),
                TrieStep::Leaf(_) => break,
                TrieStep::Miss => return None,
            };
            let value = resolve(&key);
            visit(&key, &value);
            cursor = self.descend(&cursor, &value);
        }
        self.touch(&cursor);
        match self.inspect(&cursor) {
            TrieStep::Leaf(value) => Some(value),
            _ => None,
        }
    }

    /// Install `value` at the end of `route`, overwriting an existing leaf.
    ///
    /// If the route contradicts the trie the whole trie is cleared and the
    /// insertion retried once; a second contradiction is returned.
    pub fn set(&mut self, route: &[(NodeKey, Loadable)], value: T) -> Result<Inserted, ChangedPath> {
        let (leaf, reset) = match self.try_set(route, value) {
            Ok(leaf) => (leaf, None),
            Err((changed, value)) => {
                self.clear();
                match self.try_set(route, value) {
                    Ok(leaf) => (leaf, Some(changed)),
                    Err((changed, _)) => return Err(changed),
                }
            }
        };

        let evicted = match &mut self.lru {
            Some(lru) => lru.insert(leaf, ()).map(|(id, ())| id),
            None => None,
        };
        if let Some(evicted) = evicted {
            self.delete(TrieNodeId(evicted));
        }

        Ok(Inserted {
            leaf: TrieNodeId(leaf),
            reset,
        })
    }

    fn try_set(&mut self, route: &[(NodeKey, Loadable)], value: T) -> Result<usize, (ChangedPath, T)> {
        let mut parent: ParentLink = None;
        let mut current = self.root;

        for (depth, (key, loadable)) in route.iter().enumerate() {
            let route_value = RouteValue::from_loadable(loadable, self.equality);
            let id = match current {
                Some(id) => id,
                None => {
                    let id = self.nodes.insert(TrieNode::Branch {
                        dep_key: key.clone(),
                        children: HashMap::default(),
                        parent: parent.clone(),
                    });
                    self.attach(&parent, id);
                    id
                }
            };

            match &self.nodes[id] {
                TrieNode::Branch {
                    dep_key, children, ..
                } => {
                    if dep_key != key {
                        let changed = ChangedPath {
                            depth,
                            cached: Some(dep_key.clone()),
                            written: Some(key.clone()),
                        };
                        return Err((changed, value));
                    }
                    current = children.get(&route_value).copied();
                }
                TrieNode::Leaf { .. } => {
                    let changed = ChangedPath {
                        depth,
                        cached: None,
                        written: Some(key.clone()),
                    };
                    return Err((changed, value));
                }
            }
            parent = Some((id, route_value));
        }

        match current {
            Some(id) => match &mut self.nodes[id] {
                TrieNode::Leaf { value: slot, .. } => {
                    *slot = value;
                    Ok(id)
                }
                TrieNode::Branch { dep_key, .. } => {
                    let changed = ChangedPath {
                        depth: route.len(),
                        cached: Some(dep_key.clone()),
                        written: None,
                    };
                    Err((changed, value))
                }
            },
            None => {
                let id = self.nodes.insert(TrieNode::Leaf {
                    value,
                    parent: parent.clone(),
                });
                self.attach(&parent, id);
                self.leaves += 1;
                Ok(id)
            }
        }
    }

    fn attach(&mut self, parent: &ParentLink, child: usize) {
        match parent {
            Some((id, route_value)) => {
                if let Some(TrieNode::Branch { children, .. }) = self.nodes.get_mut(*id) {
                    children.insert(route_value.clone(), child);
                }
            }
            None => self.root = Some(child),
        }
    }

    /// Remove a leaf and prune the branches it leaves empty.
    ///
    /// Returns whether a leaf was removed.
    pub fn delete(&mut self, leaf: TrieNodeId) -> bool {
        if !matches!(self.nodes.get(leaf.0), Some(TrieNode::Leaf { .. })) {
            return false;
        }
        let removed = self.nodes.remove(leaf.0);
        self.leaves -= 1;
        self.generation += 1;
        if let Some(lru) = &mut self.lru {
            lru.remove(&leaf.0);
        }

        let mut parent = removed.parent().clone();
        loop {
            let Some((id, route_value)) = parent else {
                self.root = None;
                break;
            };
            let now_empty = match self.nodes.get_mut(id) {
                Some(TrieNode::Branch { children, .. }) => {
                    children.remove(&route_value);
                    children.is_empty()
                }
                _ => false,
            };
            if !now_empty {
                break;
            }
            parent = self.nodes.remove(id).parent().clone();
        }
        true
    }

    /// Drop every node.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = None;
        self.leaves = 0;
        self.generation += 1;
        if let Some(lru) = &mut self.lru {
            lru.clear();
        }
    }
}

impl<T: Clone> TreeCache<T> {
    /// Look up through a shared trie without holding the lock while
    /// dependencies are resolved.
    ///
    /// `resolve` may itself read (and populate) other tries or this one; a
    /// concurrent removal turns the lookup into a miss.
    pub fn get_shared<E>(
        cache: &Mutex<Self>,
        mut resolve: impl FnMut(&NodeKey) -> Result<Loadable, E>,
        mut visit: impl FnMut(&NodeKey, &Loadable),
    ) -> Result<Option<T>, E> {
        let mut cursor = cache.lock().cursor();
        loop {
            let key = {
                let mut cache = cache.lock();
                match cache.inspect(&cursor) {
                    TrieStep::Branch(key) => key.clone(),
                    TrieStep::Leaf(value) => {
                        let value = value.clone();
                        cache.touch(&cursor);
                        return Ok(Some(value));
                    }
                    TrieStep::Miss => return Ok(None),
                }
            };
            let loadable = resolve(&key)?;
            visit(&key, &loadable);
            cursor = cache.lock().descend(&cursor, &loadable);
        }
    }
}

impl<T> std::fmt::Debug for TreeCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCache")
            .field("equality", &self.equality)
            .field("leaves", &self.leaves)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Value;

    fn k(s: &str) -> NodeKey {
        NodeKey::from(s)
    }

    #[test]
    fn test_route_lookup() {
        let v1 = Loadable::resolved(1);
        let v2 = Loadable::resolved(2);
        let mut cache = TreeCache::new(Equality::Reference, None);
        cache
            .set(&[(k("k1"), v1.clone()), (k("k2"), v2.clone())], "leaf1")
            .unwrap();

        let resolve = |key: &NodeKey| if key.as_str() == "k1" { v1.clone() } else { v2.clone() };
        assert_eq!(cache.get(resolve, |_, _| {}), Some(&"leaf1"));

        let other = Loadable::resolved(2);
        let resolve = |key: &NodeKey| if key.as_str() == "k1" { v1.clone() } else { other.clone() };
        assert_eq!(cache.get(resolve, |_, _| {}), None);
    }

    #[test]
    fn test_visit_sees_route_in_order() {
        let v = Loadable::resolved("x");
        let mut cache = TreeCache::new(Equality::Reference, None);
        cache.set(&[(k("a"), v.clone()), (k("b"), v.clone())], 1).unwrap();

        let mut visited = Vec::new();
        cache.get(|_| v.clone(), |key, _| visited.push(key.to_string()));
        assert_eq!(visited, vec!["a", "b"]);
    }

    #[test]
    fn test_size_counts_leaves() {
        let a1 = Loadable::resolved(1);
        let a2 = Loadable::resolved(2);
        let b = Loadable::resolved(3);
        let mut cache = TreeCache::new(Equality::Reference, None);
        cache.set(&[(k("a"), a1.clone()), (k("b"), b.clone())], 1).unwrap();
        cache.set(&[(k("a"), a2.clone()), (k("b"), b.clone())], 2).unwrap();
        cache.set(&[(k("a"), a2.clone()), (k("b"), b.clone())], 3).unwrap();

        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn test_delete_prunes_to_empty_root() {
        let mut cache = TreeCache::new(Equality::Reference, None);
        let inserted = cache
            .set(&[(k("k1"), Loadable::resolved(1)), (k("k2"), Loadable::resolved(2))], ())
            .unwrap();

        assert!(cache.delete(inserted.leaf));
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.root(), None);
        assert!(!cache.delete(inserted.leaf));
    }

    #[test]
    fn test_delete_keeps_siblings() {
        let mut cache = TreeCache::new(Equality::Reference, None);
        let first = cache.set(&[(k("a"), Loadable::resolved(1))], 1).unwrap();
        cache.set(&[(k("a"), Loadable::resolved(2))], 2).unwrap();

        assert!(cache.delete(first.leaf));
        assert_eq!(cache.size(), 1);
        assert!(cache.root().is_some());
    }

    #[test]
    fn test_changed_path_resets_once() {
        let v = Loadable::resolved(1);
        let mut cache = TreeCache::new(Equality::Reference, None);
        cache.set(&[(k("a"), v.clone())], 1).unwrap();
        let inserted = cache.set(&[(k("x"), v.clone())], 2).unwrap();

        let changed = inserted.reset.unwrap();
        assert_eq!(changed.depth, 0);
        assert_eq!(changed.cached, Some(k("a")));
        assert_eq!(changed.written, Some(k("x")));
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get(|_| v.clone(), |_, _| {}), Some(&2));
    }

    #[test]
    fn test_route_ending_at_branch_is_changed_path() {
        let v = Loadable::resolved(1);
        let mut cache = TreeCache::new(Equality::Reference, None);
        cache.set(&[(k("a"), v.clone())], 1).unwrap();

        let inserted = cache.set(&[], 2).unwrap();
        assert_eq!(inserted.reset.map(|c| c.written), Some(None));
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get(|_| v.clone(), |_, _| {}), Some(&2));
    }

    #[test]
    fn test_value_equality_routes() {
        let mut cache = TreeCache::new(Equality::Value, None);
        cache
            .set(&[(k("a"), Loadable::Resolved(Value::new(vec![1, 2])))], "hit")
            .unwrap();

        let same = Loadable::Resolved(Value::new(vec![1, 2]));
        assert_eq!(cache.get(|_| same.clone(), |_, _| {}), Some(&"hit"));
    }

    #[test]
    fn test_lru_bound_deletes_leaves() {
        let (a, b, c) = (Loadable::resolved(1), Loadable::resolved(2), Loadable::resolved(3));
        let mut cache = TreeCache::new(Equality::Reference, Some(2));
        cache.set(&[(k("x"), a.clone())], "a").unwrap();
        cache.set(&[(k("x"), b.clone())], "b").unwrap();
        assert_eq!(cache.get(|_| a.clone(), |_, _| {}), Some(&"a"));
        cache.set(&[(k("x"), c.clone())], "c").unwrap();

        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get(|_| b.clone(), |_, _| {}), None);
        assert_eq!(cache.get(|_| a.clone(), |_, _| {}), Some(&"a"));
    }

    #[test]
    fn test_get_shared_tolerates_reset_between_steps() {
        let v = Loadable::resolved(1);
        let cache = Mutex::new(TreeCache::new(Equality::Reference, None));
        cache.lock().set(&[(k("a"), v.clone())], 1).unwrap();

        let found = TreeCache::get_shared(
            &cache,
            |_| {
                cache.lock().clear();
                Ok::<_, ()>(v.clone())
            },
            |_, _| {},
        );
        assert_eq!(found, Ok(None));
    }
}

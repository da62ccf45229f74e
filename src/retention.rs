//! Reference-counted retention of node state within a store.
//!
//! Every node is retained by one of three parties ([`RetainedBy`]). Nodes
//! retained by the root are never reclaimed. Other nodes are reclaimed from a
//! store once nothing retains them: their reference count and the counts of
//! all their zones are zero and every node downstream of them is reclaimed in
//! the same pass.
//!
//! A count dropping to zero only schedules the release. Scheduled retainables
//! are released at the next commit, or immediately when no transaction is
//! open, so that releasing and re-retaining within one transaction keeps the
//! node's state.

use std::fmt;
use std::sync::Arc;

use ahash::{HashMap, HashSet};

use crate::engine::{Engine, NodeDef};
use crate::graph::Graph;
use crate::key::NodeKey;
use crate::store::WeakStore;

/// A named group of nodes retained and released as a unit.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetentionZone(Arc<str>);

impl RetentionZone {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RetentionZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RetentionZone({:?})", &*self.0)
    }
}

/// Something a store keeps a reference count for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Retainable {
    Node(NodeKey),
    Zone(RetentionZone),
}

impl From<NodeKey> for Retainable {
    fn from(key: NodeKey) -> Self {
        Retainable::Node(key)
    }
}

impl From<RetentionZone> for Retainable {
    fn from(zone: RetentionZone) -> Self {
        Retainable::Zone(zone)
    }
}

/// Who keeps a node's state alive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RetainedBy {
    /// The store itself: never reclaimed.
    #[default]
    Root,
    /// Explicit retains of the node, typically one per observer.
    Observers,
    /// Retains of the node or of any of these zones.
    Zones(Vec<RetentionZone>),
}

/// Reference counts of one store.
#[derive(Debug, Default)]
pub(crate) struct RetentionState {
    counts: HashMap<Retainable, usize>,
    nodes_retained_by_zone: HashMap<RetentionZone, HashSet<NodeKey>>,
    scheduled: HashSet<Retainable>,
}

impl RetentionState {
    pub(crate) fn count(&self, retainable: &Retainable) -> usize {
        self.counts.get(retainable).copied().unwrap_or(0)
    }

    /// Adjust a count, saturating at zero.
    ///
    /// Returns true if the count dropped to zero and the retainable was
    /// scheduled for release.
    pub(crate) fn update_retain_count(&mut self, retainable: Retainable, delta: isize) -> bool {
        let count = self.count(&retainable);
        let updated = count.saturating_add_signed(delta);
        if updated == 0 {
            if count == 0 {
                return false;
            }
            self.counts.remove(&retainable);
            self.scheduled.insert(retainable);
            true
        } else {
            self.scheduled.remove(&retainable);
            self.counts.insert(retainable, updated);
            false
        }
    }

    pub(crate) fn add_to_zones(&mut self, key: &NodeKey, zones: &[RetentionZone]) {
        for zone in zones {
            self.nodes_retained_by_zone
                .entry(zone.clone())
                .or_default()
                .insert(key.clone());
        }
    }

    pub(crate) fn has_scheduled(&self) -> bool {
        !self.scheduled.is_empty()
    }

    /// Take the scheduled retainables, expanded to node keys.
    pub(crate) fn drain_scheduled(&mut self) -> Vec<NodeKey> {
        let mut nodes = Vec::new();
        for retainable in self.scheduled.drain() {
            match retainable {
                Retainable::Node(key) => nodes.push(key),
                Retainable::Zone(zone) => {
                    if let Some(members) = self.nodes_retained_by_zone.get(&zone) {
                        nodes.extend(members.iter().cloned());
                    }
                }
            }
        }
        nodes
    }

    /// Forget a released node.
    pub(crate) fn forget(&mut self, key: &NodeKey) {
        self.counts.remove(&Retainable::Node(key.clone()));
        self.nodes_retained_by_zone.retain(|_, members| {
            members.remove(key);
            !members.is_empty()
        });
    }

    fn is_retained(&self, node: &NodeDef) -> bool {
        if self.count(&Retainable::Node(node.key.clone())) > 0 {
            return true;
        }
        match node.options.get_retained_by() {
            RetainedBy::Root => true,
            RetainedBy::Observers => false,
            RetainedBy::Zones(zones) => zones
                .iter()
                .any(|zone| self.count(&Retainable::Zone(zone.clone())) > 0),
        }
    }
}

/// Nodes among `seeds` and their downstream and upstream neighbourhood that
/// can be released.
///
/// A node is releasable when nothing retains it and every node subscribed to
/// it is releasable too. Upstream dependencies of released nodes are
/// reconsidered, so releasing a derivation can release the nodes only it
/// depended on.
pub(crate) fn find_releasable(
    engine: &Engine,
    graph: &Graph,
    retention: &RetentionState,
    seeds: Vec<NodeKey>,
) -> Vec<NodeKey> {
    let mut releasable: HashSet<NodeKey> = HashSet::default();
    let mut non_releasable: HashSet<NodeKey> = HashSet::default();
    let mut released_order = Vec::new();
    let mut search = seeds;

    while !search.is_empty() {
        let order = downstream_children_first(graph, &search, &releasable, &non_releasable);
        let mut found = Vec::new();

        for key in order {
            let retained = match engine.node(&key) {
                Ok(node) => retention.is_retained(&node),
                // A deleted definition leaves nothing to retain.
                Err(_) => false,
            };
            let blocked = graph
                .subscribers_of(&key)
                .any(|child| !releasable.contains(child));
            if retained || blocked {
                non_releasable.insert(key);
            } else {
                releasable.insert(key.clone());
                found.push(key);
            }
        }

        let mut parents: Vec<NodeKey> = Vec::new();
        for key in &found {
            for parent in graph.dependencies_of(key) {
                if !releasable.contains(parent)
                    && !non_releasable.contains(parent)
                    && !parents.contains(parent)
                {
                    parents.push(parent.clone());
                }
            }
        }
        released_order.extend(found);
        search = parents;
    }
    released_order
}

/// Post-order over subscriber edges: every node comes after the nodes
/// subscribed to it.
fn downstream_children_first(
    graph: &Graph,
    seeds: &[NodeKey],
    releasable: &HashSet<NodeKey>,
    non_releasable: &HashSet<NodeKey>,
) -> Vec<NodeKey> {
    let mut visited: HashSet<NodeKey> = HashSet::default();
    let mut order = Vec::new();
    let mut stack: Vec<(NodeKey, bool)> = seeds.iter().rev().map(|key| (key.clone(), false)).collect();

    while let Some((key, expanded)) = stack.pop() {
        if expanded {
            order.push(key);
            continue;
        }
        if releasable.contains(&key) || non_releasable.contains(&key) || !visited.insert(key.clone()) {
            continue;
        }
        stack.push((key.clone(), true));
        for child in graph.subscribers_of(&key) {
            if !visited.contains(child) {
                stack.push((child.clone(), false));
            }
        }
    }
    order
}

/// Keeps a retainable retained until dropped.
///
/// Obtained from [`Store::retain_guard`](crate::Store::retain_guard).
#[must_use = "the retainable is released as soon as the guard is dropped"]
pub struct RetainGuard {
    store: WeakStore,
    retainable: Retainable,
}

impl RetainGuard {
    pub(crate) fn new(store: WeakStore, retainable: Retainable) -> Self {
        Self { store, retainable }
    }

    pub fn retainable(&self) -> &Retainable {
        &self.retainable
    }
}

impl Drop for RetainGuard {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.release(self.retainable.clone());
        }
    }
}

impl fmt::Debug for RetainGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetainGuard").field(&self.retainable).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(key: &str) -> Retainable {
        Retainable::Node(NodeKey::from(key))
    }

    #[test]
    fn test_zero_schedules_and_retain_cancels() {
        let mut state = RetentionState::default();
        assert!(!state.update_retain_count(node("a"), 1));
        assert!(state.update_retain_count(node("a"), -1));
        assert!(state.has_scheduled());

        state.update_retain_count(node("a"), 1);
        assert!(!state.has_scheduled());
        assert_eq!(state.count(&node("a")), 1);
    }

    #[test]
    fn test_release_at_zero_is_noop() {
        let mut state = RetentionState::default();
        assert!(!state.update_retain_count(node("a"), -1));
        assert!(!state.update_retain_count(node("a"), -1));
        assert_eq!(state.count(&node("a")), 0);
        assert!(!state.has_scheduled());
    }

    #[test]
    fn test_drain_expands_zones() {
        let zone = RetentionZone::new("page");
        let mut state = RetentionState::default();
        state.add_to_zones(&NodeKey::from("a"), &[zone.clone()]);
        state.add_to_zones(&NodeKey::from("b"), &[zone.clone()]);
        state.update_retain_count(Retainable::Zone(zone.clone()), 1);
        state.update_retain_count(Retainable::Zone(zone), -1);

        let mut drained: Vec<String> = state.drain_scheduled().iter().map(|k| k.to_string()).collect();
        drained.sort();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(!state.has_scheduled());
    }

    #[test]
    fn test_children_first_order() {
        let mut graph = Graph::new();
        graph.record_dependency(&NodeKey::from("b"), &NodeKey::from("a"));
        graph.record_dependency(&NodeKey::from("c"), &NodeKey::from("b"));

        let order = downstream_children_first(
            &graph,
            &[NodeKey::from("a")],
            &HashSet::default(),
            &HashSet::default(),
        );
        let order: Vec<String> = order.iter().map(|k| k.to_string()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }
}

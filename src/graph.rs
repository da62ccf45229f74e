//! Per-version dependency graph between nodes.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::{HashMap, HashSet};

use crate::key::NodeKey;

type Edges = HashMap<NodeKey, Arc<HashSet<NodeKey>>>;

/// Forward (upstream) and reverse (downstream) dependency edges.
///
/// Edge sets are reference counted and copied on write, so
/// [`Graph::clone_for_new_version`] shares every set with the original until
/// one of the two graphs changes it.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    node_deps: Edges,
    node_to_node_subscriptions: Edges,
}

fn insert_edge(edges: &mut Edges, from: &NodeKey, to: &NodeKey) -> bool {
    let set = edges.entry(from.clone()).or_default();
    if set.contains(to) {
        return false;
    }
    Arc::make_mut(set).insert(to.clone());
    true
}

fn remove_edge(edges: &mut Edges, from: &NodeKey, to: &NodeKey) {
    if let Some(set) = edges.get_mut(from) {
        if set.contains(to) {
            Arc::make_mut(set).remove(to);
        }
        if set.is_empty() {
            edges.remove(from);
        }
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// A graph for the next version sharing all edge sets with this one.
    pub fn clone_for_new_version(&self) -> Self {
        self.clone()
    }

    /// Add `dependent -> dependency` to both edge maps.
    ///
    /// Returns false if the edge already existed.
    pub fn record_dependency(&mut self, dependent: &NodeKey, dependency: &NodeKey) -> bool {
        let added = insert_edge(&mut self.node_deps, dependent, dependency);
        insert_edge(&mut self.node_to_node_subscriptions, dependency, dependent);
        added
    }

    /// Replace the upstream set of `key`, fixing up reverse edges.
    pub fn set_dependencies(&mut self, key: &NodeKey, deps: impl IntoIterator<Item = NodeKey>) {
        let new: HashSet<NodeKey> = deps.into_iter().collect();
        let old = self.node_deps.remove(key);

        if let Some(old) = &old {
            for dep in old.iter().filter(|dep| !new.contains(*dep)) {
                remove_edge(&mut self.node_to_node_subscriptions, dep, key);
            }
        }
        for dep in &new {
            insert_edge(&mut self.node_to_node_subscriptions, dep, key);
        }

        if !new.is_empty() {
            self.node_deps.insert(key.clone(), Arc::new(new));
        }
    }

    /// Upstream dependencies of `key`.
    pub fn dependencies_of(&self, key: &NodeKey) -> impl Iterator<Item = &NodeKey> {
        self.node_deps.get(key).into_iter().flat_map(|set| set.iter())
    }

    /// Direct downstream subscribers of `key`.
    pub fn subscribers_of(&self, key: &NodeKey) -> impl Iterator<Item = &NodeKey> {
        self.node_to_node_subscriptions
            .get(key)
            .into_iter()
            .flat_map(|set| set.iter())
    }

    pub fn has_subscribers(&self, key: &NodeKey) -> bool {
        self.node_to_node_subscriptions.contains_key(key)
    }

    /// Transitive closure of reverse edges, seeds included.
    pub fn downstream_of<'a>(&self, keys: impl IntoIterator<Item = &'a NodeKey>) -> HashSet<NodeKey> {
        let mut visited = HashSet::default();
        let mut queue: VecDeque<NodeKey> = VecDeque::new();
        for key in keys {
            if visited.insert(key.clone()) {
                queue.push_back(key.clone());
            }
        }
        while let Some(key) = queue.pop_front() {
            for subscriber in self.subscribers_of(&key) {
                if visited.insert(subscriber.clone()) {
                    queue.push_back(subscriber.clone());
                }
            }
        }
        visited
    }

    /// Drop every edge touching `key`.
    pub fn remove_node(&mut self, key: &NodeKey) {
        if let Some(deps) = self.node_deps.remove(key) {
            for dep in deps.iter() {
                remove_edge(&mut self.node_to_node_subscriptions, dep, key);
            }
        }
        if let Some(subscribers) = self.node_to_node_subscriptions.remove(key) {
            for subscriber in subscribers.iter() {
                remove_edge(&mut self.node_deps, subscriber, key);
            }
        }
    }

    /// Number of nodes with at least one upstream dependency.
    pub fn len(&self) -> usize {
        self.node_deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_deps.is_empty() && self.node_to_node_subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(s: &str) -> NodeKey {
        NodeKey::from(s)
    }

    fn sorted<'a>(it: impl Iterator<Item = &'a NodeKey>) -> Vec<String> {
        let mut keys: Vec<String> = it.map(|k| k.to_string()).collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_record_dependency_is_bidirectional() {
        let mut graph = Graph::new();
        assert!(graph.record_dependency(&k("b"), &k("a")));
        assert!(!graph.record_dependency(&k("b"), &k("a")));

        assert_eq!(sorted(graph.dependencies_of(&k("b"))), vec!["a"]);
        assert_eq!(sorted(graph.subscribers_of(&k("a"))), vec!["b"]);
    }

    #[test]
    fn test_downstream_is_transitive() {
        let mut graph = Graph::new();
        graph.record_dependency(&k("b"), &k("a"));
        graph.record_dependency(&k("c"), &k("b"));
        graph.record_dependency(&k("d"), &k("x"));

        let downstream = graph.downstream_of([&k("a")]);
        assert_eq!(sorted(downstream.iter()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_set_dependencies_replaces_reverse_edges() {
        let mut graph = Graph::new();
        graph.set_dependencies(&k("c"), [k("a"), k("b")]);
        graph.set_dependencies(&k("c"), [k("b")]);

        assert!(!graph.has_subscribers(&k("a")));
        assert_eq!(sorted(graph.subscribers_of(&k("b"))), vec!["c"]);
    }

    #[test]
    fn test_clone_shares_until_written() {
        let mut first = Graph::new();
        first.record_dependency(&k("b"), &k("a"));

        let mut second = first.clone_for_new_version();
        assert!(Arc::ptr_eq(
            first.node_deps.get(&k("b")).unwrap(),
            second.node_deps.get(&k("b")).unwrap()
        ));

        second.record_dependency(&k("b"), &k("z"));
        assert_eq!(sorted(first.dependencies_of(&k("b"))), vec!["a"]);
        assert_eq!(sorted(second.dependencies_of(&k("b"))), vec!["a", "z"]);
    }

    #[test]
    fn test_remove_node() {
        let mut graph = Graph::new();
        graph.record_dependency(&k("b"), &k("a"));
        graph.record_dependency(&k("c"), &k("b"));
        graph.remove_node(&k("b"));

        assert!(graph.is_empty());
    }
}

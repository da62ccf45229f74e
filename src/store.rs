//! Logical contexts: version chains over a shared engine.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use ahash::{HashMap, HashSet};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::atom::Atom;
use crate::engine::{Engine, NodeDef, NodeKind};
use crate::error::{EngineError, NodeError};
use crate::graph::Graph;
use crate::key::{NodeHandle, NodeKey, NodeValue, Value};
use crate::loadable::Loadable;
use crate::retention::{find_releasable, RetainGuard, Retainable, RetainedBy, RetentionState};
use crate::state::{TreeState, Version, VersionId};

/// Identifier of a store, unique within its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StoreId(pub u64);

/// Handle returned by [`Store::on_transaction_committed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A committed transaction.
#[derive(Debug, Clone)]
pub struct Commit {
    /// The version that became current.
    pub version: VersionId,
    /// The version it replaced.
    pub previous: VersionId,
    /// Nodes written or settled in the transaction.
    pub dirty: HashSet<NodeKey>,
    /// Every node downstream of `dirty`, including `dirty` itself.
    pub downstream: HashSet<NodeKey>,
}

type CommitCallback = Arc<dyn Fn(&Commit) + Send + Sync>;

struct StoreState {
    current: Version,
    /// Version being built by an open transaction.
    next: Option<Version>,
    graphs: HashMap<VersionId, Graph>,
    batch_depth: usize,
    known_nodes: HashSet<NodeKey>,
}

struct StoreInner {
    id: StoreId,
    engine: Engine,
    state: Mutex<StoreState>,
    retention: Mutex<RetentionState>,
    subscriptions: Mutex<Vec<(SubscriptionId, CommitCallback)>>,
    next_subscription: AtomicU64,
    liveness: AtomicUsize,
    disposed: AtomicBool,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        self.engine.clear_executions(self.id);
    }
}

/// An isolated state universe over an [`Engine`].
///
/// Each store has its own chain of versions. Writes build the next version and
/// commit it, notifying subscribers; [`Store::batch`] groups several writes
/// into one commit. Node definitions and their route caches are shared by every
/// store of an engine, so a result computed in one store is reused by others
/// whose dependencies hold the same values.
///
/// Cloning a store yields another handle on the same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// A handle that does not keep a store alive.
#[derive(Clone)]
pub struct WeakStore {
    id: StoreId,
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }

    pub fn id(&self) -> StoreId {
        self.id
    }
}

impl fmt::Debug for WeakStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakStore").field(&self.id).finish()
    }
}

/// Keeps a store live until dropped.
#[must_use = "the store stops being kept live as soon as the guard is dropped"]
pub struct LivenessGuard {
    store: Store,
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.store.inner.liveness.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for LivenessGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LivenessGuard").field(&self.store.id()).finish()
    }
}

struct BatchGuard<'a> {
    store: &'a Store,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let outermost = {
            let mut state = self.store.inner.state.lock();
            state.batch_depth -= 1;
            state.batch_depth == 0
        };
        if outermost && !self.store.commit() {
            self.store.release_now();
        }
    }
}

impl Store {
    /// Create a store at an empty version.
    pub fn new(engine: &Engine) -> Self {
        let version = Arc::new(TreeState::new(engine.next_version_id()));
        Self::with_version(engine, version, Graph::new())
    }

    fn with_version(engine: &Engine, version: Version, graph: Graph) -> Self {
        let mut graphs = HashMap::default();
        graphs.insert(version.version(), graph);
        Self {
            inner: Arc::new(StoreInner {
                id: engine.next_store_id(),
                engine: engine.clone(),
                state: Mutex::new(StoreState {
                    current: version,
                    next: None,
                    graphs,
                    batch_depth: 0,
                    known_nodes: HashSet::default(),
                }),
                retention: Mutex::new(RetentionState::default()),
                subscriptions: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                liveness: AtomicUsize::new(1),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> StoreId {
        self.inner.id
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// The last committed version.
    pub fn current_version(&self) -> Version {
        self.inner.state.lock().current.clone()
    }

    /// The version of the open transaction, or the current one.
    pub fn latest_version(&self) -> Version {
        let state = self.inner.state.lock();
        state.next.as_ref().unwrap_or(&state.current).clone()
    }

    /// Run `f` on the next version, creating it from the current one if no
    /// transaction is open, then commit unless inside [`Store::batch`].
    pub fn replace_version(&self, f: impl FnOnce(&Version)) {
        let next = {
            let mut state = self.inner.state.lock();
            match state.next.clone() {
                Some(next) => next,
                None => {
                    let id = self.inner.engine.next_version_id();
                    let next = Arc::new(state.current.successor(id));
                    let graph = state
                        .graphs
                        .get(&state.current.version())
                        .map(Graph::clone_for_new_version)
                        .unwrap_or_default();
                    state.graphs.insert(id, graph);
                    state.next = Some(next.clone());
                    next
                }
            }
        };
        f(&next);

        let batching = self.inner.state.lock().batch_depth > 0;
        if !batching {
            self.commit();
        }
    }

    /// Promote the next version to current. Returns false if no transaction
    /// was open.
    fn commit(&self) -> bool {
        let (commit, superseded) = {
            let mut state = self.inner.state.lock();
            let Some(next) = state.next.take() else {
                return false;
            };
            let previous = std::mem::replace(&mut state.current, next.clone());
            let graph = state.graphs.remove(&next.version()).unwrap_or_default();
            let dirty = next.dirty_keys();
            let downstream = graph.downstream_of(dirty.iter());
            let superseded = std::mem::take(&mut state.graphs);
            state.graphs.insert(next.version(), graph);

            let commit = Commit {
                version: next.version(),
                previous: previous.version(),
                dirty,
                downstream,
            };
            (commit, (previous, superseded))
        };
        drop(superseded);

        self.release_now();
        if !self.is_live() {
            return true;
        }
        self.inner.engine.tracer().on_commit(self.id(), &commit);
        let callbacks: Vec<CommitCallback> = self
            .inner
            .subscriptions
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(&commit);
        }
        true
    }

    /// Group every write made by `f` into a single commit.
    ///
    /// Batches nest; the outermost one commits. Releases scheduled inside the
    /// batch happen after it.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.state.lock().batch_depth += 1;
        let _guard = BatchGuard { store: self };
        f()
    }

    /// A copy of the dependency graph of `version`.
    pub fn graph_for_version(&self, version: VersionId) -> Graph {
        self.with_graph(version, Graph::clone)
    }

    pub(crate) fn with_graph<R>(&self, version: VersionId, f: impl FnOnce(&Graph) -> R) -> R {
        let state = self.inner.state.lock();
        match state.graphs.get(&version) {
            Some(graph) => f(graph),
            None => f(&Graph::default()),
        }
    }

    /// Record the dependencies `key` read in `version`.
    ///
    /// Dependencies read in the current version are recorded in the open
    /// transaction's version as well. Superseded versions keep no graph.
    pub(crate) fn save_dependencies(&self, version: &Version, key: &NodeKey, deps: Vec<NodeKey>) {
        let mut state = self.inner.state.lock();
        let id = version.version();
        let next = state.next.as_ref().map(|next| next.version());
        let targets = if id == state.current.version() {
            [Some(id), next]
        } else if Some(id) == next {
            [next, None]
        } else {
            return;
        };
        for target in targets.into_iter().flatten() {
            if let Some(graph) = state.graphs.get_mut(&target) {
                graph.set_dependencies(key, deps.iter().cloned());
            }
        }
    }

    /// Call `callback` after every commit while the store is live.
    ///
    /// Pending derivations only make progress while their container is
    /// polled. A result that settles asynchronously is memoized and committed
    /// (with the derivation among the dirty keys) only once someone awaits it,
    /// for example through [`Loadable::to_future`] or [`Store::get_async`].
    pub fn on_transaction_committed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Commit) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.subscriptions.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let index = subscriptions.iter().position(|(sub, _)| *sub == id);
            index.map(|index| subscriptions.remove(index))
        };
        removed.is_some()
    }

    /// Notify the store that a derivation settled asynchronously.
    pub(crate) fn mark_modified(&self, key: &NodeKey) {
        if !self.is_live() {
            return;
        }
        let engine = self.inner.engine.clone();
        self.replace_version(|version| {
            version.remove_value(key);
            version.mark_dirty(key.clone());
            engine.invalidate_downstream(self, version, std::slice::from_ref(key));
        });
    }

    /// Whether the store can still receive asynchronous results.
    pub fn is_live(&self) -> bool {
        self.inner.liveness.load(Ordering::Acquire) > 0
    }

    /// Keep the store live until the guard is dropped, even past
    /// [`Store::dispose`].
    pub fn keep_alive(&self) -> LivenessGuard {
        self.inner.liveness.fetch_add(1, Ordering::AcqRel);
        LivenessGuard { store: self.clone() }
    }

    /// Drop the store's own liveness and abandon its in-flight executions.
    ///
    /// Pending executions settle with [`NodeError::Cancelled`] unless a
    /// [`LivenessGuard`] still keeps the store live. Calling it again does
    /// nothing.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.inner.liveness.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.engine.clear_executions(self.id());
        }
    }

    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            id: self.id(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Fork the current version into an isolated store.
    ///
    /// The snapshot shares node definitions and route caches with this store,
    /// but writes to either are invisible to the other.
    pub fn snapshot(&self) -> Store {
        let (current, graph) = {
            let state = self.inner.state.lock();
            let graph = state
                .graphs
                .get(&state.current.version())
                .map(Graph::clone_for_new_version)
                .unwrap_or_default();
            (state.current.clone(), graph)
        };
        let version = Arc::new(current.successor(self.inner.engine.next_version_id()));
        Store::with_version(&self.inner.engine, version, graph)
    }

    /// First sighting of a node in this store.
    pub(crate) fn init_node(&self, node: &NodeDef) {
        if !self.inner.state.lock().known_nodes.insert(node.key.clone()) {
            return;
        }
        if let RetainedBy::Zones(zones) = node.options.get_retained_by() {
            self.inner.retention.lock().add_to_zones(&node.key, zones);
        }
    }

    /// Whether the store has seen `key` since it was last released.
    pub fn has_node(&self, key: &NodeKey) -> bool {
        self.inner.state.lock().known_nodes.contains(key)
    }

    pub fn retain(&self, retainable: impl Into<Retainable>) {
        self.inner.retention.lock().update_retain_count(retainable.into(), 1);
    }

    /// Drop one reference. Reaching zero releases at the end of the current
    /// batch, or right away outside of one.
    pub fn release(&self, retainable: impl Into<Retainable>) {
        let scheduled = self.inner.retention.lock().update_retain_count(retainable.into(), -1);
        if scheduled {
            self.release_now();
        }
    }

    /// Retain until the returned guard is dropped.
    pub fn retain_guard(&self, retainable: impl Into<Retainable>) -> RetainGuard {
        let retainable = retainable.into();
        self.retain(retainable.clone());
        RetainGuard::new(self.downgrade(), retainable)
    }

    pub fn retain_count(&self, retainable: &Retainable) -> usize {
        self.inner.retention.lock().count(retainable)
    }

    /// Release every scheduled node nothing retains anymore.
    pub fn release_now(&self) {
        if !self.inner.engine.config().retention {
            return;
        }
        let releasable = {
            let state = self.inner.state.lock();
            if state.batch_depth > 0 || state.next.is_some() {
                return;
            }
            let mut retention = self.inner.retention.lock();
            if !retention.has_scheduled() {
                return;
            }
            let seeds = retention.drain_scheduled();
            let empty = Graph::default();
            let graph = state.graphs.get(&state.current.version()).unwrap_or(&empty);
            find_releasable(&self.inner.engine, graph, &retention, seeds)
        };
        for key in releasable {
            self.release_node(&key);
        }
    }

    fn release_node(&self, key: &NodeKey) {
        let current = {
            let mut state = self.inner.state.lock();
            state.known_nodes.remove(key);
            for graph in state.graphs.values_mut() {
                graph.remove_node(key);
            }
            state.current.clone()
        };
        current.remove_value(key);
        self.inner.retention.lock().forget(key);

        let engine = &self.inner.engine;
        if let Ok(node) = engine.node(key) {
            if let Some(derived) = node.derived() {
                derived.clear_execution(self.id(), None);
            }
            if node.options.deletes_definition_on_release() {
                engine.delete_definition(key);
            }
        }
        engine.tracer().on_node_released(self.id(), key);
    }

    /// Read a node in the latest version.
    pub fn get_loadable<H: NodeHandle>(&self, node: &H) -> Result<Loadable, EngineError> {
        let version = self.latest_version();
        self.inner.engine.read(self, &version, node.key())
    }

    /// Read a settled value.
    ///
    /// A pending node yields [`NodeError::Suspend`]; use [`Store::get_async`]
    /// to wait for it.
    pub fn get<H: NodeHandle>(&self, node: &H) -> Result<Arc<H::Value>, NodeError> {
        let value = self.get_loadable(node).map_err(NodeError::Fatal)?.get()?;
        downcast(node.key(), value)
    }

    /// Read a value, waiting for it if it is pending.
    pub fn get_async<H: NodeHandle>(&self, node: &H) -> BoxFuture<'static, Result<Arc<H::Value>, NodeError>> {
        settle::<H::Value>(node.key().clone(), self.get_loadable(node)).boxed()
    }

    /// Best-effort read that never runs a getter.
    pub fn peek<H: NodeHandle>(&self, node: &H) -> Option<Loadable> {
        let version = self.latest_version();
        self.inner.engine.peek(self, &version, node.key())
    }

    pub fn set<T: NodeValue>(&self, atom: &Atom<T>, value: T) -> Result<(), EngineError> {
        self.set_loadable(atom, Loadable::resolved(value))
    }

    /// Set a source node to any container, including a pending one.
    pub fn set_loadable<T: NodeValue>(&self, atom: &Atom<T>, value: Loadable) -> Result<(), EngineError> {
        self.write(atom.key(), Some(value))
    }

    /// Set a source node back to its default.
    pub fn reset<T: NodeValue>(&self, atom: &Atom<T>) -> Result<(), EngineError> {
        self.write(atom.key(), None)
    }

    fn write(&self, key: &NodeKey, value: Option<Loadable>) -> Result<(), EngineError> {
        let engine = &self.inner.engine;
        let writes = engine.write(&self.latest_version(), key, value)?;
        if writes.is_empty() {
            return Ok(());
        }
        self.replace_version(|version| engine.apply_writes(self, version, writes));
        Ok(())
    }

    /// Store a raw value for a source node, validated on its first read.
    pub fn set_unvalidated(&self, key: &NodeKey, raw: Value) -> Result<(), EngineError> {
        let engine = &self.inner.engine;
        if engine.node(key)?.kind() != NodeKind::Source {
            return Err(EngineError::NotWritable { key: key.clone() });
        }
        self.replace_version(|version| {
            version.remove_value(key);
            version.set_nonvalidated(key.clone(), raw);
            version.mark_dirty(key.clone());
            engine.invalidate_downstream(self, version, std::slice::from_ref(key));
        });
        Ok(())
    }

    /// Recompute a derivation and the derivations it reads from scratch.
    pub fn refresh<H: NodeHandle>(&self, node: &H) -> Result<(), EngineError> {
        let engine = &self.inner.engine;
        let key = node.key();
        engine.node(key)?;
        let mut result = Ok(());
        self.replace_version(|version| {
            result = engine.force_recompute(self, version, key);
            version.mark_dirty(key.clone());
            engine.invalidate_downstream(self, version, std::slice::from_ref(key));
        });
        result
    }

    /// Drop the value a derivation cached in the latest version, so the next
    /// read consults its route cache again.
    pub fn invalidate<H: NodeHandle>(&self, node: &H) -> Result<(), EngineError> {
        self.inner.engine.invalidate(&self.latest_version(), node.key())
    }
}

fn downcast<T: NodeValue>(key: &NodeKey, value: Value) -> Result<Arc<T>, NodeError> {
    value.downcast::<T>().ok_or_else(|| {
        NodeError::Fatal(EngineError::TypeMismatch {
            key: key.clone(),
            expected: std::any::type_name::<T>(),
        })
    })
}

async fn settle<T: NodeValue>(key: NodeKey, loadable: Result<Loadable, EngineError>) -> Result<Arc<T>, NodeError> {
    let value = loadable.map_err(NodeError::Fatal)?.to_future().await?;
    downcast(&key, value)
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("current", &state.current.version())
            .field("next", &state.next.as_ref().map(|next| next.version()))
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selector;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_write_commits_a_new_version() {
        let engine = Engine::new();
        let store = Store::new(&engine);
        let a = Atom::new(&engine, "a", 1).unwrap();

        let before = store.current_version().version();
        store.set(&a, 2).unwrap();
        let after = store.current_version().version();
        assert!(after > before);
        assert_eq!(*store.get(&a).unwrap(), 2);
    }

    #[test]
    fn test_same_container_does_not_commit() {
        let engine = Engine::new();
        let store = Store::new(&engine);
        let a = Atom::new(&engine, "a", 1).unwrap();
        let commits = Arc::new(AtomicU32::new(0));
        let counted = commits.clone();
        store.on_transaction_committed(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let value = Loadable::resolved(5);
        store.set_loadable(&a, value.clone()).unwrap();
        store.set_loadable(&a, value).unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batch_commits_once() {
        let engine = Engine::new();
        let store = Store::new(&engine);
        let a = Atom::new(&engine, "a", 1).unwrap();
        let b = Atom::new(&engine, "b", 1).unwrap();
        let commits = Arc::new(Mutex::new(Vec::new()));
        let seen = commits.clone();
        store.on_transaction_committed(move |commit| seen.lock().push(commit.dirty.len()));

        store.batch(|| {
            store.set(&a, 2).unwrap();
            store.batch(|| store.set(&b, 3).unwrap());
            assert_eq!(*store.get(&b).unwrap(), 3);
        });
        assert_eq!(*commits.lock(), vec![2]);
    }

    #[test]
    fn test_unsubscribe() {
        let engine = Engine::new();
        let store = Store::new(&engine);
        let a = Atom::new(&engine, "a", 1).unwrap();
        let commits = Arc::new(AtomicU32::new(0));
        let counted = commits.clone();
        let id = store.on_transaction_committed(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        store.set(&a, 2).unwrap();
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.set(&a, 3).unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_graph_is_tracked_per_version() {
        let engine = Engine::new();
        let store = Store::new(&engine);
        let a = Atom::new(&engine, "a", 1).unwrap();
        let b = Selector::new(&engine, "b", move |get| Ok(*get.get(&a)? + 1)).unwrap();

        store.get(&b).unwrap();
        let graph = store.graph_for_version(store.current_version().version());
        assert!(graph.has_subscribers(&NodeKey::from("a")));
    }

    #[test]
    fn test_set_unvalidated_rejects_derived() {
        let engine = Engine::new();
        let store = Store::new(&engine);
        Selector::new(&engine, "b", |_| Ok(1)).unwrap();

        let err = store.set_unvalidated(&NodeKey::from("b"), Value::new(2)).unwrap_err();
        assert_eq!(err, EngineError::NotWritable { key: NodeKey::from("b") });
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let engine = Engine::new();
        let store = Store::new(&engine);
        let guard = store.keep_alive();
        store.dispose();
        store.dispose();
        assert!(store.is_live());
        drop(guard);
        assert!(!store.is_live());
    }
}

//! The engine: node registry, shared derivation state and configuration.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::{HashMap, HashSet};
use parking_lot::RwLock;

use crate::atom::{self, SourceDef};
use crate::cache::CachePolicy;
use crate::error::EngineError;
use crate::key::NodeKey;
use crate::loadable::Loadable;
use crate::retention::RetainedBy;
use crate::selector::{self, DerivedDef, ExecutionId};
use crate::state::{Version, VersionId};
use crate::store::{Store, StoreId};
use crate::tracer::{NoopTracer, Tracer};

/// Values written by [`Engine::write`], keyed by source node.
///
/// `None` resets the node to its default.
pub type Writes = HashMap<NodeKey, Option<Loadable>>;

/// Whether a node is set from outside or computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeKind {
    Source,
    Derived,
}

/// Per-node options.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    retained_by: RetainedBy,
    cache_policy: Option<CachePolicy>,
    delete_definition_on_release: bool,
}

impl NodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Who keeps the node's state alive in a store. Defaults to
    /// [`RetainedBy::Root`].
    pub fn retained_by(mut self, retained_by: RetainedBy) -> Self {
        self.retained_by = retained_by;
        self
    }

    /// Route cache policy of a derivation. Defaults to the engine's policy.
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    /// Unregister the node when a store releases it.
    pub fn delete_definition_on_release(mut self, delete: bool) -> Self {
        self.delete_definition_on_release = delete;
        self
    }

    pub fn get_retained_by(&self) -> &RetainedBy {
        &self.retained_by
    }

    pub fn get_cache_policy(&self) -> Option<CachePolicy> {
        self.cache_policy
    }

    pub fn deletes_definition_on_release(&self) -> bool {
        self.delete_definition_on_release
    }
}

pub(crate) enum NodeBody {
    Source(SourceDef),
    Derived(Arc<DerivedDef>),
}

/// A registered node.
pub(crate) struct NodeDef {
    pub(crate) key: NodeKey,
    pub(crate) body: NodeBody,
    pub(crate) options: NodeOptions,
    pub(crate) type_name: &'static str,
}

impl NodeDef {
    pub(crate) fn kind(&self) -> NodeKind {
        match self.body {
            NodeBody::Source(_) => NodeKind::Source,
            NodeBody::Derived(_) => NodeKind::Derived,
        }
    }

    pub(crate) fn derived(&self) -> Option<&Arc<DerivedDef>> {
        match &self.body {
            NodeBody::Derived(derived) => Some(derived),
            NodeBody::Source(_) => None,
        }
    }
}

/// Engine configuration, fixed at build time.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Route cache policy of derivations registered without one.
    pub default_cache_policy: CachePolicy,
    /// Whether stores reclaim unretained node state.
    pub retention: bool,
    /// Whether registering a taken key replaces the old definition instead of
    /// failing.
    pub allow_reregistration: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_cache_policy: CachePolicy::default(),
            retention: true,
            allow_reregistration: false,
        }
    }
}

/// Builder for [`Engine`].
///
/// # Example
///
/// ```ignore
/// use statebound::{CachePolicy, Engine};
///
/// let engine = Engine::builder()
///     .default_cache_policy(CachePolicy::lru(64))
///     .allow_reregistration(true)
///     .build();
/// ```
pub struct EngineBuilder {
    tracer: Arc<dyn Tracer>,
    config: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            tracer: Arc::new(NoopTracer),
            config: EngineConfig::default(),
        }
    }

    /// Install a tracer.
    pub fn tracer<T: Tracer>(mut self, tracer: T) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Install a shared tracer.
    pub fn shared_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn default_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.config.default_cache_policy = policy;
        self
    }

    /// Enable or disable reclamation of unretained node state.
    pub fn retention(mut self, enabled: bool) -> Self {
        self.config.retention = enabled;
        self
    }

    /// Let a duplicate registration replace the existing definition.
    ///
    /// Meant for hot reloading. Replacements are reported through
    /// [`Tracer::on_duplicate_registration`].
    pub fn allow_reregistration(mut self, allow: bool) -> Self {
        self.config.allow_reregistration = allow;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                nodes: RwLock::new(HashMap::default()),
                tracer: self.tracer,
                config: self.config,
                next_version: AtomicU64::new(1),
                next_store: AtomicU64::new(1),
                next_execution: AtomicU64::new(1),
            }),
        }
    }
}

struct EngineInner {
    nodes: RwLock<HashMap<NodeKey, Arc<NodeDef>>>,
    tracer: Arc<dyn Tracer>,
    config: EngineConfig,
    next_version: AtomicU64,
    next_store: AtomicU64,
    next_execution: AtomicU64,
}

/// Registry of node definitions and the derivation state shared by every
/// [`Store`] created from it.
///
/// Cloning is cheap and yields a handle on the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create an engine with default settings.
    pub fn new() -> Self {
        EngineBuilder::new().build()
    }

    /// Create a builder for customizing the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn tracer(&self) -> &dyn Tracer {
        self.inner.tracer.as_ref()
    }

    pub(crate) fn next_version_id(&self) -> VersionId {
        VersionId(self.inner.next_version.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_store_id(&self) -> StoreId {
        StoreId(self.inner.next_store.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_execution_id(&self) -> ExecutionId {
        ExecutionId(self.inner.next_execution.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, def: NodeDef) -> Result<Arc<NodeDef>, EngineError> {
        let key = def.key.clone();
        let kind = def.kind();
        let def = Arc::new(def);

        let mut nodes = self.inner.nodes.write();
        let duplicate = nodes.contains_key(&key);
        if duplicate && !self.inner.config.allow_reregistration {
            drop(nodes);
            self.tracer().on_duplicate_registration(&key, false);
            return Err(EngineError::DuplicateKey { key });
        }
        nodes.insert(key.clone(), def.clone());
        drop(nodes);

        if duplicate {
            self.tracer().on_duplicate_registration(&key, true);
        } else {
            self.tracer().on_node_registered(&key, kind);
        }
        Ok(def)
    }

    pub(crate) fn node(&self, key: &NodeKey) -> Result<Arc<NodeDef>, EngineError> {
        self.inner
            .nodes
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::Unregistered { key: key.clone() })
    }

    /// Drop every in-flight execution record of `store`.
    pub(crate) fn clear_executions(&self, store: StoreId) {
        let derived: Vec<Arc<DerivedDef>> = self
            .inner
            .nodes
            .read()
            .values()
            .filter_map(|node| node.derived().cloned())
            .collect();
        for derived in derived {
            derived.clear_execution(store, None);
        }
    }

    /// Unregister a node. Returns whether it was registered.
    pub fn delete_definition(&self, key: &NodeKey) -> bool {
        let removed = self.inner.nodes.write().remove(key);
        removed.is_some()
    }

    pub fn is_registered(&self, key: &NodeKey) -> bool {
        self.inner.nodes.read().contains_key(key)
    }

    pub fn node_kind(&self, key: &NodeKey) -> Option<NodeKind> {
        self.inner.nodes.read().get(key).map(|node| node.kind())
    }

    /// Name of the value type a node holds.
    pub fn node_type_name(&self, key: &NodeKey) -> Option<&'static str> {
        self.inner.nodes.read().get(key).map(|node| node.type_name)
    }

    /// Keys of every registered node.
    pub fn keys(&self) -> Vec<NodeKey> {
        self.inner.nodes.read().keys().cloned().collect()
    }

    /// Number of results in a derivation's route cache.
    pub fn route_cache_size(&self, key: &NodeKey) -> Result<usize, EngineError> {
        let node = self.node(key)?;
        Ok(node.derived().map_or(0, |derived| derived.cache_size()))
    }

    /// Read a node in `version` of `store`, evaluating derivations as needed.
    pub fn read(&self, store: &Store, version: &Version, key: &NodeKey) -> Result<Loadable, EngineError> {
        let node = self.node(key)?;
        store.init_node(&node);
        match &node.body {
            NodeBody::Source(source) => Ok(atom::read(version, &node, source)),
            NodeBody::Derived(derived) => selector::read(self, store, version, &node.key, derived),
        }
    }

    /// Best-effort read that never evaluates a getter.
    ///
    /// Derivations are answered from the version or from their route cache,
    /// with every dependency itself peeked.
    pub fn peek(&self, store: &Store, version: &Version, key: &NodeKey) -> Option<Loadable> {
        let node = self.node(key).ok()?;
        match &node.body {
            NodeBody::Source(source) => Some(atom::peek(version, &node, source)),
            NodeBody::Derived(derived) => selector::peek(self, store, version, &node.key, derived),
        }
    }

    /// Compute the writes setting source `key` to `value`, or back to its
    /// default with `None`.
    ///
    /// Writing the very container the version already holds yields no writes.
    pub fn write(
        &self,
        version: &Version,
        key: &NodeKey,
        value: Option<Loadable>,
    ) -> Result<Writes, EngineError> {
        let node = self.node(key)?;
        if node.kind() != NodeKind::Source {
            return Err(EngineError::NotWritable { key: key.clone() });
        }

        let mut writes = Writes::default();
        let unchanged = match (&value, version.value(key)) {
            (Some(new), Some(old)) => new.is(&old),
            (None, None) => version.nonvalidated(key).is_none(),
            _ => false,
        };
        if !unchanged {
            writes.insert(key.clone(), value);
        }
        Ok(writes)
    }

    /// Apply writes to `version`: set the values, mark them dirty, drop their
    /// unvalidated raw values and invalidate every downstream derivation.
    pub fn apply_writes(&self, store: &Store, version: &Version, writes: Writes) {
        if writes.is_empty() {
            return;
        }
        let written: Vec<NodeKey> = writes.keys().cloned().collect();
        for (key, value) in writes {
            match value {
                Some(value) => version.set_value(key.clone(), value),
                None => version.remove_value(&key),
            };
            version.remove_nonvalidated(&key);
            version.mark_dirty(key);
        }
        self.invalidate_downstream(store, version, &written);
    }

    pub(crate) fn invalidate_downstream(&self, store: &Store, version: &Version, keys: &[NodeKey]) {
        let downstream = store.with_graph(version.version(), |graph| graph.downstream_of(keys));
        for key in downstream.iter().filter(|key| !keys.contains(*key)) {
            // Keys left in the graph by a replaced or deleted definition are skipped.
            let _ = self.invalidate(version, key);
        }
    }

    /// Drop the value a derivation cached in `version`.
    ///
    /// Source nodes hold no derived state, so invalidating one does nothing.
    pub fn invalidate(&self, version: &Version, key: &NodeKey) -> Result<(), EngineError> {
        let node = self.node(key)?;
        if node.kind() == NodeKind::Derived {
            version.remove_value(key);
        }
        Ok(())
    }

    /// Forget everything a derivation and its upstream derivations computed:
    /// route caches, in-flight executions of `store` and values cached in
    /// `version`.
    pub fn force_recompute(&self, store: &Store, version: &Version, key: &NodeKey) -> Result<(), EngineError> {
        let mut visited = HashSet::default();
        self.clear_derived(store, version, key, &mut visited)
    }

    fn clear_derived(
        &self,
        store: &Store,
        version: &Version,
        key: &NodeKey,
        visited: &mut HashSet<NodeKey>,
    ) -> Result<(), EngineError> {
        if !visited.insert(key.clone()) {
            return Ok(());
        }
        let node = self.node(key)?;
        let Some(derived) = node.derived() else {
            return Ok(());
        };

        derived.clear_cache();
        derived.clear_execution(store.id(), None);
        version.remove_value(key);

        let upstream: Vec<NodeKey> = store.with_graph(version.version(), |graph| {
            graph.dependencies_of(key).cloned().collect()
        });
        for dep in upstream {
            if self.node_kind(&dep) == Some(NodeKind::Derived) {
                self.clear_derived(store, version, &dep, visited)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("nodes", &self.inner.nodes.read().len())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::selector::Selector;

    #[test]
    fn test_duplicate_key_is_rejected() {
        let engine = Engine::new();
        Atom::new(&engine, "a", 1).unwrap();
        let err = Atom::new(&engine, "a", 2).unwrap_err();
        assert_eq!(err, EngineError::DuplicateKey { key: NodeKey::from("a") });
    }

    #[test]
    fn test_reregistration_replaces() {
        let engine = Engine::builder().allow_reregistration(true).build();
        Atom::new(&engine, "a", 1).unwrap();
        Selector::new(&engine, "a", |_| Ok(2)).unwrap();
        assert_eq!(engine.node_kind(&NodeKey::from("a")), Some(NodeKind::Derived));
    }

    #[test]
    fn test_write_rejects_derived() {
        let engine = Engine::new();
        let store = Store::new(&engine);
        let b = Selector::new(&engine, "b", |_| Ok(1)).unwrap();

        let err = engine
            .write(&store.current_version(), b.key(), Some(Loadable::resolved(2)))
            .unwrap_err();
        assert_eq!(err, EngineError::NotWritable { key: NodeKey::from("b") });
    }

    #[test]
    fn test_read_unregistered() {
        let engine = Engine::new();
        let store = Store::new(&engine);
        let err = engine
            .read(&store, &store.current_version(), &NodeKey::from("missing"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Unregistered { .. }));
    }

    #[test]
    fn test_write_same_container_is_empty() {
        let engine = Engine::new();
        let store = Store::new(&engine);
        let a = Atom::new(&engine, "a", 1).unwrap();
        let value = Loadable::resolved(5);

        let version = store.current_version();
        let writes = engine.write(&version, a.key(), Some(value.clone())).unwrap();
        engine.apply_writes(&store, &version, writes);

        let writes = engine.write(&version, a.key(), Some(value)).unwrap();
        assert!(writes.is_empty());
    }
}

//! Derived nodes and the evaluation engine behind them.
//!
//! Reading a derivation in a version goes through these steps:
//!
//! 1. A settled value already cached in the version is returned as is.
//! 2. A derivation already being evaluated on this thread is a cycle and reads
//!    as an errored [`NodeError::Cycle`], which is never memoized.
//! 3. The route cache is probed by resolving each dependency it asks about.
//! 4. An in-flight execution of the same store is reused if it was started in
//!    this version or if the dependencies it has read so far still hold the
//!    same values.
//! 5. Otherwise the getter runs. Dependencies are discovered as it reads them
//!    through [`Get`].
//!
//! A getter that reads a pending dependency or returns a future produces a
//! pending container. Awaiting it drives the execution: once the dependency
//! settles the route cache is probed again against the store's latest version
//! and, failing that, the getter is re-run; the result is memoized under the
//! route read by the final run and the store is notified through a commit.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use ahash::{HashMap, HashSet};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::cache::{tree_cache_from_policy, RouteValue, TreeCache};
use crate::engine::{Engine, NodeBody, NodeDef, NodeOptions};
use crate::error::{EngineError, NodeError};
use crate::key::{NodeHandle, NodeKey, NodeValue, Value};
use crate::loadable::{Loadable, Pending};
use crate::retention::Retainable;
use crate::state::{Version, VersionId};
use crate::store::{Store, StoreId, WeakStore};
use crate::tracer::EvaluationOutcome;

thread_local! {
    static EVAL_STACK: RefCell<Vec<NodeKey>> = const { RefCell::new(Vec::new()) };
}

/// Marks a derivation as being evaluated on this thread until dropped.
struct EvalFrame;

impl EvalFrame {
    /// Push `key`, or return the cycle path if it is already on the stack.
    fn enter(key: &NodeKey) -> Result<Self, Vec<NodeKey>> {
        EVAL_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().position(|k| k == key) {
                let mut path = stack[pos..].to_vec();
                path.push(key.clone());
                return Err(path);
            }
            stack.push(key.clone());
            Ok(EvalFrame)
        })
    }
}

impl Drop for EvalFrame {
    fn drop(&mut self) {
        EVAL_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Identifier of one evaluation of a derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutionId(pub u64);

/// Result of an asynchronous getter.
pub enum Computed<T> {
    /// The value is available now.
    Ready(T),
    /// The value arrives later.
    Future(BoxFuture<'static, Result<T, NodeError>>),
}

impl<T> Computed<T> {
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, NodeError>> + Send + 'static,
    {
        Computed::Future(future.boxed())
    }
}

impl<T: NodeValue> Computed<T> {
    fn erase(self) -> Computed<Value> {
        match self {
            Computed::Ready(value) => Computed::Ready(Value::new(value)),
            Computed::Future(future) => Computed::Future(future.map(|r| r.map(Value::new)).boxed()),
        }
    }
}

impl<T> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Computed::Ready(_) => f.write_str("Computed::Ready(..)"),
            Computed::Future(_) => f.write_str("Computed::Future(..)"),
        }
    }
}

type Getter = Arc<dyn Fn(&mut Get<'_>) -> Result<Computed<Value>, NodeError> + Send + Sync>;

type Route = Vec<(NodeKey, Loadable)>;

#[derive(Clone)]
struct Execution {
    id: ExecutionId,
    /// Dependencies read so far, in discovery order.
    route: Route,
    loadable: Loadable,
    /// Versions in which `route` is known to still hold.
    versions: HashSet<VersionId>,
}

pub(crate) struct DerivedDef {
    getter: Getter,
    cache: Mutex<TreeCache<Loadable>>,
    executions: Mutex<HashMap<StoreId, Execution>>,
}

impl DerivedDef {
    pub(crate) fn cache_size(&self) -> usize {
        self.cache.lock().size()
    }

    pub(crate) fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Drop the execution record of `store`, only if it belongs to
    /// `execution` when one is given.
    pub(crate) fn clear_execution(&self, store: StoreId, execution: Option<ExecutionId>) {
        // The record is dropped after the lock is released: its pending
        // future holds a retain guard that may call back into this map.
        let _removed = {
            let mut executions = self.executions.lock();
            match executions.get(&store) {
                Some(record) if execution.map_or(true, |id| record.id == id) => executions.remove(&store),
                _ => None,
            }
        };
    }

    fn update_execution(&self, store: StoreId, execution: ExecutionId, route: &Route, version: VersionId) {
        if let Some(record) = self.executions.lock().get_mut(&store) {
            if record.id == execution {
                record.route = route.clone();
                record.versions.clear();
                record.versions.insert(version);
            }
        }
    }
}

/// Dependency reader handed to getters.
///
/// Every node read through it becomes a dependency of the derivation being
/// evaluated, in the order it was first read.
pub struct Get<'a> {
    engine: &'a Engine,
    store: &'a Store,
    version: &'a Version,
    route: Route,
    uncacheable: bool,
}

impl<'a> Get<'a> {
    fn new(engine: &'a Engine, store: &'a Store, version: &'a Version) -> Self {
        Self {
            engine,
            store,
            version,
            route: Vec::new(),
            uncacheable: false,
        }
    }

    /// Read a dependency's value.
    ///
    /// A pending dependency yields [`NodeError::Suspend`]; propagate it with
    /// `?` and the getter is run again once the dependency settles.
    pub fn get<H: NodeHandle>(&mut self, node: &H) -> Result<Arc<H::Value>, NodeError> {
        let value = self.get_loadable(node).get()?;
        value.downcast::<H::Value>().ok_or_else(|| {
            self.uncacheable = true;
            NodeError::Fatal(EngineError::TypeMismatch {
                key: node.key().clone(),
                expected: std::any::type_name::<H::Value>(),
            })
        })
    }

    /// Read a dependency's container without failing on errors or pending
    /// values.
    pub fn get_loadable<H: NodeHandle>(&mut self, node: &H) -> Loadable {
        self.read(node.key())
    }

    /// Read a dependency by key.
    pub fn read(&mut self, key: &NodeKey) -> Loadable {
        match self.engine.read(self.store, self.version, key) {
            Ok(loadable) => {
                if loadable.error().is_some_and(NodeError::is_cycle) {
                    self.uncacheable = true;
                } else if !self.route.iter().any(|(dep, _)| dep == key) {
                    self.route.push((key.clone(), loadable.clone()));
                }
                loadable
            }
            Err(error) => {
                self.uncacheable = true;
                Loadable::Errored(NodeError::Fatal(error))
            }
        }
    }

    /// The version being read.
    pub fn version(&self) -> VersionId {
        self.version.version()
    }
}

/// Typed handle on a derived node.
///
/// # Example
///
/// ```ignore
/// use statebound::{Atom, Engine, Selector, Store};
///
/// let engine = Engine::new();
/// let a = Atom::new(&engine, "a", 1)?;
/// let doubled = Selector::new(&engine, "doubled", move |get| Ok(*get.get(&a)? * 2))?;
///
/// let store = Store::new(&engine);
/// assert_eq!(*store.get(&doubled)?, 2);
/// ```
pub struct Selector<T> {
    key: NodeKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T: NodeValue> Selector<T> {
    /// Register a synchronous derivation.
    pub fn new<F>(engine: &Engine, key: impl Into<NodeKey>, getter: F) -> Result<Self, EngineError>
    where
        F: Fn(&mut Get<'_>) -> Result<T, NodeError> + Send + Sync + 'static,
    {
        Self::with_options(engine, key, NodeOptions::default(), getter)
    }

    /// Register a synchronous derivation with options.
    pub fn with_options<F>(
        engine: &Engine,
        key: impl Into<NodeKey>,
        options: NodeOptions,
        getter: F,
    ) -> Result<Self, EngineError>
    where
        F: Fn(&mut Get<'_>) -> Result<T, NodeError> + Send + Sync + 'static,
    {
        let getter: Getter =
            Arc::new(move |get: &mut Get<'_>| getter(get).map(|value| Computed::Ready(Value::new(value))));
        Self::register(engine, key.into(), options, getter)
    }

    /// Register a derivation whose getter may return a future.
    pub fn new_async<F>(engine: &Engine, key: impl Into<NodeKey>, getter: F) -> Result<Self, EngineError>
    where
        F: Fn(&mut Get<'_>) -> Result<Computed<T>, NodeError> + Send + Sync + 'static,
    {
        Self::new_async_with_options(engine, key, NodeOptions::default(), getter)
    }

    /// Register a derivation whose getter may return a future, with options.
    pub fn new_async_with_options<F>(
        engine: &Engine,
        key: impl Into<NodeKey>,
        options: NodeOptions,
        getter: F,
    ) -> Result<Self, EngineError>
    where
        F: Fn(&mut Get<'_>) -> Result<Computed<T>, NodeError> + Send + Sync + 'static,
    {
        let getter: Getter = Arc::new(move |get: &mut Get<'_>| getter(get).map(Computed::erase));
        Self::register(engine, key.into(), options, getter)
    }

    fn register(
        engine: &Engine,
        key: NodeKey,
        options: NodeOptions,
        getter: Getter,
    ) -> Result<Self, EngineError> {
        let policy = options
            .get_cache_policy()
            .unwrap_or(engine.config().default_cache_policy);
        let derived = DerivedDef {
            getter,
            cache: Mutex::new(tree_cache_from_policy(policy)?),
            executions: Mutex::new(HashMap::default()),
        };
        engine.register(NodeDef {
            key: key.clone(),
            body: NodeBody::Derived(Arc::new(derived)),
            options,
            type_name: std::any::type_name::<T>(),
        })?;
        Ok(Self {
            key,
            _marker: PhantomData,
        })
    }
}

impl<T> Selector<T> {
    pub fn key(&self) -> &NodeKey {
        &self.key
    }
}

impl<T> Clone for Selector<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Selector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Selector").field(&self.key).finish()
    }
}

impl<T: NodeValue> NodeHandle for Selector<T> {
    type Value = T;

    fn key(&self) -> &NodeKey {
        &self.key
    }
}

pub(crate) fn read(
    engine: &Engine,
    store: &Store,
    version: &Version,
    key: &NodeKey,
    derived: &Arc<DerivedDef>,
) -> Result<Loadable, EngineError> {
    if let Some(loadable) = version.value(key) {
        return Ok(loadable);
    }

    let _frame = match EvalFrame::enter(key) {
        Ok(frame) => frame,
        Err(path) => {
            engine.tracer().on_cycle_detected(&path);
            return Ok(Loadable::Errored(NodeError::Cycle { path }));
        }
    };

    if let Some(loadable) = probe_cache(engine, store, version, key, derived)? {
        version.set_value(key.clone(), loadable.clone());
        return Ok(loadable);
    }
    if let Some(loadable) = probe_in_flight(engine, store, version, derived)? {
        return Ok(loadable);
    }

    let execution = engine.next_execution_id();
    evaluate(engine, store, version, key, derived, execution)
}

pub(crate) fn peek(
    engine: &Engine,
    store: &Store,
    version: &Version,
    key: &NodeKey,
    derived: &DerivedDef,
) -> Option<Loadable> {
    if let Some(loadable) = version.value(key) {
        return Some(loadable);
    }
    TreeCache::get_shared(
        &derived.cache,
        |dep| engine.peek(store, version, dep).ok_or(()),
        |_, _| {},
    )
    .ok()
    .flatten()
}

fn probe_cache(
    engine: &Engine,
    store: &Store,
    version: &Version,
    key: &NodeKey,
    derived: &DerivedDef,
) -> Result<Option<Loadable>, EngineError> {
    let mut visited = Vec::new();
    let hit = TreeCache::get_shared(
        &derived.cache,
        |dep| engine.read(store, version, dep),
        |dep, _| visited.push(dep.clone()),
    )?;
    engine.tracer().on_cache_check(store.id(), key, hit.is_some());
    if hit.is_some() {
        store.save_dependencies(version, key, visited);
    }
    Ok(hit)
}

fn probe_in_flight(
    engine: &Engine,
    store: &Store,
    version: &Version,
    derived: &DerivedDef,
) -> Result<Option<Loadable>, EngineError> {
    let Some(execution) = derived.executions.lock().get(&store.id()).cloned() else {
        return Ok(None);
    };
    if execution.versions.contains(&version.version()) {
        return Ok(Some(execution.loadable));
    }

    let equality = derived.cache.lock().equality();
    for (dep, seen) in &execution.route {
        let current = engine.read(store, version, dep)?;
        if RouteValue::from_loadable(&current, equality) != RouteValue::from_loadable(seen, equality) {
            return Ok(None);
        }
    }

    if let Some(record) = derived.executions.lock().get_mut(&store.id()) {
        if record.id == execution.id {
            record.versions.insert(version.version());
        }
    }
    Ok(Some(execution.loadable))
}

struct Evaluation {
    outcome: Result<Computed<Value>, NodeError>,
    route: Route,
    cacheable: bool,
}

fn run_getter(
    engine: &Engine,
    store: &Store,
    version: &Version,
    key: &NodeKey,
    derived: &DerivedDef,
    execution: ExecutionId,
) -> Evaluation {
    let tracer = engine.tracer();
    tracer.on_evaluate_start(store.id(), key, execution);

    let mut get = Get::new(engine, store, version);
    let outcome = (derived.getter)(&mut get);
    let Get {
        route, uncacheable, ..
    } = get;

    store.save_dependencies(version, key, route.iter().map(|(dep, _)| dep.clone()).collect());
    for (dep, _) in &route {
        tracer.on_dependency_registered(store.id(), key, dep);
    }
    tracer.on_evaluate_end(store.id(), key, execution, outcome_of(&outcome));

    let cacheable = !uncacheable && !matches!(outcome, Err(NodeError::Cycle { .. }));
    Evaluation {
        outcome,
        route,
        cacheable,
    }
}

fn outcome_of(outcome: &Result<Computed<Value>, NodeError>) -> EvaluationOutcome {
    match outcome {
        Ok(Computed::Ready(_)) => EvaluationOutcome::Resolved,
        Ok(Computed::Future(_)) | Err(NodeError::Suspend { .. }) => EvaluationOutcome::Pending,
        Err(NodeError::Cycle { .. }) => EvaluationOutcome::Cycle,
        Err(NodeError::Fatal(error)) => EvaluationOutcome::Fatal {
            message: error.to_string(),
        },
        Err(error) => EvaluationOutcome::Errored {
            message: error.to_string(),
        },
    }
}

/// Insert a settled result into the route cache.
fn memoize(engine: &Engine, key: &NodeKey, derived: &DerivedDef, route: &Route, loadable: &Loadable) -> Result<(), EngineError> {
    let inserted = derived.cache.lock().set(route, loadable.clone());
    match inserted {
        Ok(inserted) => {
            if let Some(changed) = &inserted.reset {
                engine.tracer().on_cache_reset(key, changed);
            }
            Ok(())
        }
        Err(_) => Err(EngineError::CacheConsistency { key: key.clone() }),
    }
}

fn evaluate(
    engine: &Engine,
    store: &Store,
    version: &Version,
    key: &NodeKey,
    derived: &Arc<DerivedDef>,
    execution: ExecutionId,
) -> Result<Loadable, EngineError> {
    let Evaluation {
        outcome,
        route,
        cacheable,
    } = run_getter(engine, store, version, key, derived, execution);

    let settled = match outcome {
        Ok(Computed::Ready(value)) => Loadable::Resolved(value),
        Ok(Computed::Future(future)) => {
            let step = Step::Future {
                future,
                route: route.clone(),
            };
            return Ok(start_pending(engine, store, version, key, derived, execution, route, step));
        }
        Err(NodeError::Suspend { pending }) => {
            let step = Step::Wait(pending);
            return Ok(start_pending(engine, store, version, key, derived, execution, route, step));
        }
        Err(NodeError::Fatal(error)) => return Err(error),
        Err(error) => Loadable::Errored(error),
    };

    if cacheable {
        memoize(engine, key, derived, &route, &settled)?;
        version.set_value(key.clone(), settled.clone());
    }
    Ok(settled)
}

enum Step {
    /// Waiting for a dependency to settle.
    Wait(Pending),
    /// Waiting for the getter's future; `route` is what the getter read before
    /// returning it.
    Future {
        future: BoxFuture<'static, Result<Value, NodeError>>,
        route: Route,
    },
}

enum Resumed {
    Settled(Result<Value, NodeError>),
    Pending(Step),
}

#[allow(clippy::too_many_arguments)]
fn start_pending(
    engine: &Engine,
    store: &Store,
    version: &Version,
    key: &NodeKey,
    derived: &Arc<DerivedDef>,
    execution: ExecutionId,
    route: Route,
    step: Step,
) -> Loadable {
    let guard = store.retain_guard(Retainable::Node(key.clone()));
    let driver = Driver {
        engine: engine.clone(),
        store: store.downgrade(),
        key: key.clone(),
        derived: derived.clone(),
        execution,
    };
    let loadable = Loadable::pending(async move {
        let _guard = guard;
        driver.run(step).await
    });

    let record = Execution {
        id: execution,
        route,
        loadable: loadable.clone(),
        versions: std::iter::once(version.version()).collect(),
    };
    let _previous = derived.executions.lock().insert(store.id(), record);
    loadable
}

/// Drives one pending execution to completion.
struct Driver {
    engine: Engine,
    store: WeakStore,
    key: NodeKey,
    derived: Arc<DerivedDef>,
    execution: ExecutionId,
}

impl Driver {
    async fn run(&self, mut step: Step) -> Result<Value, NodeError> {
        loop {
            step = match step {
                Step::Wait(pending) => {
                    // The dependency's outcome is observed when it is read again.
                    let _ = pending.future().await;
                    let store = self.live_store()?;
                    match self.resume(&store) {
                        Resumed::Settled(result) => return result,
                        Resumed::Pending(next) => next,
                    }
                }
                Step::Future { future, route } => {
                    let result = future.await;
                    let store = self.live_store()?;
                    match result {
                        Err(NodeError::Suspend { pending }) => Step::Wait(pending),
                        Err(NodeError::Fatal(error)) => {
                            let _ = self.finish(&store, &route, None);
                            return Err(NodeError::Fatal(error));
                        }
                        result => {
                            let settled = Loadable::from_result(result.clone());
                            let cacheable = !matches!(result, Err(NodeError::Cycle { .. }));
                            self.finish(&store, &route, cacheable.then_some(&settled))?;
                            return result;
                        }
                    }
                }
            };
        }
    }

    /// The store, if it can still receive the result.
    fn live_store(&self) -> Result<Store, NodeError> {
        match self.store.upgrade().filter(Store::is_live) {
            Some(store) => Ok(store),
            None => {
                self.derived.clear_execution(self.store.id(), Some(self.execution));
                self.engine
                    .tracer()
                    .on_execution_settled(self.store.id(), &self.key, self.execution, true);
                Err(NodeError::Cancelled)
            }
        }
    }

    /// Probe the cache against the latest version, then re-run the getter.
    fn resume(&self, store: &Store) -> Resumed {
        let (engine, key, derived) = (&self.engine, &self.key, &self.derived);
        let version = store.latest_version();
        let _frame = match EvalFrame::enter(key) {
            Ok(frame) => frame,
            Err(path) => return Resumed::Settled(Err(NodeError::Cycle { path })),
        };

        match probe_cache(engine, store, &version, key, derived) {
            Ok(Some(hit)) => {
                if let Err(error) = self.finish(store, &Vec::new(), None) {
                    return Resumed::Settled(Err(error));
                }
                return Resumed::Settled(hit.get());
            }
            Ok(None) => {}
            Err(error) => return Resumed::Settled(Err(NodeError::Fatal(error))),
        }

        let Evaluation {
            outcome,
            route,
            cacheable,
        } = run_getter(engine, store, &version, key, derived, self.execution);

        let result = match outcome {
            Ok(Computed::Ready(value)) => Ok(value),
            Ok(Computed::Future(future)) => {
                derived.update_execution(store.id(), self.execution, &route, version.version());
                return Resumed::Pending(Step::Future { future, route });
            }
            Err(NodeError::Suspend { pending }) => {
                derived.update_execution(store.id(), self.execution, &route, version.version());
                return Resumed::Pending(Step::Wait(pending));
            }
            Err(NodeError::Fatal(error)) => {
                let _ = self.finish(store, &route, None);
                return Resumed::Settled(Err(NodeError::Fatal(error)));
            }
            Err(error) => Err(error),
        };

        let settled = Loadable::from_result(result.clone());
        match self.finish(store, &route, cacheable.then_some(&settled)) {
            Ok(()) => Resumed::Settled(result),
            Err(error) => Resumed::Settled(Err(error)),
        }
    }

    /// Memoize the outcome if given, retire the execution record and notify
    /// the store.
    fn finish(&self, store: &Store, route: &Route, settled: Option<&Loadable>) -> Result<(), NodeError> {
        let memoized = match settled {
            Some(settled) => memoize(&self.engine, &self.key, &self.derived, route, settled),
            None => Ok(()),
        };
        self.derived.clear_execution(store.id(), Some(self.execution));
        self.engine
            .tracer()
            .on_execution_settled(store.id(), &self.key, self.execution, false);
        store.mark_modified(&self.key);
        memoized.map_err(NodeError::Fatal)
    }
}

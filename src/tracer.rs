//! Tracer trait for observing engine activity.
//!
//! The engine itself never logs. Every interesting transition is reported to
//! the [`Tracer`] installed through [`EngineBuilder::tracer`]; the default
//! [`NoopTracer`] ignores everything.
//!
//! With the `tracing` feature, [`TracingTracer`] forwards events to the
//! `tracing` crate.
//!
//! # Example
//!
//! ```ignore
//! use statebound::{Engine, NodeKey, Tracer};
//!
//! struct CycleReporter;
//!
//! impl Tracer for CycleReporter {
//!     fn on_cycle_detected(&self, path: &[NodeKey]) {
//!         eprintln!("cycle: {:?}", path);
//!     }
//! }
//!
//! let engine = Engine::builder().tracer(CycleReporter).build();
//! ```
//!
//! [`EngineBuilder::tracer`]: crate::EngineBuilder::tracer

use crate::cache::ChangedPath;
use crate::engine::NodeKind;
use crate::key::NodeKey;
use crate::selector::ExecutionId;
use crate::store::{Commit, StoreId};

/// How an evaluation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// The getter produced a value.
    Resolved,
    /// The getter is waiting on a pending dependency or future.
    Pending,
    /// The getter failed.
    Errored { message: String },
    /// The getter read a derivation that is already being evaluated.
    Cycle,
    /// An engine error aborted the evaluation.
    Fatal { message: String },
}

/// Observer of engine activity.
///
/// All methods have empty default implementations, so only the events of
/// interest need overriding.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: pending executions settle on
/// whichever thread polls them.
pub trait Tracer: Send + Sync + 'static {
    /// A node definition was registered.
    #[inline]
    fn on_node_registered(&self, _key: &NodeKey, _kind: NodeKind) {}

    /// A key was registered twice. `replaced` is true when the engine allows
    /// re-registration and the new definition took over.
    #[inline]
    fn on_duplicate_registration(&self, _key: &NodeKey, _replaced: bool) {}

    /// A derivation's route cache was consulted.
    #[inline]
    fn on_cache_check(&self, _store: StoreId, _key: &NodeKey, _hit: bool) {}

    /// A derivation getter is about to run.
    #[inline]
    fn on_evaluate_start(&self, _store: StoreId, _key: &NodeKey, _execution: ExecutionId) {}

    /// A derivation getter returned.
    #[inline]
    fn on_evaluate_end(
        &self,
        _store: StoreId,
        _key: &NodeKey,
        _execution: ExecutionId,
        _outcome: EvaluationOutcome,
    ) {
    }

    /// A dependency edge was recorded during evaluation.
    #[inline]
    fn on_dependency_registered(&self, _store: StoreId, _dependent: &NodeKey, _dependency: &NodeKey) {}

    /// A derivation read itself. `path` starts and ends with the same key.
    #[inline]
    fn on_cycle_detected(&self, _path: &[NodeKey]) {}

    /// A derivation's route cache was cleared because a route contradicted it.
    ///
    /// This happens when a getter reads its dependencies in a different order
    /// for the same values, or after a definition was replaced.
    #[inline]
    fn on_cache_reset(&self, _key: &NodeKey, _changed: &ChangedPath) {}

    /// A pending execution settled. `abandoned` is true if its store was no
    /// longer live and nothing was written.
    #[inline]
    fn on_execution_settled(
        &self,
        _store: StoreId,
        _key: &NodeKey,
        _execution: ExecutionId,
        _abandoned: bool,
    ) {
    }

    /// A node's state was reclaimed from a store.
    #[inline]
    fn on_node_released(&self, _store: StoreId, _key: &NodeKey) {}

    /// A store committed a new version.
    #[inline]
    fn on_commit(&self, _store: StoreId, _commit: &Commit) {}
}

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Forwards engine events to the `tracing` crate.
#[cfg(feature = "tracing")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

#[cfg(feature = "tracing")]
impl Tracer for TracingTracer {
    fn on_node_registered(&self, key: &NodeKey, kind: NodeKind) {
        tracing::trace!(key = %key, kind = ?kind, "node registered");
    }

    fn on_duplicate_registration(&self, key: &NodeKey, replaced: bool) {
        tracing::warn!(key = %key, replaced, "duplicate node registration");
    }

    fn on_cache_check(&self, store: StoreId, key: &NodeKey, hit: bool) {
        tracing::trace!(store = store.0, key = %key, hit, "cache check");
    }

    fn on_evaluate_start(&self, store: StoreId, key: &NodeKey, execution: ExecutionId) {
        tracing::trace!(store = store.0, key = %key, execution = execution.0, "evaluate start");
    }

    fn on_evaluate_end(
        &self,
        store: StoreId,
        key: &NodeKey,
        execution: ExecutionId,
        outcome: EvaluationOutcome,
    ) {
        tracing::debug!(
            store = store.0,
            key = %key,
            execution = execution.0,
            outcome = ?outcome,
            "evaluate end"
        );
    }

    fn on_dependency_registered(&self, store: StoreId, dependent: &NodeKey, dependency: &NodeKey) {
        tracing::trace!(store = store.0, dependent = %dependent, dependency = %dependency, "dependency");
    }

    fn on_cycle_detected(&self, path: &[NodeKey]) {
        tracing::warn!(path = ?path, "circular dependency detected");
    }

    fn on_cache_reset(&self, key: &NodeKey, changed: &ChangedPath) {
        tracing::warn!(key = %key, changed = %changed, "route cache reset");
    }

    fn on_execution_settled(
        &self,
        store: StoreId,
        key: &NodeKey,
        execution: ExecutionId,
        abandoned: bool,
    ) {
        tracing::debug!(
            store = store.0,
            key = %key,
            execution = execution.0,
            abandoned,
            "execution settled"
        );
    }

    fn on_node_released(&self, store: StoreId, key: &NodeKey) {
        tracing::debug!(store = store.0, key = %key, "node released");
    }

    fn on_commit(&self, store: StoreId, commit: &Commit) {
        tracing::debug!(
            store = store.0,
            version = commit.version.0,
            dirty = commit.dirty.len(),
            downstream = commit.downstream.len(),
            "commit"
        );
    }
}

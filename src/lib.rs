//! Statebound: a reactive, incremental state engine.
//!
//! State lives in named nodes registered with an [`Engine`]. Source nodes
//! ([`Atom`]) are set from outside; derived nodes ([`Selector`]) are computed
//! from other nodes by a getter whose dependencies are discovered as it runs.
//! A [`Store`] holds one isolated chain of versions over the engine's nodes.
//!
//! # Key Features
//!
//! - **Lazy memoization**: derivations run on first read and are cached per
//!   version and, across versions and stores, by the values of the
//!   dependencies they read (the route cache)
//! - **Async values**: every read yields a [`Loadable`] that is resolved,
//!   errored or pending; getters suspend on pending dependencies with `?`
//! - **Deduplicated work**: concurrent reads of a pending derivation in one
//!   store share a single execution
//! - **Reclamation**: node state no longer retained by observers or zones is
//!   released at commit
//! - **Observability**: every transition is reported to a [`Tracer`]
//!
//! # Example
//!
//! ```ignore
//! use statebound::{Atom, Engine, Selector, Store};
//!
//! let engine = Engine::new();
//! let a = Atom::new(&engine, "a", 1)?;
//! let b = Selector::new(&engine, "b", move |get| Ok(*get.get(&a)? * 2))?;
//!
//! let store = Store::new(&engine);
//! assert_eq!(*store.get(&b)?, 2);
//!
//! store.set(&a, 5)?;
//! assert_eq!(*store.get(&b)?, 10);
//! ```

mod atom;
pub mod cache;
mod engine;
mod error;
mod graph;
mod key;
mod loadable;
mod retention;
mod selector;
mod state;
mod store;
pub mod tracer;
mod version_map;

pub use atom::Atom;
pub use cache::{CachePolicy, Equality, Eviction};
pub use engine::{Engine, EngineBuilder, EngineConfig, NodeKind, NodeOptions, Writes};
pub use error::{EngineError, NodeError};
pub use graph::Graph;
pub use key::{DynEq, NodeHandle, NodeKey, NodeValue, Value};
pub use loadable::{Loadable, Pending, PendingFuture};
pub use retention::{RetainGuard, Retainable, RetainedBy, RetentionZone};
pub use selector::{Computed, ExecutionId, Get, Selector};
pub use state::{TreeState, Version, VersionId};
pub use store::{Commit, LivenessGuard, Store, StoreId, SubscriptionId, WeakStore};
pub use tracer::{EvaluationOutcome, NoopTracer, Tracer};
pub use version_map::VersionMap;

#[cfg(feature = "tracing")]
pub use tracer::TracingTracer;

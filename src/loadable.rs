//! The async value container every node read produces.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::NodeError;
use crate::key::{NodeValue, Value};

static NEXT_PENDING_ID: AtomicU64 = AtomicU64::new(1);

/// Shared future a pending container settles through.
pub type PendingFuture = Shared<BoxFuture<'static, Result<Value, NodeError>>>;

/// A value that has not settled yet.
///
/// Cloning shares the underlying future, so every clone observes the same
/// settlement. Each constructed pending value gets a process-unique id that
/// serves as its identity.
#[derive(Clone)]
pub struct Pending {
    id: u64,
    future: PendingFuture,
}

impl Pending {
    /// Wrap a future.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, NodeError>> + Send + 'static,
    {
        Self {
            id: NEXT_PENDING_ID.fetch_add(1, Ordering::Relaxed),
            future: future.boxed().shared(),
        }
    }

    /// Identity of this pending value.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// A handle on the shared future.
    pub fn future(&self) -> PendingFuture {
        self.future.clone()
    }

    /// The settled outcome, if the future has already completed.
    pub fn peek(&self) -> Option<Result<Value, NodeError>> {
        self.future.peek().cloned()
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").field("id", &self.id).finish()
    }
}

/// Tri-state result of reading a node.
#[derive(Debug, Clone)]
pub enum Loadable {
    /// The node has a value.
    Resolved(Value),
    /// Evaluating the node failed.
    Errored(NodeError),
    /// The node is still loading.
    Pending(Pending),
}

impl Loadable {
    /// A resolved container holding `value`.
    pub fn resolved<T: NodeValue>(value: T) -> Self {
        Loadable::Resolved(Value::new(value))
    }

    /// A pending container settling with the outcome of `future`.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, NodeError>> + Send + 'static,
    {
        Loadable::Pending(Pending::new(future))
    }

    /// Build a container from a settled outcome.
    pub fn from_result(result: Result<Value, NodeError>) -> Self {
        match result {
            Ok(value) => Loadable::Resolved(value),
            Err(NodeError::Suspend { pending }) => Loadable::Pending(pending),
            Err(error) => Loadable::Errored(error),
        }
    }

    /// Returns true if the container holds a value.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Loadable::Resolved(_))
    }

    /// Returns true if the container holds an error.
    pub fn is_errored(&self) -> bool {
        matches!(self, Loadable::Errored(_))
    }

    /// Returns true if the container is still loading.
    pub fn is_pending(&self) -> bool {
        matches!(self, Loadable::Pending(_))
    }

    /// The value, if resolved.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Loadable::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// The error, if errored.
    pub fn error(&self) -> Option<&NodeError> {
        match self {
            Loadable::Errored(error) => Some(error),
            _ => None,
        }
    }

    /// Get the value, the error, or the suspension signal.
    ///
    /// A pending container yields [`NodeError::Suspend`], which getters
    /// propagate with `?`.
    pub fn get(&self) -> Result<Value, NodeError> {
        match self {
            Loadable::Resolved(value) => Ok(value.clone()),
            Loadable::Errored(error) => Err(error.clone()),
            Loadable::Pending(pending) => Err(NodeError::Suspend {
                pending: pending.clone(),
            }),
        }
    }

    /// A future that settles with the value or the error.
    pub fn to_future(&self) -> BoxFuture<'static, Result<Value, NodeError>> {
        match self {
            Loadable::Resolved(value) => futures::future::ready(Ok(value.clone())).boxed(),
            Loadable::Errored(error) => futures::future::ready(Err(error.clone())).boxed(),
            Loadable::Pending(pending) => pending.future().boxed(),
        }
    }

    /// Chain `f` onto the value.
    ///
    /// Resolved containers run `f` immediately and return its container as is.
    /// Errored containers pass through untouched. Pending containers return a
    /// new pending container that applies `f` once the original settles and
    /// then waits for whatever `f` returned.
    pub fn map<F>(self, f: F) -> Loadable
    where
        F: FnOnce(Value) -> Loadable + Send + 'static,
    {
        match self {
            Loadable::Resolved(value) => f(value),
            Loadable::Errored(error) => Loadable::Errored(error),
            Loadable::Pending(pending) => {
                let future = pending.future();
                Loadable::pending(async move {
                    let value = future.await?;
                    f(value).to_future().await
                })
            }
        }
    }

    /// Identity comparison: same state and the very same contents.
    pub fn is(&self, other: &Loadable) -> bool {
        match (self, other) {
            (Loadable::Resolved(a), Loadable::Resolved(b)) => a.ptr_eq(b),
            (Loadable::Errored(a), Loadable::Errored(b)) => a.same_as(b),
            (Loadable::Pending(a), Loadable::Pending(b)) => a.id() == b.id(),
            _ => false,
        }
    }

    /// Replace a pending container whose future already settled by the settled
    /// container.
    pub fn normalize(self) -> Loadable {
        match self {
            Loadable::Pending(pending) => match pending.peek() {
                Some(result) => Loadable::from_result(result),
                None => Loadable::Pending(pending),
            },
            other => other,
        }
    }
}

impl From<Result<Value, NodeError>> for Loadable {
    fn from(result: Result<Value, NodeError>) -> Self {
        Loadable::from_result(result)
    }
}

//! Error types for node evaluation.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::key::NodeKey;
use crate::loadable::Pending;

/// Errors carried by an errored [`Loadable`](crate::Loadable) and returned by
/// dependency reads inside getters.
///
/// User errors can be propagated using the `?` operator, which automatically
/// converts any `Into<anyhow::Error>` type into `NodeError::User`.
#[derive(Debug, Clone)]
pub enum NodeError {
    /// A dependency is still pending.
    ///
    /// Returned by [`Get::get`](crate::Get::get) when the dependency has not
    /// settled yet. Propagate it with `?` and the engine resumes the getter once
    /// the dependency settles.
    Suspend {
        /// The pending dependency that caused the suspension.
        pending: Pending,
    },

    /// The derivation read itself, directly or through other derivations.
    Cycle {
        /// Keys of the derivations forming the cycle, outermost first.
        path: Vec<NodeKey>,
    },

    /// The execution was abandoned because its store stopped being live.
    Cancelled,

    /// An engine error happened while reading a dependency.
    ///
    /// Fatal errors are never memoized; the read that triggered them fails.
    Fatal(EngineError),

    /// User-defined error returned by a getter.
    User(Arc<anyhow::Error>),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Suspend { pending } => {
                write!(f, "evaluation suspended on pending value #{}", pending.id())
            }
            NodeError::Cycle { path } => {
                let path: Vec<&str> = path.iter().map(NodeKey::as_str).collect();
                write!(f, "circular dependency detected: {}", path.join(" -> "))
            }
            NodeError::Cancelled => write!(f, "execution cancelled"),
            NodeError::Fatal(e) => write!(f, "engine error: {}", e),
            NodeError::User(e) => write!(f, "user error: {}", e),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for NodeError {
    fn from(err: T) -> Self {
        NodeError::User(Arc::new(err.into()))
    }
}

impl NodeError {
    /// Returns a reference to the inner user error if this is a `User` variant.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            NodeError::User(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns true if this error signals a pending dependency.
    pub fn is_suspend(&self) -> bool {
        matches!(self, NodeError::Suspend { .. })
    }

    /// Returns true if this is a circular dependency error.
    pub fn is_cycle(&self) -> bool {
        matches!(self, NodeError::Cycle { .. })
    }

    /// Identity comparison: user errors are the same only if they share an
    /// allocation, pending errors only if they wait on the same pending value.
    pub fn same_as(&self, other: &NodeError) -> bool {
        match (self, other) {
            (NodeError::Suspend { pending: a }, NodeError::Suspend { pending: b }) => {
                a.id() == b.id()
            }
            (NodeError::Cycle { path: a }, NodeError::Cycle { path: b }) => a == b,
            (NodeError::Cancelled, NodeError::Cancelled) => true,
            (NodeError::Fatal(a), NodeError::Fatal(b)) => a == b,
            (NodeError::User(a), NodeError::User(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Hash consistent with [`NodeError::same_as`].
    pub(crate) fn hash_identity<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            NodeError::Suspend { pending } => pending.id().hash(state),
            NodeError::Cycle { path } => path.hash(state),
            NodeError::Cancelled => {}
            NodeError::Fatal(e) => e.hash(state),
            NodeError::User(e) => (Arc::as_ptr(e) as usize).hash(state),
        }
    }
}

/// Engine-level errors.
///
/// These are never stored in a [`Loadable`](crate::Loadable); they are
/// returned directly from the engine entry points.
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum EngineError {
    /// A read or write referenced a key that is not registered.
    #[error("node `{key}` is not registered")]
    Unregistered {
        /// The unknown key.
        key: NodeKey,
    },

    /// A node was registered under a key that is already taken.
    #[error("node `{key}` is already registered")]
    DuplicateKey {
        /// The duplicated key.
        key: NodeKey,
    },

    /// A write targeted a derived node.
    #[error("node `{key}` is derived and cannot be written")]
    NotWritable {
        /// The derived node's key.
        key: NodeKey,
    },

    /// A typed handle read a value of another type.
    #[error("node `{key}` does not hold a value of type `{expected}`")]
    TypeMismatch {
        /// The node's key.
        key: NodeKey,
        /// The type the handle expected.
        expected: &'static str,
    },

    /// The route cache contradicted itself again after a full reset.
    #[error("route cache of `{key}` is inconsistent after a reset")]
    CacheConsistency {
        /// The derivation owning the cache.
        key: NodeKey,
    },

    /// A cache policy could not be turned into a cache.
    #[error("invalid cache policy: {reason}")]
    InvalidCachePolicy {
        /// Why the policy was rejected.
        reason: &'static str,
    },
}

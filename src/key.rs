//! Node keys and type-erased node values.

use std::any::{Any, TypeId};
use std::borrow::Borrow;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Globally unique name of a registered node.
///
/// Clone is cheap as the string is shared.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeKey(Arc<str>);

impl NodeKey {
    /// Create a key from a string.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for NodeKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for NodeKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// Object-safe equality comparison.
///
/// Two values are equal only if they share the same concrete type.
pub trait DynEq: Any {
    /// Compare self with another value for equality.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Trait for types that can be held by a node.
///
/// This trait combines object-safe hashing, equality and debug formatting,
/// and is implemented for every `Hash + Eq + Debug + Send + Sync + 'static`
/// type. Hash and equality give the canonical (value) equality used by cache
/// policies; types whose natural equality depends on insertion order should be
/// stored in ordered collections (`BTreeMap`, `BTreeSet`).
pub trait NodeValue: DynHash + DynEq + Debug + Send + Sync {
    /// Get the value as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Convert a shared value into a shared `Any`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Get the type name of the value.
    fn type_name(&self) -> &'static str;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> NodeValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

dyn_hash::hash_trait_object!(NodeValue);

/// A type-erased, shared node value.
///
/// Clone only bumps a reference count, so two clones are the same value both
/// by reference and by content.
#[derive(Clone)]
pub struct Value(Arc<dyn NodeValue>);

impl Value {
    /// Wrap a concrete value.
    pub fn new<T: NodeValue>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcast to the concrete type, sharing the allocation.
    pub fn downcast<T: NodeValue>(&self) -> Option<Arc<T>> {
        self.0.clone().into_any().downcast::<T>().ok()
    }

    /// Borrow the concrete value.
    pub fn downcast_ref<T: NodeValue>(&self) -> Option<&T> {
        self.0.as_ref().as_any().downcast_ref::<T>()
    }

    /// Returns true if both values share the same allocation.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }

    /// Returns true if both values are of the same type and compare equal.
    pub fn value_eq(&self, other: &Value) -> bool {
        self.0.as_ref().dyn_eq(other.0.as_ref().as_any())
    }

    /// Address of the shared allocation, used for reference equality.
    pub(crate) fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Hash the content together with its concrete type.
    pub(crate) fn hash_content<H: Hasher>(&self, state: &mut H) {
        self.0.as_ref().as_any().type_id().hash(state);
        self.0.hash(state);
    }

    /// Get the type id of the concrete value.
    pub fn value_type_id(&self) -> TypeId {
        self.0.as_ref().as_any().type_id()
    }

    /// Get the type name of the concrete value.
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

/// A typed handle to a registered node.
///
/// Handles are cheap to clone and carry no state of their own; every read goes
/// through an [`Engine`](crate::Engine) and a [`Store`](crate::Store).
pub trait NodeHandle {
    /// The type of value held by the node.
    type Value: NodeValue;

    /// The key the node is registered under.
    fn key(&self) -> &NodeKey;
}

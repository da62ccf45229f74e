//! Source nodes: state cells set from outside the engine.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::engine::{Engine, NodeBody, NodeDef, NodeOptions};
use crate::error::{EngineError, NodeError};
use crate::key::{NodeHandle, NodeKey, NodeValue, Value};
use crate::loadable::Loadable;
use crate::state::Version;

type Validator = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

pub(crate) struct SourceDef {
    default: Loadable,
    validator: Validator,
}

/// Typed handle on a source node.
///
/// # Example
///
/// ```ignore
/// use statebound::{Atom, Engine, Store};
///
/// let engine = Engine::new();
/// let count = Atom::new(&engine, "count", 0)?;
///
/// let store = Store::new(&engine);
/// store.set(&count, 3)?;
/// assert_eq!(*store.get(&count)?, 3);
/// ```
pub struct Atom<T> {
    key: NodeKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T: NodeValue> Atom<T> {
    /// Register a source node with a default value.
    pub fn new(engine: &Engine, key: impl Into<NodeKey>, default: T) -> Result<Self, EngineError> {
        Self::with_options(engine, key, default, NodeOptions::default())
    }

    /// Register a source node with options.
    pub fn with_options(
        engine: &Engine,
        key: impl Into<NodeKey>,
        default: T,
        options: NodeOptions,
    ) -> Result<Self, EngineError> {
        Self::register(engine, key.into(), Loadable::resolved(default), Self::accept_same_type(), options)
    }

    /// Register a source node whose default is still loading.
    pub fn new_pending<F>(engine: &Engine, key: impl Into<NodeKey>, default: F) -> Result<Self, EngineError>
    where
        F: Future<Output = Result<T, NodeError>> + Send + 'static,
    {
        let default = Loadable::pending(async move { default.await.map(Value::new) });
        Self::register(engine, key.into(), default, Self::accept_same_type(), NodeOptions::default())
    }

    /// Register a source node that validates raw values set through
    /// [`Store::set_unvalidated`](crate::Store::set_unvalidated).
    ///
    /// Raw values are validated lazily, on first read; a raw value the
    /// validator rejects reads as the default.
    pub fn with_validator<F>(
        engine: &Engine,
        key: impl Into<NodeKey>,
        default: T,
        validator: F,
    ) -> Result<Self, EngineError>
    where
        F: Fn(&Value) -> Option<T> + Send + Sync + 'static,
    {
        let validator: Validator = Arc::new(move |raw: &Value| validator(raw).map(Value::new));
        Self::register(engine, key.into(), Loadable::resolved(default), validator, NodeOptions::default())
    }

    fn accept_same_type() -> Validator {
        Arc::new(|raw: &Value| raw.downcast_ref::<T>().is_some().then(|| raw.clone()))
    }

    fn register(
        engine: &Engine,
        key: NodeKey,
        default: Loadable,
        validator: Validator,
        options: NodeOptions,
    ) -> Result<Self, EngineError> {
        engine.register(NodeDef {
            key: key.clone(),
            body: NodeBody::Source(SourceDef { default, validator }),
            options,
            type_name: std::any::type_name::<T>(),
        })?;
        Ok(Self {
            key,
            _marker: PhantomData,
        })
    }
}

impl<T> Atom<T> {
    pub fn key(&self) -> &NodeKey {
        &self.key
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Atom").field(&self.key).finish()
    }
}

impl<T: NodeValue> NodeHandle for Atom<T> {
    type Value = T;

    fn key(&self) -> &NodeKey {
        &self.key
    }
}

pub(crate) fn read(version: &Version, node: &NodeDef, source: &SourceDef) -> Loadable {
    if let Some(value) = version.value(&node.key) {
        // A written pending value that has settled is replaced by its outcome.
        if let Loadable::Pending(pending) = &value {
            if let Some(result) = pending.peek() {
                let settled = Loadable::from_result(result);
                version.set_value(node.key.clone(), settled.clone());
                return settled;
            }
        }
        return value;
    }
    if let Some(raw) = version.remove_nonvalidated(&node.key) {
        if let Some(value) = (source.validator)(&raw) {
            let loadable = Loadable::Resolved(value);
            version.set_value(node.key.clone(), loadable.clone());
            return loadable;
        }
    }
    source.default.clone().normalize()
}

pub(crate) fn peek(version: &Version, node: &NodeDef, source: &SourceDef) -> Loadable {
    if let Some(value) = version.value(&node.key) {
        return value.normalize();
    }
    if let Some(value) = version
        .nonvalidated(&node.key)
        .and_then(|raw| (source.validator)(&raw))
    {
        return Loadable::Resolved(value);
    }
    source.default.clone().normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{TreeState, VersionId};

    fn def(engine: &Engine, key: &str) -> Arc<NodeDef> {
        engine.node(&NodeKey::from(key)).unwrap()
    }

    fn source(node: &NodeDef) -> &SourceDef {
        match &node.body {
            NodeBody::Source(source) => source,
            NodeBody::Derived(_) => panic!("not a source"),
        }
    }

    #[test]
    fn test_read_falls_back_to_default() {
        let engine = Engine::new();
        Atom::new(&engine, "a", 7).unwrap();
        let node = def(&engine, "a");
        let version = Arc::new(TreeState::new(VersionId(1)));

        let value = read(&version, &node, source(&node));
        assert_eq!(value.value().unwrap().downcast_ref::<i32>(), Some(&7));
    }

    #[test]
    fn test_unvalidated_values_are_validated_once() {
        let engine = Engine::new();
        Atom::with_validator(&engine, "port", 80u16, |raw| {
            raw.downcast_ref::<String>().and_then(|s| s.parse().ok())
        })
        .unwrap();
        let node = def(&engine, "port");
        let version = Arc::new(TreeState::new(VersionId(1)));

        version.set_nonvalidated(NodeKey::from("port"), Value::new(String::from("8080")));
        assert_eq!(
            peek(&version, &node, source(&node)).value().unwrap().downcast_ref::<u16>(),
            Some(&8080)
        );
        let value = read(&version, &node, source(&node));
        assert_eq!(value.value().unwrap().downcast_ref::<u16>(), Some(&8080));
        assert!(version.nonvalidated(&NodeKey::from("port")).is_none());
        assert!(version.has_value(&NodeKey::from("port")));

        version.remove_value(&NodeKey::from("port"));
        version.set_nonvalidated(NodeKey::from("port"), Value::new(String::from("nope")));
        let value = read(&version, &node, source(&node));
        assert_eq!(value.value().unwrap().downcast_ref::<u16>(), Some(&80));
    }

    #[test]
    fn test_settled_pending_value_is_written_back() {
        let engine = Engine::new();
        Atom::new(&engine, "a", 1).unwrap();
        let node = def(&engine, "a");
        let version = Arc::new(TreeState::new(VersionId(1)));

        let pending = Loadable::pending(async { Ok(Value::new(5)) });
        version.set_value(NodeKey::from("a"), pending.clone());
        assert!(read(&version, &node, source(&node)).is_pending());

        futures::executor::block_on(pending.to_future()).unwrap();
        assert!(peek(&version, &node, source(&node)).is_resolved());
        let value = read(&version, &node, source(&node));
        assert_eq!(value.value().unwrap().downcast_ref::<i32>(), Some(&5));
        assert!(version.value(&NodeKey::from("a")).unwrap().is_resolved());
    }

    #[test]
    fn test_unvalidated_value_of_wrong_type_reads_default() {
        let engine = Engine::new();
        Atom::new(&engine, "a", 1i32).unwrap();
        let node = def(&engine, "a");
        let version = Arc::new(TreeState::new(VersionId(1)));

        version.set_nonvalidated(NodeKey::from("a"), Value::new("text"));
        let value = read(&version, &node, source(&node));
        assert_eq!(value.value().unwrap().downcast_ref::<i32>(), Some(&1));
    }
}

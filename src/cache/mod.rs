//! Memoization caches and the policy surface that selects them.
//!
//! Two shapes share one policy record:
//!
//! - flat key to value caches ([`MapCache`], [`LruCache`]), built by
//!   [`cache_from_policy`];
//! - the route-keyed trie ([`TreeCache`]) derivations memoize into, built by
//!   [`tree_cache_from_policy`].
//!
//! The [`Equality`] of a policy decides how values are compared: by
//! reference (same allocation) or canonically (same type and equal content).

mod lru;
mod map;
mod tree;

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::EngineError;
use crate::key::Value;

pub use lru::LruCache;
pub use map::MapCache;
pub use tree::{ChangedPath, Inserted, RouteValue, TreeCache, TrieCursor, TrieNodeId, TrieStep};

/// How two values are compared when used as cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Equality {
    /// Same allocation.
    Reference,
    /// Same concrete type and equal content.
    #[default]
    Value,
}

/// Which entries a bounded cache drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Eviction {
    /// Never evict.
    #[default]
    KeepAll,
    /// Evict the least recently used entry once `max_size` is exceeded.
    Lru,
    /// Keep only the latest entry.
    MostRecent,
}

/// Cache policy of a derivation or a flat cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CachePolicy {
    pub equality: Equality,
    pub eviction: Eviction,
    /// Required by [`Eviction::Lru`], ignored otherwise.
    pub max_size: Option<usize>,
}

impl CachePolicy {
    /// Unbounded cache with value equality.
    pub fn keep_all() -> Self {
        Self::default()
    }

    /// LRU cache holding at most `max_size` entries.
    pub fn lru(max_size: usize) -> Self {
        Self {
            eviction: Eviction::Lru,
            max_size: Some(max_size),
            ..Self::default()
        }
    }

    /// Cache holding only the latest entry.
    pub fn most_recent() -> Self {
        Self {
            eviction: Eviction::MostRecent,
            ..Self::default()
        }
    }

    /// Use the given equality.
    pub fn with_equality(mut self, equality: Equality) -> Self {
        self.equality = equality;
        self
    }

    /// The entry bound the policy resolves to, `None` if unbounded.
    pub fn bound(&self) -> Result<Option<usize>, EngineError> {
        match self.eviction {
            Eviction::KeepAll => Ok(None),
            Eviction::MostRecent => Ok(Some(1)),
            Eviction::Lru => match self.max_size {
                Some(0) => Err(EngineError::InvalidCachePolicy {
                    reason: "lru eviction requires a positive max_size",
                }),
                Some(max) => Ok(Some(max)),
                None => Err(EngineError::InvalidCachePolicy {
                    reason: "lru eviction requires max_size",
                }),
            },
        }
    }
}

/// Maps cache keys to the keys actually stored.
pub trait KeyMapper<K>: Send + Sync {
    /// The stored key.
    type Mapped: Hash + Eq + Clone + Send;

    fn map_key(&self, key: &K) -> Self::Mapped;
}

/// Stores keys as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl<K: Hash + Eq + Clone + Send> KeyMapper<K> for Identity {
    type Mapped = K;

    fn map_key(&self, key: &K) -> K {
        key.clone()
    }
}

impl KeyMapper<Value> for Equality {
    type Mapped = ValueKey;

    fn map_key(&self, key: &Value) -> ValueKey {
        match self {
            Equality::Reference => ValueKey::Reference(key.clone()),
            Equality::Value => ValueKey::Canonical(key.clone()),
        }
    }
}

/// A value wrapped with the equality it is compared under.
#[derive(Clone)]
pub enum ValueKey {
    /// Compared and hashed by allocation.
    Reference(Value),
    /// Compared and hashed by type and content.
    Canonical(Value),
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ValueKey::Reference(a), ValueKey::Reference(b)) => a.ptr_eq(b),
            (ValueKey::Canonical(a), ValueKey::Canonical(b)) => a.value_eq(b),
            _ => false,
        }
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ValueKey::Reference(v) => {
                0u8.hash(state);
                v.address().hash(state);
            }
            ValueKey::Canonical(v) => {
                1u8.hash(state);
                v.hash_content(state);
            }
        }
    }
}

impl fmt::Debug for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKey::Reference(v) => write!(f, "&{:?}", v),
            ValueKey::Canonical(v) => write!(f, "{:?}", v),
        }
    }
}

/// A flat key to value cache.
pub trait Cache<K, V>: Send {
    /// Look up `key`. Bounded caches count this as a use.
    fn get(&mut self, key: &K) -> Option<&V>;

    /// Insert or replace `key`, evicting if a bound is exceeded.
    fn set(&mut self, key: K, value: V);

    /// Remove `key`, returning whether it was present.
    fn delete(&mut self, key: &K) -> bool;

    fn clear(&mut self);

    fn size(&self) -> usize;
}

/// Build a flat value-keyed cache from a policy.
pub fn cache_from_policy<V: Send + 'static>(
    policy: CachePolicy,
) -> Result<Box<dyn Cache<Value, V>>, EngineError> {
    Ok(match policy.bound()? {
        None => Box::new(MapCache::with_mapper(policy.equality)),
        Some(max) => Box::new(LruCache::with_mapper(max, policy.equality)),
    })
}

/// Build a route-keyed trie cache from a policy.
pub fn tree_cache_from_policy<T>(policy: CachePolicy) -> Result<TreeCache<T>, EngineError> {
    Ok(TreeCache::new(policy.equality, policy.bound()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_requires_max_size() {
        let policy = CachePolicy {
            eviction: Eviction::Lru,
            ..CachePolicy::default()
        };
        assert!(matches!(
            cache_from_policy::<i32>(policy),
            Err(EngineError::InvalidCachePolicy { .. })
        ));
        assert!(tree_cache_from_policy::<i32>(CachePolicy::lru(0)).is_err());
    }

    #[test]
    fn test_reference_equality() {
        let policy = CachePolicy::keep_all().with_equality(Equality::Reference);
        let mut cache = cache_from_policy::<&str>(policy).unwrap();
        let x = Value::new(vec![1, 2]);
        cache.set(x.clone(), "hit");

        assert_eq!(cache.get(&x), Some(&"hit"));
        assert_eq!(cache.get(&Value::new(vec![1, 2])), None);
    }

    #[test]
    fn test_value_equality_is_the_default() {
        let mut cache = cache_from_policy::<&str>(CachePolicy::default()).unwrap();
        let x = Value::new(vec![1, 2]);
        cache.set(x.clone(), "hit");

        assert_eq!(cache.get(&x), Some(&"hit"));
        assert_eq!(cache.get(&Value::new(vec![1, 2])), Some(&"hit"));
        assert_eq!(cache.get(&Value::new(vec![2, 1])), None);
    }

    #[test]
    fn test_value_equality_is_order_insensitive_for_ordered_collections() {
        use std::collections::{BTreeMap, BTreeSet};

        let policy = CachePolicy::keep_all().with_equality(Equality::Value);
        let mut cache = cache_from_policy::<u8>(policy).unwrap();

        let a: BTreeMap<&str, i32> = [("x", 1), ("y", 2)].into_iter().collect();
        let b: BTreeMap<&str, i32> = [("y", 2), ("x", 1)].into_iter().collect();
        cache.set(Value::new(a), 1);
        assert_eq!(cache.get(&Value::new(b)), Some(&1));

        let s1: BTreeSet<i32> = [3, 1, 2].into_iter().collect();
        let s2: BTreeSet<i32> = [1, 2, 3].into_iter().collect();
        cache.set(Value::new(s1), 2);
        assert_eq!(cache.get(&Value::new(s2)), Some(&2));
    }

    #[test]
    fn test_most_recent_keeps_one() {
        let mut cache = cache_from_policy::<i32>(CachePolicy::most_recent()).unwrap();
        let a = Value::new(1);
        let b = Value::new(2);
        cache.set(a.clone(), 1);
        cache.set(b.clone(), 2);

        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get(&a), None);
        assert_eq!(cache.get(&b), Some(&2));
    }

    #[test]
    fn test_clear_empty_is_noop() {
        let mut cache = cache_from_policy::<i32>(CachePolicy::lru(2)).unwrap();
        cache.clear();
        cache.clear();
        assert_eq!(cache.size(), 0);
    }
}

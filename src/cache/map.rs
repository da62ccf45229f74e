use ahash::HashMap;

use super::{Cache, Identity, KeyMapper};

/// Unbounded cache.
pub struct MapCache<K, V, M: KeyMapper<K> = Identity> {
    mapper: M,
    entries: HashMap<M::Mapped, V>,
    _key: std::marker::PhantomData<fn(&K)>,
}

impl<K, V> MapCache<K, V, Identity>
where
    Identity: KeyMapper<K>,
{
    pub fn new() -> Self {
        Self::with_mapper(Identity)
    }
}

impl<K, V> Default for MapCache<K, V, Identity>
where
    Identity: KeyMapper<K>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, M: KeyMapper<K>> MapCache<K, V, M> {
    pub fn with_mapper(mapper: M) -> Self {
        Self {
            mapper,
            entries: HashMap::default(),
            _key: std::marker::PhantomData,
        }
    }
}

impl<K, V: Send, M: KeyMapper<K>> Cache<K, V> for MapCache<K, V, M> {
    fn get(&mut self, key: &K) -> Option<&V> {
        self.entries.get(&self.mapper.map_key(key))
    }

    fn set(&mut self, key: K, value: V) {
        self.entries.insert(self.mapper.map_key(&key), value);
    }

    fn delete(&mut self, key: &K) -> bool {
        self.entries.remove(&self.mapper.map_key(key)).is_some()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn size(&self) -> usize {
        self.entries.len()
    }
}

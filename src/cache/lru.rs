use ahash::HashMap;
use slab::Slab;

use super::{Cache, Identity, KeyMapper};

struct Entry<K, V> {
    key: K,
    value: V,
    /// Towards the most recently used end.
    prev: Option<usize>,
    /// Towards the least recently used end.
    next: Option<usize>,
}

/// Bounded cache evicting the least recently used entry.
///
/// Entries live in a slab and are threaded through an intrusive doubly linked
/// list ordered from most to least recently used.
pub struct LruCache<K, V, M: KeyMapper<K> = Identity> {
    mapper: M,
    max_size: usize,
    index: HashMap<M::Mapped, usize>,
    entries: Slab<Entry<M::Mapped, V>>,
    head: Option<usize>,
    tail: Option<usize>,
    _key: std::marker::PhantomData<fn(&K)>,
}

impl<K, V> LruCache<K, V, Identity>
where
    Identity: KeyMapper<K>,
{
    pub fn new(max_size: usize) -> Self {
        Self::with_mapper(max_size, Identity)
    }
}

impl<K, V, M: KeyMapper<K>> LruCache<K, V, M> {
    /// A cache holding at most `max_size` entries (at least one).
    pub fn with_mapper(max_size: usize, mapper: M) -> Self {
        Self {
            mapper,
            max_size: max_size.max(1),
            index: HashMap::default(),
            entries: Slab::new(),
            head: None,
            tail: None,
            _key: std::marker::PhantomData,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The least recently used key.
    pub fn tail(&self) -> Option<&M::Mapped> {
        self.tail.map(|id| &self.entries[id].key)
    }

    /// Look up without counting as a use.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let id = *self.index.get(&self.mapper.map_key(key))?;
        Some(&self.entries[id].value)
    }

    /// Mark `key` as most recently used. Returns false if absent.
    pub fn touch(&mut self, key: &K) -> bool {
        match self.index.get(&self.mapper.map_key(key)) {
            Some(&id) => {
                self.promote(id);
                true
            }
            None => false,
        }
    }

    /// Insert or replace `key` as the most recently used entry.
    ///
    /// Returns the entry evicted to stay within the bound.
    pub fn insert(&mut self, key: K, value: V) -> Option<(M::Mapped, V)> {
        let mapped = self.mapper.map_key(&key);
        if let Some(&id) = self.index.get(&mapped) {
            self.entries[id].value = value;
            self.promote(id);
            return None;
        }

        let id = self.entries.insert(Entry {
            key: mapped.clone(),
            value,
            prev: None,
            next: None,
        });
        self.index.insert(mapped, id);
        self.push_front(id);

        match self.tail {
            Some(tail) if self.entries.len() > self.max_size => Some(self.remove_id(tail)),
            _ => None,
        }
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let id = *self.index.get(&self.mapper.map_key(key))?;
        Some(self.remove_id(id).1)
    }

    fn remove_id(&mut self, id: usize) -> (M::Mapped, V) {
        self.unlink(id);
        let entry = self.entries.remove(id);
        self.index.remove(&entry.key);
        (entry.key, entry.value)
    }

    fn promote(&mut self, id: usize) {
        if self.head != Some(id) {
            self.unlink(id);
            self.push_front(id);
        }
    }

    fn push_front(&mut self, id: usize) {
        self.entries[id].prev = None;
        self.entries[id].next = self.head;
        if let Some(head) = self.head {
            self.entries[head].prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn unlink(&mut self, id: usize) {
        let (prev, next) = (self.entries[id].prev, self.entries[id].next);
        match prev {
            Some(prev) => self.entries[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.entries[next].prev = prev,
            None => self.tail = prev,
        }
        self.entries[id].prev = None;
        self.entries[id].next = None;
    }
}

impl<K, V: Send, M: KeyMapper<K>> Cache<K, V> for LruCache<K, V, M> {
    fn get(&mut self, key: &K) -> Option<&V> {
        let id = *self.index.get(&self.mapper.map_key(key))?;
        self.promote(id);
        Some(&self.entries[id].value)
    }

    fn set(&mut self, key: K, value: V) {
        self.insert(key, value);
    }

    fn delete(&mut self, key: &K) -> bool {
        self.remove(key).is_some()
    }

    fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
        self.head = None;
        self.tail = None;
    }

    fn size(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_recently_set() {
        let mut cache: LruCache<&str, i32> = LruCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);

        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.get(&"b").is_some());
        assert!(cache.get(&"c").is_some());

        // "b" was read before "c", so "b" is now the least recently used.
        cache.set("a", 1);
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get(&"b"), None);
        assert!(cache.get(&"a").is_some());
        assert!(cache.get(&"c").is_some());
    }

    #[test]
    fn test_get_protects_from_eviction() {
        let mut cache: LruCache<&str, i32> = LruCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.get(&"a");

        let evicted = cache.insert("c", 3);
        assert_eq!(evicted, Some(("b", 2)));
        assert_eq!(cache.peek(&"a"), Some(&1));
    }

    #[test]
    fn test_replace_does_not_evict() {
        let mut cache: LruCache<&str, i32> = LruCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.insert("a", 10), None);
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.tail(), Some(&"b"));
    }

    #[test]
    fn test_delete_relinks() {
        let mut cache: LruCache<&str, i32> = LruCache::new(3);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);

        assert!(cache.delete(&"b"));
        assert!(!cache.delete(&"b"));
        assert_eq!(cache.tail(), Some(&"a"));
        assert!(cache.delete(&"a"));
        assert_eq!(cache.tail(), Some(&"c"));
        assert!(cache.delete(&"c"));
        assert!(cache.is_empty());
        assert_eq!(cache.tail(), None);
    }
}

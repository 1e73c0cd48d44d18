//! Bounded, insertion-ordered set of recently processed keys.
//!
//! Used by the member to skip mailbox peers it has already read, and to
//! remember decided sessions. When full, the least recently inserted entry
//! is evicted; re-inserting an entry refreshes it.

use std::hash::Hash;

use indexmap::IndexMap;

#[derive(Debug)]
pub struct SeenCache<K, V = ()> {
    entries: IndexMap<K, V>,
    capacity: usize,
}

impl<K: Hash + Eq, V> SeenCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.entries.shift_remove(&key);
        self.entries.insert(key, value);
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Hash + Eq> SeenCache<K, ()> {
    pub fn mark(&mut self, key: K) {
        self.insert(key, ());
    }
}

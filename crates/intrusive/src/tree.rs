//! Keyed, duplicate-free ordered map built on [`std::collections::BTreeMap`]
//! rather than a hand-rolled red-black tree; see DESIGN.md for the tradeoff.
//! Insertion never silently overwrites: callers that must treat a duplicate
//! key as a bug can check the returned `Option` for `Some(_)`.

use std::collections::BTreeMap;

pub struct KeyedTree<K, V> {
    map: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for KeyedTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> KeyedTree<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts `key -> value`. Returns the previous value, if `key` was
    /// already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    #[must_use]
    pub fn find(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    #[must_use]
    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }
}

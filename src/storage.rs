//! Last-known-good value storage.

use std::collections::HashMap;
use std::sync::Arc;

use crate::key::CacheKey;

/// Map from key to the last known good value.
///
/// Unbounded and without eviction: entries live until removed, overwritten or
/// cleared. Storage never publishes; callers pair every write with a channel
/// publish under the same lock.
pub(crate) struct Storage<K, T> {
    entries: HashMap<K, Arc<T>>,
}

impl<K: CacheKey, T> Default for Storage<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey, T> Storage<K, T> {
    /// Create a new empty storage.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Get a cached value if present.
    pub fn get(&self, key: &K) -> Option<Arc<T>> {
        self.entries.get(key).cloned()
    }

    /// Insert a value, returning the previous one.
    pub fn set(&mut self, key: K, value: Arc<T>) -> Option<Arc<T>> {
        self.entries.insert(key, value)
    }

    /// Remove a value, returning it if it was present.
    pub fn remove(&mut self, key: &K) -> Option<Arc<T>> {
        self.entries.remove(key)
    }

    /// Remove every value, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let len = self.entries.len();
        self.entries.clear();
        len
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

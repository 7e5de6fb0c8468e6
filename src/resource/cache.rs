use std::collections::HashMap;
use std::hash::Hash;

/// Keyed cache that loads each value at most once.
pub struct ResourceCache<K, V> {
    items: HashMap<K, V>,
}

impl<K: Eq + Hash, V: Clone> ResourceCache<K, V> {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.items.get(key)
    }

    /// Returns the cached value or runs `load`. A failed load caches nothing.
    pub fn get_or_try_load<F, E>(&mut self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        if let Some(value) = self.items.get(&key) {
            return Ok(value.clone());
        }
        let value = load(&key)?;
        self.items.insert(key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<K: Eq + Hash, V: Clone> Default for ResourceCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

//! Render cache shared by scripts and request handlers.
//!
//! Scripts reach it through `server.cacheGet(key)` and
//! `server.cacheSet(key, value)`. The cache has a fixed capacity; when it is
//! full new keys are refused and existing keys can still be overwritten.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug)]
pub struct RenderCache {
    entries: RwLock<HashMap<String, String>>,
    capacity: usize,
}

impl RenderCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Stores `value` under `key`. Returns false when the cache is full.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            tracing::debug!(key = %key, capacity = self.capacity, "Render cache full, entry not stored");
            return false;
        }
        entries.insert(key, value.into());
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = RenderCache::new(4);
        assert!(cache.insert("/index", "<h1>hi</h1>"));
        assert_eq!(cache.get("/index").as_deref(), Some("<h1>hi</h1>"));
        assert_eq!(cache.get("/missing"), None);
    }

    #[test]
    fn test_full_cache_refuses_new_keys_but_overwrites() {
        let cache = RenderCache::new(1);
        assert!(cache.insert("a", "1"));
        assert!(!cache.insert("b", "2"));
        assert!(cache.insert("a", "3"));
        assert_eq!(cache.get("a").as_deref(), Some("3"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache = RenderCache::new(0);
        assert!(!cache.insert("a", "1"));
        assert!(cache.is_empty());
    }
}

//! Bounded cache of query embeddings keyed by (table, text).
//!
//! Eviction is by insertion order: when full, the oldest entry goes first.
//! Re-inserting an existing key refreshes its value but not its position.

use std::collections::VecDeque;

use ahash::AHashMap;
use parking_lot::Mutex;

type CacheKey = (String, String);

#[derive(Debug, Default)]
struct Inner {
    entries: AHashMap<CacheKey, Vec<f32>>,
    order: VecDeque<CacheKey>,
}

#[derive(Debug)]
pub struct EmbeddingCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        EmbeddingCache {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn get(&self, table: &str, text: &str) -> Option<Vec<f32>> {
        self.inner
            .lock()
            .entries
            .get(&(table.to_string(), text.to_string()))
            .cloned()
    }

    pub fn insert(&self, table: &str, text: &str, embedding: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        let key = (table.to_string(), text.to_string());
        let mut inner = self.inner.lock();
        if inner.entries.insert(key.clone(), embedding).is_none() {
            inner.order.push_back(key);
        }
        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_eviction() {
        let cache = EmbeddingCache::new(2);
        cache.insert("t", "a", vec![1.0]);
        cache.insert("t", "b", vec![2.0]);
        // Reading does not refresh position.
        assert!(cache.get("t", "a").is_some());
        cache.insert("t", "c", vec![3.0]);

        assert!(cache.get("t", "a").is_none());
        assert_eq!(cache.get("t", "b"), Some(vec![2.0]));
        assert_eq!(cache.get("t", "c"), Some(vec![3.0]));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_keys_are_per_table() {
        let cache = EmbeddingCache::new(10);
        cache.insert("a", "hello", vec![1.0]);
        assert!(cache.get("b", "hello").is_none());
    }

    #[test]
    fn test_reinsert_keeps_position() {
        let cache = EmbeddingCache::new(2);
        cache.insert("t", "a", vec![1.0]);
        cache.insert("t", "b", vec![2.0]);
        cache.insert("t", "a", vec![9.0]);
        cache.insert("t", "c", vec![3.0]);
        assert!(cache.get("t", "a").is_none());
        assert!(cache.get("t", "b").is_some());
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache = EmbeddingCache::new(0);
        cache.insert("t", "a", vec![1.0]);
        assert!(cache.is_empty());
    }
}

//! In-memory cache tier
//!
//! Bounded LRU over decoded values. All operations are internally
//! synchronized; callers never observe a partially evicted state.

use crate::error::{CacheError, Result};
use crate::lru::LruList;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct MemoryCache<V> {
    entries: Mutex<LruList<Arc<V>>>,
    capacity: u64,
}

impl<V> MemoryCache<V> {
    /// Create a memory tier bounded to `capacity` bytes of value footprint.
    pub fn new(capacity: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(CacheError::Config(
                "memory capacity must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            entries: Mutex::new(LruList::new()),
            capacity,
        })
    }

    /// Get a value, marking it most recently used.
    pub async fn get(&self, key: &str) -> Option<Arc<V>> {
        let mut entries = self.entries.lock().await;
        entries.get(key).cloned()
    }

    /// Insert or replace a value, then evict least-recently-used entries
    /// until the tier is back within capacity.
    ///
    /// A value whose size alone exceeds the capacity is rejected with
    /// [`CacheError::ValueTooLarge`] and nothing is evicted.
    pub async fn put(&self, key: &str, value: Arc<V>, size: u64) -> Result<()> {
        if size > self.capacity {
            return Err(CacheError::ValueTooLarge { size, capacity: self.capacity });
        }
        let mut entries = self.entries.lock().await;
        entries.insert(key, size, value);
        while entries.total_size() > self.capacity {
            if let Some((evicted, evicted_size, _)) = entries.pop_oldest() {
                debug!(key = %evicted, size = evicted_size, "Evicted memory entry");
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Remove a value, returning it if present.
    pub async fn remove(&self, key: &str) -> Option<Arc<V>> {
        let mut entries = self.entries.lock().await;
        entries.remove(key).map(|(_, value)| value)
    }

    /// Drop every entry.
    pub async fn evict_all(&self) {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        entries.clear();
        debug!(count, "Evicted all memory entries");
    }

    /// Sum of entry sizes currently held.
    pub async fn current_size(&self) -> u64 {
        self.entries.lock().await.total_size()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            MemoryCache::<Vec<u8>>::new(0),
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = MemoryCache::new(1024).unwrap();
        cache.put("k", Arc::new(b"hello".to_vec()), 5).await.unwrap();
        let value = cache.get("k").await.unwrap();
        assert_eq!(*value, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_miss_returns_none() {
        let cache = MemoryCache::<Vec<u8>>::new(1024).unwrap();
        assert!(cache.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let cache = MemoryCache::new(30).unwrap();
        for i in 0..10 {
            cache
                .put(&format!("k{}", i), Arc::new(vec![0u8; 10]), 10)
                .await
                .unwrap();
            assert!(cache.current_size().await <= 30);
        }
    }

    #[tokio::test]
    async fn test_strict_lru_survivors() {
        let cache = MemoryCache::new(30).unwrap();
        cache.put("a", Arc::new(()), 10).await.unwrap();
        cache.put("b", Arc::new(()), 10).await.unwrap();
        cache.put("c", Arc::new(()), 10).await.unwrap();
        // Touch "a", then insert "d": "b" is the LRU entry and must go
        cache.get("a").await;
        cache.put("d", Arc::new(()), 10).await.unwrap();
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
        assert!(cache.get("d").await.is_some());
    }

    #[tokio::test]
    async fn test_oversized_put_is_noop() {
        let cache = MemoryCache::new(10).unwrap();
        cache.put("small", Arc::new(()), 5).await.unwrap();
        let result = cache.put("big", Arc::new(()), 11).await;
        assert!(matches!(
            result,
            Err(CacheError::ValueTooLarge { size: 11, capacity: 10 })
        ));
        // Existing entries were not evicted to make room
        assert!(cache.get("small").await.is_some());
        assert!(cache.get("big").await.is_none());
        assert_eq!(cache.current_size().await, 5);
    }

    #[tokio::test]
    async fn test_replace_updates_size() {
        let cache = MemoryCache::new(100).unwrap();
        cache.put("k", Arc::new(()), 40).await.unwrap();
        cache.put("k", Arc::new(()), 10).await.unwrap();
        assert_eq!(cache.current_size().await, 10);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let cache = MemoryCache::new(100).unwrap();
        cache.put("k", Arc::new(7u32), 4).await.unwrap();
        assert_eq!(cache.remove("k").await.map(|v| *v), Some(7));
        assert!(cache.get("k").await.is_none());
        assert!(cache.remove("k").await.is_none());
        assert_eq!(cache.current_size().await, 0);
    }

    #[tokio::test]
    async fn test_evict_all() {
        let cache = MemoryCache::new(100).unwrap();
        cache.put("a", Arc::new(()), 10).await.unwrap();
        cache.put("b", Arc::new(()), 10).await.unwrap();
        cache.evict_all().await;
        assert_eq!(cache.len().await, 0);
        assert_eq!(cache.current_size().await, 0);
    }
}

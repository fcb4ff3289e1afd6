//! Two-tier cache coordination
//!
//! Owns the memory and disk tiers, runs disk-tier initialization in the
//! background, serializes conflicting writes per key, and implements the
//! promotion (disk to memory) and write-through policies.

use crate::disk::DiskCache;
use crate::error::{CacheError, Result};
use crate::format::format_size;
use crate::key::cache_key;
use crate::memory::MemoryCache;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Caller-supplied conversion between stored bytes and in-memory values.
///
/// The disk tier stores the encoded byte stream; the memory tier stores the
/// decoded value, accounted by [`size_of`](Codec::size_of).
pub trait Codec: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Value>;
    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>>;
    /// In-memory byte footprint of a decoded value.
    fn size_of(&self, value: &Self::Value) -> u64;
}

/// Disk tier lifecycle. `Ready(None)` is the degraded state: the open failed
/// and the cache keeps serving memory-only.
enum DiskState {
    Uninitialized,
    Initializing,
    Ready(Option<Arc<DiskCache>>),
}

/// Statistics about both tiers
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_size: u64,
    pub disk_entries: usize,
    pub disk_size: u64,
    pub hits: u64,
    pub misses: u64,
}

pub struct TieredCache<C: Codec> {
    codec: C,
    memory: OnceLock<MemoryCache<C::Value>>,
    disk: Arc<watch::Sender<DiskState>>,
    /// Per-key sections so two callers for the same key cannot both fetch
    /// from origin and double-write.
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<C: Codec> TieredCache<C> {
    pub fn new(codec: C) -> Self {
        let (disk, _) = watch::channel(DiskState::Uninitialized);
        let disk = Arc::new(disk);
        Self {
            codec,
            memory: OnceLock::new(),
            disk,
            key_locks: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Initialize the memory tier. Must be called exactly once.
    pub fn init_memory(&self, capacity_bytes: u64) -> Result<()> {
        let memory = MemoryCache::new(capacity_bytes)?;
        self.memory
            .set(memory)
            .map_err(|_| CacheError::Config("memory tier already initialized".to_string()))?;
        info!(capacity_bytes, "Memory tier initialized");
        Ok(())
    }

    /// Initialize the disk tier in the background. Must be called exactly
    /// once; capacity problems fail fast, everything else degrades.
    ///
    /// Calls that touch the disk tier suspend until the background open
    /// finishes. An open failure leaves the cache in a degraded, memory-only
    /// state rather than failing those calls.
    pub fn init_disk(
        &self,
        directory: impl Into<PathBuf>,
        schema_version: u32,
        capacity_bytes: u64,
    ) -> Result<()> {
        if capacity_bytes == 0 {
            return Err(CacheError::Config(
                "disk capacity must be non-zero".to_string(),
            ));
        }
        let claimed = self.disk.send_if_modified(|state| {
            if matches!(state, DiskState::Uninitialized) {
                *state = DiskState::Initializing;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(CacheError::Config(
                "disk tier already initialized".to_string(),
            ));
        }

        let tx = self.disk.clone();
        let dir = directory.into();
        tokio::spawn(async move {
            let opened = match DiskCache::open(&dir, schema_version, capacity_bytes).await {
                Ok(disk) => {
                    info!(dir = ?dir, schema_version, capacity_bytes, "Disk tier ready");
                    Some(Arc::new(disk))
                }
                Err(e) => {
                    warn!(dir = ?dir, error = %e, "Disk tier unavailable, running memory-only");
                    None
                }
            };
            let _ = tx.send(DiskState::Ready(opened));
        });
        Ok(())
    }

    /// Derive the cache key for an origin identifier.
    pub fn normalize_key(&self, origin_id: &str) -> String {
        cache_key(origin_id)
    }

    /// Look up a value by its cache key.
    ///
    /// Checks memory first; on a miss, waits for the disk tier and promotes
    /// a disk hit into memory. Disk failures are treated as misses.
    pub async fn get(&self, key: &str) -> Result<Option<Arc<C::Value>>> {
        let memory = self.memory()?;
        if let Some(value) = memory.get(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Memory hit");
            return Ok(Some(value));
        }

        let Some(disk) = self.disk_ready().await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        match disk.get(key).await {
            Ok(Some(bytes)) => match self.codec.decode(&bytes) {
                Ok(value) => {
                    let value = Arc::new(value);
                    self.promote(key, &value).await;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Disk hit");
                    Ok(Some(value))
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to decode cached value, dropping");
                    if let Err(re) = disk.remove(key).await {
                        warn!(key = %key, error = %re, "Failed to drop undecodable entry");
                    }
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    Ok(None)
                }
            },
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => {
                // Miss-equivalent for the caller, surfaced only in logs
                warn!(key = %key, error = %e, "Disk read failed");
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Look up by origin identifier, fetching from origin on a total miss.
    ///
    /// Holds an exclusive per-key section around the check-fetch-populate
    /// sequence, so concurrent callers for one key fetch at most once; late
    /// arrivals observe the already-populated cache. A producer failure
    /// populates nothing and yields `None`. Cancelling (dropping) this future
    /// releases the section; any writes already committed stay in place.
    pub async fn get_or_fetch<F, Fut>(&self, origin_id: &str, fetch: F) -> Result<Option<Arc<C::Value>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>>,
    {
        let key = self.normalize_key(origin_id);
        if let Some(value) = self.get(&key).await? {
            return Ok(Some(value));
        }

        let lock = self.key_lock(&key).await;
        let result = {
            let _guard = lock.lock().await;
            // Re-check: another caller may have populated while we waited
            if let Some(value) = self.get(&key).await? {
                Ok(Some(value))
            } else {
                match fetch().await {
                    Ok(bytes) => match self.codec.decode(&bytes) {
                        Ok(value) => {
                            let value = Arc::new(value);
                            self.store(&key, &value, &bytes).await?;
                            Ok(Some(value))
                        }
                        Err(e) => {
                            warn!(origin_id, error = %e, "Fetched bytes failed to decode");
                            Ok(None)
                        }
                    },
                    Err(e) => {
                        warn!(origin_id, error = %e, "Origin fetch failed");
                        Ok(None)
                    }
                }
            }
        };
        self.prune_key_lock(&key, lock).await;
        result
    }

    /// Write a value through to both tiers.
    ///
    /// The tiers are independent: a disk failure does not roll back the
    /// memory insert, and a value too large for memory may still be written
    /// to disk. If the disk tier already holds a clean entry for the key the
    /// disk write is skipped.
    ///
    /// Returns whether the memory tier accepted the value; `Ok(false)` means
    /// it exceeded the memory capacity and only the disk write (if any) took
    /// effect.
    pub async fn put(&self, key: &str, value: C::Value) -> Result<bool> {
        let value = Arc::new(value);
        match self.codec.encode(&value) {
            Ok(bytes) => self.store(key, &value, &bytes).await,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode value, caching in memory only");
                Ok(self.promote(key, &value).await)
            }
        }
    }

    /// Remove a key from both tiers. Absence in either tier is not an error.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.memory()?.remove(key).await;
        if let Some(disk) = self.disk_ready().await {
            if let Err(e) = disk.remove(key).await {
                warn!(key = %key, error = %e, "Failed to remove disk entry");
            }
        }
        Ok(())
    }

    /// Flush the disk journal and evict all memory entries. On-disk values
    /// are kept.
    pub async fn clear(&self) -> Result<()> {
        if let Some(disk) = self.disk_ready().await {
            if let Err(e) = disk.flush().await {
                warn!(error = %e, "Failed to flush journal");
            }
        }
        self.memory()?.evict_all().await;
        Ok(())
    }

    /// Human-readable disk tier size, e.g. `"3.50MB"`.
    pub async fn size_report(&self) -> String {
        match self.disk_ready().await {
            Some(disk) => format_size(disk.total_size().await),
            None => format_size(0),
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let (memory_entries, memory_size) = match self.memory.get() {
            Some(memory) => (memory.len().await, memory.current_size().await),
            None => (0, 0),
        };
        // Peek rather than wait: stats must not suspend on disk init
        let disk = match &*self.disk.borrow() {
            DiskState::Ready(disk) => disk.clone(),
            _ => None,
        };
        let (disk_entries, disk_size) = match disk {
            Some(disk) => (disk.len().await, disk.total_size().await),
            None => (0, 0),
        };
        CacheStats {
            memory_entries,
            memory_size,
            disk_entries,
            disk_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn memory(&self) -> Result<&MemoryCache<C::Value>> {
        self.memory
            .get()
            .ok_or_else(|| CacheError::Config("memory tier not initialized".to_string()))
    }

    /// Wait until the disk tier has finished initializing. Returns `None` in
    /// the degraded state. Cancellation-safe: dropping the future stops the
    /// wait without affecting the initializer.
    async fn disk_ready(&self) -> Option<Arc<DiskCache>> {
        let mut rx = self.disk.subscribe();
        loop {
            if let DiskState::Ready(disk) = &*rx.borrow_and_update() {
                return disk.clone();
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Insert into memory. A value too large for the memory tier is not an
    /// error, just a refused insert.
    async fn promote(&self, key: &str, value: &Arc<C::Value>) -> bool {
        let size = self.codec.size_of(value);
        if let Some(memory) = self.memory.get() {
            match memory.put(key, value.clone(), size).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(key = %key, error = %e, "Value not cached in memory");
                }
            }
        }
        false
    }

    /// Write-through: memory insert plus best-effort disk write. Returns the
    /// memory-tier outcome.
    async fn store(&self, key: &str, value: &Arc<C::Value>, bytes: &[u8]) -> Result<bool> {
        self.memory()?;
        let resident = self.promote(key, value).await;

        let Some(disk) = self.disk_ready().await else {
            return Ok(resident);
        };
        match disk.begin_write(key).await {
            Ok(Some(mut editor)) => {
                let written = async {
                    editor.write_all(bytes).await?;
                    editor.commit().await
                }
                .await;
                if let Err(e) = written {
                    warn!(key = %key, error = %e, "Failed to write disk entry");
                }
            }
            Ok(None) => {
                // Already clean or a write is in flight; skip the redundant IO
                debug!(key = %key, "Skipping disk write for existing entry");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to begin disk write");
            }
        }
        Ok(resident)
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn prune_key_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.key_locks.lock().await;
        if let Some(entry) = locks.get(key) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Identity codec over raw bytes.
    struct BytesCodec;

    impl Codec for BytesCodec {
        type Value = Vec<u8>;

        fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
            Ok(bytes.to_vec())
        }

        fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
            Ok(value.clone())
        }

        fn size_of(&self, value: &Vec<u8>) -> u64 {
            value.len() as u64
        }
    }

    async fn ready_cache(dir: &std::path::Path) -> TieredCache<BytesCodec> {
        let cache = TieredCache::new(BytesCodec);
        cache.init_memory(1024 * 1024).unwrap();
        cache.init_disk(dir.to_path_buf(), 1, 1024 * 1024).unwrap();
        cache
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempdir().unwrap();
        let cache = ready_cache(dir.path()).await;
        let key = cache.normalize_key("https://example.com/a.png");

        cache.put(&key, b"image bytes".to_vec()).await.unwrap();
        let value = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(*value, b"image bytes".to_vec());
    }

    #[tokio::test]
    async fn test_get_uninitialized_memory_is_config_error() {
        let cache = TieredCache::new(BytesCodec);
        assert!(matches!(cache.get("k").await, Err(CacheError::Config(_))));
    }

    #[tokio::test]
    async fn test_init_memory_twice_fails() {
        let cache = TieredCache::new(BytesCodec);
        cache.init_memory(1024).unwrap();
        assert!(matches!(
            cache.init_memory(1024),
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_init_disk_twice_fails() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(BytesCodec);
        cache.init_memory(1024).unwrap();
        cache.init_disk(dir.path().to_path_buf(), 1, 1024).unwrap();
        assert!(matches!(
            cache.init_disk(dir.path().to_path_buf(), 1, 1024),
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_init_disk_zero_capacity_fails_fast() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(BytesCodec);
        cache.init_memory(1024).unwrap();
        assert!(matches!(
            cache.init_disk(dir.path().to_path_buf(), 1, 0),
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_promotion_from_disk_after_memory_eviction() {
        let dir = tempdir().unwrap();
        let cache = ready_cache(dir.path()).await;
        let key = cache.normalize_key("https://example.com/a.png");
        cache.put(&key, b"promoted bytes".to_vec()).await.unwrap();

        // clear() evicts memory but keeps disk entries
        cache.clear().await.unwrap();
        let stats = cache.stats().await;
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_entries, 1);

        let value = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(*value, b"promoted bytes".to_vec());
        // The hit promoted the value back into memory
        assert_eq!(cache.stats().await.memory_entries, 1);
    }

    #[tokio::test]
    async fn test_remove_from_both_tiers() {
        let dir = tempdir().unwrap();
        let cache = ready_cache(dir.path()).await;
        let key = cache.normalize_key("https://example.com/a.png");
        cache.put(&key, b"data".to_vec()).await.unwrap();

        cache.remove(&key).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_entries, 0);
        // Removing an absent key is not an error
        cache.remove(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_or_fetch_fetches_once_per_key() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ready_cache(dir.path()).await);
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("https://example.com/shared.png", move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        Ok(b"origin bytes".to_vec())
                    })
                    .await
                    .unwrap()
                    .unwrap()
            }));
        }
        for task in tasks {
            let value = task.await.unwrap();
            assert_eq!(*value, b"origin bytes".to_vec());
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_fetch_producer_failure_populates_nothing() {
        let dir = tempdir().unwrap();
        let cache = ready_cache(dir.path()).await;

        let result = cache
            .get_or_fetch("https://example.com/broken.png", || async {
                Err("origin returned 500".into())
            })
            .await
            .unwrap();
        assert!(result.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_entries, 0);
    }

    #[tokio::test]
    async fn test_concurrent_same_key_puts_stay_consistent() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ready_cache(dir.path()).await);
        let key = cache.normalize_key("https://example.com/contended.png");

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let cache = cache.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                cache.put(&key, vec![i; 64]).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Some previously-put value survives, never a torn one
        let value = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(value.len(), 64);
        assert!(value.iter().all(|b| *b == value[0]));

        let stats = cache.stats().await;
        assert_eq!(stats.disk_entries, 1);
        assert_eq!(stats.disk_size, 64);
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.memory_size, 64);
    }

    #[tokio::test]
    async fn test_degraded_disk_serves_memory_only() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-directory");
        std::fs::write(&blocker, b"file in the way").unwrap();

        let cache = TieredCache::new(BytesCodec);
        cache.init_memory(1024).unwrap();
        // Opening a directory over an existing file fails; the cache degrades
        cache.init_disk(blocker.join("cache"), 1, 1024).unwrap();

        let key = cache.normalize_key("https://example.com/a.png");
        cache.put(&key, b"memory only".to_vec()).await.unwrap();
        let value = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(*value, b"memory only".to_vec());
        assert_eq!(cache.size_report().await, "0B");
    }

    #[tokio::test]
    async fn test_disk_wait_suspends_and_survives_dropped_waiters() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(BytesCodec);
        cache.init_memory(1024).unwrap();
        let key = cache.normalize_key("https://example.com/a.png");

        // Before init_disk a memory miss suspends on readiness rather than
        // failing or returning
        let waiting = tokio::time::timeout(Duration::from_millis(50), cache.get(&key)).await;
        assert!(waiting.is_err());

        // Drop another waiter mid-initialization; the background open must
        // still reach readiness for later callers
        cache.init_disk(dir.path().to_path_buf(), 1, 1024).unwrap();
        let _ = tokio::time::timeout(Duration::ZERO, cache.get(&key)).await;

        cache.put(&key, b"late arrival".to_vec()).await.unwrap();
        let value = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(*value, b"late arrival".to_vec());
        assert_eq!(cache.stats().await.disk_entries, 1);
    }

    #[tokio::test]
    async fn test_oversized_put_reported_non_fatally() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(BytesCodec);
        cache.init_memory(16).unwrap();
        cache.init_disk(dir.path().to_path_buf(), 1, 1024).unwrap();
        let key = cache.normalize_key("https://example.com/big.png");

        // Too large for memory; refused there but still written through
        assert!(!cache.put(&key, vec![0u8; 64]).await.unwrap());
        let stats = cache.stats().await;
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_entries, 1);
        let value = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(value.len(), 64);

        let small = cache.normalize_key("https://example.com/small.png");
        assert!(cache.put(&small, vec![1u8; 4]).await.unwrap());
    }

    #[tokio::test]
    async fn test_size_report_formats_disk_total() {
        let dir = tempdir().unwrap();
        let cache = ready_cache(dir.path()).await;
        assert_eq!(cache.size_report().await, "0B");

        let key = cache.normalize_key("https://example.com/a.png");
        cache.put(&key, vec![0u8; 512]).await.unwrap();
        assert_eq!(cache.size_report().await, "512.00B");
    }

    #[tokio::test]
    async fn test_repeated_put_skips_disk_write() {
        let dir = tempdir().unwrap();
        let cache = ready_cache(dir.path()).await;
        let key = cache.normalize_key("https://example.com/a.png");

        cache.put(&key, b"original".to_vec()).await.unwrap();
        cache.put(&key, b"replaced-in-memory".to_vec()).await.unwrap();

        // Memory holds the newer value; disk kept the first clean entry
        let value = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(*value, b"replaced-in-memory".to_vec());
        assert_eq!(cache.stats().await.disk_size, 8);
    }

    #[tokio::test]
    async fn test_hit_miss_counters() {
        let dir = tempdir().unwrap();
        let cache = ready_cache(dir.path()).await;
        let key = cache.normalize_key("https://example.com/a.png");

        assert!(cache.get(&key).await.unwrap().is_none());
        cache.put(&key, b"data".to_vec()).await.unwrap();
        cache.get(&key).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_stats_serializes() {
        let stats = CacheStats {
            memory_entries: 2,
            memory_size: 128,
            disk_entries: 5,
            disk_size: 4096,
            hits: 10,
            misses: 3,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("4096"));
        assert!(json.contains("\"hits\":10"));
    }
}

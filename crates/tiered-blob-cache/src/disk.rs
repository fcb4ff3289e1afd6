//! Persistent disk cache tier
//!
//! Values are stored one file per key, named by the cache key. An append-only
//! journal records `DIRTY`/`CLEAN`/`REMOVE` operations so the in-memory index
//! and total size can be rebuilt after a restart or crash. Writes are
//! two-phase: bytes go to a `.tmp` file first and `commit` atomically renames
//! it into place, so readers can never observe a half-written value.
//!
//! A single `DiskCache` instance must exclusively own its directory;
//! concurrent instances over the same directory are unsupported.

use crate::error::{CacheError, Result};
use crate::lru::LruList;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const JOURNAL_FILE: &str = "journal";
const JOURNAL_TMP_FILE: &str = "journal.tmp";
const MAGIC: &str = "tiered-blob-cache";
const JOURNAL_FORMAT: &str = "1";

/// Journal records that did not survive as live entries. Once there are this
/// many (and at least as many as live entries) the journal is rewritten.
const COMPACT_THRESHOLD: u64 = 2000;

struct DiskInner {
    /// Clean entries only; payload-free, the node carries key and size.
    entries: LruList<()>,
    journal: File,
    redundant_ops: u64,
}

pub struct DiskCache {
    dir: PathBuf,
    capacity: u64,
    schema_version: u32,
    inner: Mutex<DiskInner>,
    /// Keys with a write in flight. A std mutex so `Editor::drop` can clean
    /// up without an async context. Lock order: `inner` before `dirty`.
    dirty: std::sync::Mutex<HashSet<String>>,
}

impl DiskCache {
    /// Open (or create) a disk cache over `dir`.
    ///
    /// Replays the journal to rebuild the index and total size. A journal
    /// whose version marker differs from `schema_version`, or one that cannot
    /// be parsed, wipes the directory and starts empty.
    pub async fn open(dir: &Path, schema_version: u32, max_bytes: u64) -> Result<Self> {
        if max_bytes == 0 {
            return Err(CacheError::Config(
                "disk capacity must be non-zero".to_string(),
            ));
        }
        fs::create_dir_all(dir).await?;

        let journal_path = dir.join(JOURNAL_FILE);
        let mut entries = LruList::new();
        if fs::try_exists(&journal_path).await? {
            match Self::replay(dir, schema_version).await {
                Ok(replayed) => {
                    entries = replayed;
                    info!(
                        dir = ?dir,
                        entries = entries.len(),
                        total_size = entries.total_size(),
                        "Replayed disk cache journal"
                    );
                }
                Err(e) => {
                    warn!(dir = ?dir, error = %e, "Discarding unusable disk cache");
                    Self::wipe(dir).await?;
                }
            }
        }

        // Rewriting on open drops stale records and leftover DIRTY lines
        Self::write_journal(dir, schema_version, &entries).await?;
        Self::sweep_orphans(dir, &entries).await?;
        let journal = OpenOptions::new().append(true).open(&journal_path).await?;

        let cache = Self {
            dir: dir.to_path_buf(),
            capacity: max_bytes,
            schema_version,
            inner: Mutex::new(DiskInner { entries, journal, redundant_ops: 0 }),
            dirty: std::sync::Mutex::new(HashSet::new()),
        };
        cache.evict_to_capacity().await;
        Ok(cache)
    }

    /// Read the full value for `key`.
    ///
    /// Recency is only updated once the read has completed successfully; a
    /// failed read drops the entry from the index and surfaces the error.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Self::check_key(key)?;
        let mut inner = self.inner.lock().await;
        if !inner.entries.contains(key) {
            return Ok(None);
        }
        match fs::read(self.value_path(key)).await {
            Ok(data) => {
                inner.entries.touch(key);
                Ok(Some(data))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cached file, dropping entry");
                inner.entries.remove(key);
                let record = format!("REMOVE {}\n", key);
                if let Err(je) = Self::append(&mut inner.journal, &record).await {
                    warn!(key = %key, error = %je, "Failed to journal entry removal");
                }
                inner.redundant_ops += 2;
                Err(e.into())
            }
        }
    }

    /// Whether a clean entry exists for `key`. Does not touch recency.
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.entries.contains(key)
    }

    /// Begin a two-phase write for `key`.
    ///
    /// Returns `None` when the key already has a clean entry or another write
    /// for it is in flight. Otherwise a `DIRTY` record is journaled and the
    /// returned [`Editor`] accepts the value bytes.
    pub async fn begin_write(&self, key: &str) -> Result<Option<Editor<'_>>> {
        Self::check_key(key)?;
        {
            let mut inner = self.inner.lock().await;
            if inner.entries.contains(key) {
                return Ok(None);
            }
            {
                let mut dirty = self.dirty.lock().expect("dirty set poisoned");
                if !dirty.insert(key.to_string()) {
                    return Ok(None);
                }
            }
            let record = format!("DIRTY {}\n", key);
            if let Err(e) = Self::append(&mut inner.journal, &record).await {
                self.clear_dirty(key);
                return Err(e.into());
            }
        }

        let tmp_path = self.tmp_path(key);
        let file = match File::create(&tmp_path).await {
            Ok(file) => file,
            Err(e) => {
                self.clear_dirty(key);
                return Err(e.into());
            }
        };
        Ok(Some(Editor {
            cache: self,
            key: key.to_string(),
            tmp_path,
            file: Some(file),
            written: 0,
            finished: false,
        }))
    }

    /// Remove the entry for `key`, deleting its backing file.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        Self::check_key(key)?;
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(key).is_none() {
            return Ok(false);
        }
        let record = format!("REMOVE {}\n", key);
        Self::append(&mut inner.journal, &record).await?;
        inner.redundant_ops += 2;
        if let Err(e) = fs::remove_file(self.value_path(key)).await {
            warn!(key = %key, error = %e, "Failed to delete cached file");
        }
        debug!(key = %key, "Removed disk entry");
        self.maybe_compact(&mut inner).await;
        Ok(true)
    }

    /// Sum of clean entry sizes.
    pub async fn total_size(&self) -> u64 {
        self.inner.lock().await.entries.total_size()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Force journal durability.
    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.journal.flush().await?;
        inner.journal.sync_data().await?;
        Ok(())
    }

    /// Keys become value file names and space-delimited journal tokens, so
    /// they must be plain single path components: a path separator would
    /// escape the cache directory and whitespace would corrupt the journal.
    fn check_key(key: &str) -> Result<()> {
        let safe = !key.is_empty()
            && key != "."
            && key != ".."
            && key != JOURNAL_FILE
            && !key.ends_with(".tmp")
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
        if safe {
            Ok(())
        } else {
            Err(CacheError::Config(format!("invalid cache key: {:?}", key)))
        }
    }

    /// Append a record and push it to the OS so it survives the handle
    /// being dropped without a final flush.
    async fn append(journal: &mut File, record: &str) -> std::io::Result<()> {
        journal.write_all(record.as_bytes()).await?;
        journal.flush().await
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.tmp", key))
    }

    fn clear_dirty(&self, key: &str) {
        let mut dirty = self.dirty.lock().expect("dirty set poisoned");
        dirty.remove(key);
    }

    /// Parse the journal and rebuild the clean-entry index.
    async fn replay(dir: &Path, schema_version: u32) -> Result<LruList<()>> {
        let text = fs::read_to_string(dir.join(JOURNAL_FILE)).await?;
        let mut lines = text.lines();

        let magic = lines.next().unwrap_or_default();
        let format = lines.next().unwrap_or_default();
        let version = lines.next().unwrap_or_default();
        let blank = lines.next().unwrap_or_default();
        if magic != MAGIC || format != JOURNAL_FORMAT || !blank.is_empty() {
            return Err(CacheError::JournalCorrupt(format!(
                "unexpected header: {:?} {:?}",
                magic, format
            )));
        }
        if version != schema_version.to_string() {
            // Schema changes invalidate old data rather than migrating it
            return Err(CacheError::JournalCorrupt(format!(
                "schema version changed from {} to {}",
                version, schema_version
            )));
        }

        let mut entries = LruList::new();
        let mut pending: HashSet<String> = HashSet::new();
        for line in lines {
            let mut parts = line.split(' ');
            let op = parts.next().unwrap_or_default();
            let key = parts.next().unwrap_or_default();
            if key.is_empty() {
                return Err(CacheError::JournalCorrupt(format!("bad record: {:?}", line)));
            }
            match op {
                "DIRTY" => {
                    pending.insert(key.to_string());
                }
                "CLEAN" => {
                    let size = parts
                        .next()
                        .and_then(|s| s.parse::<u64>().ok())
                        .ok_or_else(|| {
                            CacheError::JournalCorrupt(format!("bad record: {:?}", line))
                        })?;
                    entries.insert(key, size, ());
                    pending.remove(key);
                }
                "REMOVE" => {
                    entries.remove(key);
                    pending.remove(key);
                }
                _ => {
                    return Err(CacheError::JournalCorrupt(format!("bad record: {:?}", line)));
                }
            }
        }

        // Clean up writes that never committed. The value file is only ever
        // renamed into place whole, so a prior clean value for the key (if
        // any) is still intact; re-stat it in case the rename happened but
        // the crash hit before the CLEAN record was appended.
        for key in pending {
            let _ = fs::remove_file(dir.join(format!("{}.tmp", key))).await;
            if entries.contains(&key) {
                match fs::metadata(dir.join(&key)).await {
                    Ok(md) => {
                        entries.insert(&key, md.len(), ());
                    }
                    Err(_) => {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Write a fresh journal containing only the live entries, in recency
    /// order, via a temporary file and atomic rename.
    async fn write_journal(dir: &Path, schema_version: u32, entries: &LruList<()>) -> Result<()> {
        let tmp = dir.join(JOURNAL_TMP_FILE);
        let mut contents = format!("{}\n{}\n{}\n\n", MAGIC, JOURNAL_FORMAT, schema_version);
        for (key, size, _) in entries.iter() {
            contents.push_str(&format!("CLEAN {} {}\n", key, size));
        }
        let mut file = File::create(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_data().await?;
        drop(file);
        fs::rename(&tmp, dir.join(JOURNAL_FILE)).await?;
        Ok(())
    }

    /// Delete files in the cache directory that no live entry references.
    /// A crash between a commit's rename and its CLEAN record leaves the
    /// renamed value file behind with nothing pointing at it.
    async fn sweep_orphans(dir: &Path, entries: &LruList<()>) -> Result<()> {
        let mut listing = fs::read_dir(dir).await?;
        while let Some(dirent) = listing.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == JOURNAL_FILE || entries.contains(name) {
                continue;
            }
            debug!(file = %name, "Removing unreferenced cache file");
            if let Err(e) = fs::remove_file(dirent.path()).await {
                warn!(file = %name, error = %e, "Failed to remove unreferenced file");
            }
        }
        Ok(())
    }

    /// Delete everything under the cache directory and recreate it empty.
    async fn wipe(dir: &Path) -> Result<()> {
        fs::remove_dir_all(dir).await?;
        fs::create_dir_all(dir).await?;
        info!(dir = ?dir, "Wiped disk cache directory");
        Ok(())
    }

    /// Rewrite the journal once enough records no longer map to live entries.
    async fn maybe_compact(&self, inner: &mut DiskInner) {
        if inner.redundant_ops < COMPACT_THRESHOLD
            || inner.redundant_ops < inner.entries.len() as u64
        {
            return;
        }
        if let Err(e) = Self::write_journal(&self.dir, self.schema_version, &inner.entries).await {
            warn!(error = %e, "Failed to compact journal");
            return;
        }
        match OpenOptions::new()
            .append(true)
            .open(self.dir.join(JOURNAL_FILE))
            .await
        {
            Ok(journal) => {
                inner.journal = journal;
                inner.redundant_ops = 0;
                debug!(entries = inner.entries.len(), "Compacted journal");
            }
            Err(e) => {
                warn!(error = %e, "Failed to reopen compacted journal");
            }
        }
    }

    /// Evict least-recently-used entries until within capacity.
    async fn evict_to_capacity(&self) {
        let mut inner = self.inner.lock().await;
        while inner.entries.total_size() > self.capacity {
            let Some((key, size, _)) = inner.entries.pop_oldest() else {
                break;
            };
            let record = format!("REMOVE {}\n", key);
            if let Err(e) = Self::append(&mut inner.journal, &record).await {
                warn!(key = %key, error = %e, "Failed to journal eviction");
            }
            inner.redundant_ops += 2;
            if let Err(e) = fs::remove_file(self.value_path(&key)).await {
                warn!(key = %key, error = %e, "Failed to delete evicted file");
            }
            debug!(key = %key, size, "Evicted disk entry");
        }
        self.maybe_compact(&mut inner).await;
    }

    /// Second phase of a write: rename the temporary file into place, journal
    /// the CLEAN record, update the index, and evict if over capacity.
    async fn commit_write(&self, key: &str, tmp_path: &Path, size: u64) -> Result<()> {
        fs::rename(tmp_path, self.value_path(key)).await?;
        {
            let mut inner = self.inner.lock().await;
            let record = format!("CLEAN {} {}\n", key, size);
            Self::append(&mut inner.journal, &record).await?;
            inner.entries.insert(key, size, ());
            // The DIRTY record for this key is now stale
            inner.redundant_ops += 1;
        }
        self.clear_dirty(key);
        debug!(key = %key, size, "Committed disk entry");
        self.evict_to_capacity().await;
        Ok(())
    }
}

/// A write in progress, created by [`DiskCache::begin_write`].
///
/// Bytes are accumulated in a temporary file; [`commit`](Editor::commit)
/// publishes them atomically, [`abort`](Editor::abort) discards them.
/// Dropping an unfinished editor aborts it best-effort.
pub struct Editor<'a> {
    cache: &'a DiskCache,
    key: String,
    tmp_path: PathBuf,
    file: Option<File>,
    written: u64,
    finished: bool,
}

impl Editor<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            CacheError::Config("editor already finished".to_string())
        })?;
        file.write_all(buf).await?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Atomically publish the written bytes as the value for this key.
    pub async fn commit(mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Err(CacheError::Config("editor already finished".to_string()));
        };
        self.finished = true;
        if let Err(e) = file.flush().await {
            drop(file);
            self.cleanup();
            return Err(e.into());
        }
        drop(file);
        let result = self
            .cache
            .commit_write(&self.key, &self.tmp_path, self.written)
            .await;
        if result.is_err() {
            self.cleanup();
        }
        result
    }

    /// Discard the write. The temporary file is deleted; the leftover DIRTY
    /// record is dropped at the next journal rewrite.
    pub async fn abort(mut self) -> Result<()> {
        self.file.take();
        self.finished = true;
        let removed = fs::remove_file(&self.tmp_path).await;
        self.cache.clear_dirty(&self.key);
        removed?;
        Ok(())
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.tmp_path);
        self.cache.clear_dirty(&self.key);
    }
}

impl Drop for Editor<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            self.cleanup();
        }
    }
}

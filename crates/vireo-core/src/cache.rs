//! Disk cache for downloaded media
//!
//! Handles:
//! - Content-addressed storage keyed by source URI
//! - File count and total size limits
//! - Least-recently-used eviction
//! - A persistent index rewritten with every file operation
//!
//! One `CacheManager` is shared by every player in the process. All
//! index mutations go through a single write guard; queries take a read
//! guard and see a consistent snapshot. Object bytes are read and written
//! outside the guard, and index files are written in revision order.

use crate::{config::CacheConfig, Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const INDEX_FILE: &str = "index.json";
const ENTRY_EXTENSION: &str = "media";

/// Metadata for one cached object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Source URI the bytes were downloaded from
    pub uri: String,
    /// Size of the cached file in bytes
    pub byte_size: u64,
    /// Last time the entry was written or read
    pub last_access_time: DateTime<Utc>,
    /// Location of the cached bytes
    pub file_path: PathBuf,
    /// Logical access clock; orders entries touched within the same instant
    #[serde(rename = "seq")]
    access_seq: u64,
}

/// Outcome of `remove_all_caches`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalReport {
    pub removed: usize,
    pub attempted: usize,
}

impl RemovalReport {
    pub fn is_complete(&self) -> bool {
        self.removed == self.attempted
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: Vec<CacheEntry>,
}

#[derive(Debug)]
struct CacheIndex {
    dir: Option<PathBuf>,
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    total_size: u64,
    next_seq: u64,
    revision: u64,
}

/// Serialized index, taken under the guard and written after it is released
struct IndexSnapshot {
    dir: PathBuf,
    revision: u64,
    json: Vec<u8>,
}

impl CacheIndex {
    fn dir(&self) -> Result<&Path> {
        self.dir.as_deref().ok_or(Error::CacheNotConfigured)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn within_limits(&self, extra_count: usize, extra_size: u64) -> bool {
        self.entries.len() + extra_count <= self.config.max_file_count
            && self.total_size + extra_size <= self.config.max_total_size
    }

    /// Least-recently-used entry, optionally skipping one uri
    fn oldest(&self, except: Option<&str>) -> Option<String> {
        self.entries
            .values()
            .filter(|e| Some(e.uri.as_str()) != except)
            .min_by_key(|e| (e.access_seq, e.last_access_time))
            .map(|e| e.uri.clone())
    }

    fn forget(&mut self, uri: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(uri)?;
        self.total_size -= entry.byte_size;
        Some(entry)
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.total_size += entry.byte_size;
        self.entries.insert(entry.uri.clone(), entry);
    }

    /// Remove one entry and its file; a file that is already gone counts as removed
    async fn remove_entry(&mut self, uri: &str) -> Result<Option<CacheEntry>> {
        let Some(entry) = self.entries.get(uri) else {
            return Ok(None);
        };
        match tokio::fs::remove_file(&entry.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.forget(uri))
    }

    /// Evict least-recently-used entries until an addition of the given size fits
    async fn evict_for(&mut self, extra_count: usize, extra_size: u64, keep: Option<&str>) -> Result<usize> {
        let mut evicted = 0;
        while !self.within_limits(extra_count, extra_size) {
            let Some(uri) = self.oldest(keep) else {
                break;
            };
            if let Some(entry) = self.remove_entry(&uri).await? {
                evicted += 1;
                debug!(uri = %entry.uri, bytes = entry.byte_size, "Evicted cache entry");
            }
        }
        Ok(evicted)
    }

    fn snapshot(&mut self) -> Result<IndexSnapshot> {
        let dir = self.dir()?.to_path_buf();
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.access_seq);
        let json = serde_json::to_vec_pretty(&IndexFile { entries })?;
        self.revision += 1;
        Ok(IndexSnapshot {
            dir,
            revision: self.revision,
            json,
        })
    }
}

/// Process-wide disk cache shared by all players
pub struct CacheManager {
    index: RwLock<CacheIndex>,
    /// Revision of the last index written to disk
    saved: Mutex<u64>,
}

impl CacheManager {
    /// Create a cache with no directory; `set_cache_dir` initialises it
    pub fn new(config: CacheConfig) -> Self {
        Self {
            index: RwLock::new(CacheIndex {
                dir: None,
                config,
                entries: HashMap::new(),
                total_size: 0,
                next_seq: 0,
                revision: 0,
            }),
            saved: Mutex::new(0),
        }
    }

    /// Write `snapshot` unless a newer index already reached the disk
    async fn save(&self, snapshot: IndexSnapshot) -> Result<()> {
        let mut saved = self.saved.lock().await;
        if snapshot.revision <= *saved {
            return Ok(());
        }
        let tmp = snapshot.dir.join(format!("{}.tmp", INDEX_FILE));
        tokio::fs::write(&tmp, &snapshot.json).await?;
        tokio::fs::rename(&tmp, snapshot.dir.join(INDEX_FILE)).await?;
        *saved = snapshot.revision;
        Ok(())
    }

    /// Create a cache rooted at `dir`
    pub async fn open(dir: impl AsRef<Path>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let cache = Self::new(config);
        cache.set_cache_dir(dir).await?;
        Ok(cache)
    }

    /// File name used for a uri: base64 of its SHA-256 digest
    pub fn file_name_for(uri: &str) -> String {
        let hash = digest::digest(&digest::SHA256, uri.as_bytes());
        format!("{}.{}", URL_SAFE_NO_PAD.encode(hash.as_ref()), ENTRY_EXTENSION)
    }

    /// Set (or move) the cache root, loading any index found there
    #[instrument(skip(self, dir), fields(dir = %dir.as_ref().display()))]
    pub async fn set_cache_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref().to_path_buf();
        let unwritable = |source: std::io::Error| Error::CacheDirUnwritable {
            path: dir.display().to_string(),
            source,
        };

        tokio::fs::create_dir_all(&dir).await.map_err(unwritable)?;
        let probe = dir.join(".probe");
        tokio::fs::write(&probe, b"probe").await.map_err(unwritable)?;
        tokio::fs::remove_file(&probe).await.map_err(unwritable)?;

        let loaded = load_index(&dir).await;

        let mut index = self.index.write().await;
        index.dir = Some(dir.clone());
        index.entries.clear();
        index.total_size = 0;
        index.next_seq = 0;

        for mut entry in loaded {
            match tokio::fs::metadata(&entry.file_path).await {
                Ok(meta) if meta.is_file() => {
                    entry.byte_size = meta.len();
                    index.next_seq = index.next_seq.max(entry.access_seq + 1);
                    index.insert(entry);
                }
                _ => debug!(uri = %entry.uri, "Dropping index entry without a file"),
            }
        }

        let evicted = index.evict_for(0, 0, None).await?;
        let snapshot = index.snapshot()?;
        self.save(snapshot).await?;

        info!(
            entries = index.entries.len(),
            bytes = index.total_size,
            evicted,
            "Cache directory ready"
        );
        Ok(())
    }

    /// Set the maximum number of cached files, evicting if already above it
    pub async fn set_max_cache_file_count(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidArgument("max cache file count must be > 0".into()));
        }
        let mut index = self.index.write().await;
        index.config.max_file_count = count;
        self.shrink_to_limits(&mut index).await
    }

    /// Set the maximum total cache size in bytes, evicting if already above it
    pub async fn set_max_cache_file_size(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Err(Error::InvalidArgument("max cache size must be > 0".into()));
        }
        let mut index = self.index.write().await;
        index.config.max_total_size = bytes;
        self.shrink_to_limits(&mut index).await
    }

    async fn shrink_to_limits(&self, index: &mut CacheIndex) -> Result<()> {
        let evicted = index.evict_for(0, 0, None).await?;
        if evicted > 0 && index.dir.is_some() {
            self.save(index.snapshot()?).await?;
        }
        Ok(())
    }

    /// Evict on overflow (true) or refuse writes that would overflow (false)
    pub async fn enable_auto_remove_cache(&self, enable: bool) {
        self.index.write().await.config.auto_remove = enable;
    }

    /// Store the complete bytes of `uri`, replacing any previous entry
    ///
    /// The bytes are written before the index guard is taken; only the
    /// limit checks, the rename into place and the index update hold it.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn store(&self, uri: &str, data: &[u8]) -> Result<CacheEntry> {
        let size = data.len() as u64;
        let dir = {
            let index = self.index.read().await;
            let dir = index.dir()?.to_path_buf();
            admit(&index, uri, size)?;
            dir
        };

        let tmp = dir.join(format!("{}.part", Uuid::new_v4()));
        tokio::fs::write(&tmp, data).await?;

        match self.commit(uri, size, &tmp).await {
            Ok((entry, snapshot)) => {
                self.save(snapshot).await?;
                Ok(entry)
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                    debug!(error = %cleanup, "Failed to remove partial cache file");
                }
                Err(e)
            }
        }
    }

    /// Move a fully written object into place and index it
    async fn commit(&self, uri: &str, size: u64, tmp: &Path) -> Result<(CacheEntry, IndexSnapshot)> {
        let mut index = self.index.write().await;
        let dir = index.dir()?.to_path_buf();
        // Limits may have changed while the bytes were written
        if admit(&index, uri, size)? {
            let (extra_count, extra_size) = addition(&index, uri, size);
            index.evict_for(extra_count, extra_size, Some(uri)).await?;
        }

        let file_path = dir.join(Self::file_name_for(uri));
        tokio::fs::rename(tmp, &file_path).await?;

        index.forget(uri);
        let entry = CacheEntry {
            uri: uri.to_string(),
            byte_size: size,
            last_access_time: Utc::now(),
            file_path,
            access_seq: index.next_seq(),
        };
        index.insert(entry.clone());

        debug!(uri, total = index.total_size, count = index.entries.len(), "Cached");
        Ok((entry, index.snapshot()?))
    }

    /// Read the cached bytes of `uri`, refreshing its access time
    ///
    /// The file is read without holding the index guard.
    pub async fn read(&self, uri: &str) -> Result<Option<Bytes>> {
        let path = {
            let index = self.index.read().await;
            match index.entries.get(uri) {
                Some(entry) => entry.file_path.clone(),
                None => return Ok(None),
            }
        };

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                // A concurrent store may have put the file back
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Ok(None);
                }
                let snapshot = {
                    let mut index = self.index.write().await;
                    if index.forget(uri).is_none() {
                        return Ok(None);
                    }
                    warn!(uri, "Cached file vanished, dropping entry");
                    index.snapshot()?
                };
                self.save(snapshot).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot = {
            let mut index = self.index.write().await;
            let seq = index.next_seq();
            let touched = match index.entries.get_mut(uri) {
                Some(entry) => {
                    entry.last_access_time = Utc::now();
                    entry.access_seq = seq;
                    true
                }
                // Removed while the file was being read
                None => false,
            };
            if touched {
                Some(index.snapshot()?)
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            self.save(snapshot).await?;
        }
        Ok(Some(Bytes::from(data)))
    }

    /// Remove exactly the least-recently-used entry
    pub async fn remove_old_cache(&self) -> Result<Option<CacheEntry>> {
        let mut index = self.index.write().await;
        let Some(uri) = index.oldest(None) else {
            return Ok(None);
        };
        let removed = index.remove_entry(&uri).await?;
        self.save(index.snapshot()?).await?;
        Ok(removed)
    }

    /// Remove the entry for `uri`; returns false if there was none
    pub async fn remove_cache_by_uri(&self, uri: &str) -> Result<bool> {
        let mut index = self.index.write().await;
        let removed = index.remove_entry(uri).await?;
        if removed.is_some() {
            self.save(index.snapshot()?).await?;
        }
        Ok(removed.is_some())
    }

    /// Remove every entry; entries already removed stay removed on failure
    #[instrument(skip(self))]
    pub async fn remove_all_caches(&self) -> Result<RemovalReport> {
        let mut index = self.index.write().await;
        let uris: Vec<String> = index.entries.keys().cloned().collect();
        let mut report = RemovalReport {
            removed: 0,
            attempted: uris.len(),
        };

        for uri in uris {
            match index.remove_entry(&uri).await {
                Ok(_) => report.removed += 1,
                Err(e) => warn!(uri = %uri, error = %e, "Failed to remove cache entry"),
            }
        }

        if index.dir.is_some() {
            self.save(index.snapshot()?).await?;
        }
        info!(removed = report.removed, attempted = report.attempted, "Cache cleared");
        Ok(report)
    }

    pub async fn contains(&self, uri: &str) -> bool {
        self.index.read().await.entries.contains_key(uri)
    }

    pub async fn entry(&self, uri: &str) -> Option<CacheEntry> {
        self.index.read().await.entries.get(uri).cloned()
    }

    /// Snapshot of all entries, least recently used first
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let index = self.index.read().await;
        let mut entries: Vec<_> = index.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.access_seq);
        entries
    }

    pub async fn cache_dir(&self) -> Option<PathBuf> {
        self.index.read().await.dir.clone()
    }

    pub async fn max_cache_file_count(&self) -> usize {
        self.index.read().await.config.max_file_count
    }

    pub async fn max_cache_file_size(&self) -> u64 {
        self.index.read().await.config.max_total_size
    }

    pub async fn cache_file_count(&self) -> usize {
        self.index.read().await.entries.len()
    }

    pub async fn total_size(&self) -> u64 {
        self.index.read().await.total_size
    }

    pub async fn auto_remove_enabled(&self) -> bool {
        self.index.read().await.config.auto_remove
    }
}

/// Check that `size` bytes for `uri` may be stored; true when eviction is needed first
fn admit(index: &CacheIndex, uri: &str, size: u64) -> Result<bool> {
    if size > index.config.max_total_size {
        return Err(Error::CacheFull { size });
    }
    let (extra_count, extra_size) = addition(index, uri, size);
    if index.within_limits(extra_count, extra_size) {
        return Ok(false);
    }
    if !index.config.auto_remove {
        return Err(Error::CacheFull { size });
    }
    Ok(true)
}

/// File count and bytes that storing `size` bytes for `uri` adds
fn addition(index: &CacheIndex, uri: &str, size: u64) -> (usize, u64) {
    match index.entries.get(uri) {
        Some(existing) => (0, size.saturating_sub(existing.byte_size)),
        None => (1, size),
    }
}

async fn load_index(dir: &Path) -> Vec<CacheEntry> {
    let path = dir.join(INDEX_FILE);
    match tokio::fs::read(&path).await {
        Ok(raw) => match serde_json::from_slice::<IndexFile>(&raw) {
            Ok(file) => file.entries,
            Err(e) => {
                warn!(error = %e, "Cache index unreadable, starting empty");
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}

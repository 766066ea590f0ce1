//! Content-addressed local cache for downloaded receipt images.
//!
//! Layout on disk: a `blobs/` directory keyed by SHA-256 content hash plus
//! an `index.json` mapping logical ids to entries. Byte-identical images
//! ingested under different logical ids share one blob: the second `put`
//! registers an alias instead of duplicating bytes. This is the
//! exact-duplicate fast path, orthogonal to perceptual duplicate detection
//! in [`crate::image::dedup`].
//!
//! Index invariants:
//! - exactly one non-alias entry exists per distinct content hash; all
//!   aliases resolve to it through `alias_of`
//! - every index mutation is persisted (temp file + rename) before the
//!   mutating call returns
//! - a `get` whose backing blob has disappeared self-heals by dropping the
//!   stale entry and reporting a miss; aliases whose target was evicted
//!   behave the same way
//!
//! The index is protected by a single mutex: concurrent `put`s of identical
//! bytes under different logical ids must not both win the
//! "create new entry" race.

use crate::error::{KassenbonError, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One cached item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub logical_id: String,
    pub content_hash: String,
    /// Blob path for owning entries; `None` for aliases.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,
    /// Logical id of the owning entry when this one is an alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_of: Option<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_alias(&self) -> bool {
        self.alias_of.is_some()
    }
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub alias_entries: usize,
    pub total_size_bytes: u64,
}

/// Result of an eviction pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvictionStats {
    pub entries_removed: usize,
    pub bytes_freed: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    /// logical id -> entry
    entries: BTreeMap<String, CacheEntry>,
    /// content hash -> logical id of the owning (non-alias) entry
    hashes: BTreeMap<String, String>,
}

/// Content-addressed cache with LRU-by-access size enforcement.
pub struct ContentCache {
    root: PathBuf,
    blobs_dir: PathBuf,
    index_path: PathBuf,
    index: Mutex<CacheIndex>,
}

impl ContentCache {
    /// Open (or create) a cache rooted at `dir`.
    ///
    /// A corrupt index file is logged and replaced with an empty index;
    /// surviving blobs can be recovered via [`ContentCache::rebuild_index`].
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let root: PathBuf = dir.into();
        let blobs_dir = root.join("blobs");
        fs::create_dir_all(&blobs_dir)
            .map_err(|e| KassenbonError::cache(format!("failed to create cache directory: {}", e)))?;

        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            match fs::read(&index_path)
                .map_err(KassenbonError::from)
                .and_then(|bytes| serde_json::from_slice::<CacheIndex>(&bytes).map_err(KassenbonError::from))
            {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!("failed to load cache index, starting empty: {}", e);
                    CacheIndex::default()
                }
            }
        } else {
            CacheIndex::default()
        };

        Ok(Self {
            root,
            blobs_dir,
            index_path,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `bytes` under `logical_id`.
    ///
    /// Returns the blob path backing the entry. If an entry with the same
    /// content hash already exists, no bytes are written and `logical_id`
    /// becomes an alias of the existing entry.
    pub fn put(&self, logical_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        let content_hash = content_hash(bytes);
        let now = Utc::now();

        let mut index = self.index.lock();

        // Re-ingesting the same id with the same content is a no-op.
        if let Some(existing) = index.entries.get(logical_id) {
            if existing.content_hash == content_hash {
                if let Some(path) = self.resolve_path_locked(&index, logical_id).filter(|p| p.exists()) {
                    return Ok(path);
                }
            }
            // Content changed (or entry went stale): drop the old entry first.
            self.remove_locked(&mut index, logical_id)?;
        }

        if let Some(owner_id) = index.hashes.get(&content_hash).cloned() {
            // Exact-duplicate fast path: register an alias, no bytes written.
            let owner_path = index
                .entries
                .get(&owner_id)
                .and_then(|e| e.storage_path.clone())
                .ok_or_else(|| KassenbonError::cache(format!("hash index points at missing entry {}", owner_id)))?;

            tracing::debug!(%logical_id, %owner_id, "content already cached, registering alias");
            index.entries.insert(
                logical_id.to_string(),
                CacheEntry {
                    logical_id: logical_id.to_string(),
                    content_hash,
                    storage_path: None,
                    alias_of: Some(owner_id),
                    size_bytes: bytes.len() as u64,
                    created_at: now,
                    last_accessed_at: now,
                },
            );
            self.persist_locked(&index)?;
            return Ok(owner_path);
        }

        let blob_path = self.blobs_dir.join(&content_hash);
        fs::write(&blob_path, bytes)
            .map_err(|e| KassenbonError::cache(format!("failed to write blob {}: {}", blob_path.display(), e)))?;

        index.entries.insert(
            logical_id.to_string(),
            CacheEntry {
                logical_id: logical_id.to_string(),
                content_hash: content_hash.clone(),
                storage_path: Some(blob_path.clone()),
                alias_of: None,
                size_bytes: bytes.len() as u64,
                created_at: now,
                last_accessed_at: now,
            },
        );
        index.hashes.insert(content_hash, logical_id.to_string());
        self.persist_locked(&index)?;

        tracing::debug!(%logical_id, size = bytes.len(), "cached new blob");
        Ok(blob_path)
    }

    /// Look up the blob path for `logical_id`, bumping its access time.
    ///
    /// Entries whose backing blob has disappeared (including aliases whose
    /// target was evicted) are removed from the index and reported as a
    /// miss.
    pub fn get(&self, logical_id: &str) -> Result<Option<PathBuf>> {
        let mut index = self.index.lock();

        let Some(path) = self.resolve_path_locked(&index, logical_id) else {
            if index.entries.contains_key(logical_id) {
                // Alias whose target entry is gone: heal and miss.
                self.remove_locked(&mut index, logical_id)?;
                self.persist_locked(&index)?;
            }
            return Ok(None);
        };

        if !path.exists() {
            tracing::warn!(%logical_id, "cache blob missing on disk, healing index");
            self.remove_locked(&mut index, logical_id)?;
            self.persist_locked(&index)?;
            return Ok(None);
        }

        if let Some(entry) = index.entries.get_mut(logical_id) {
            entry.last_accessed_at = Utc::now();
        }
        self.persist_locked(&index)?;
        Ok(Some(path))
    }

    /// Fetch a copy of the index entry for `logical_id`.
    pub fn entry(&self, logical_id: &str) -> Option<CacheEntry> {
        self.index.lock().entries.get(logical_id).cloned()
    }

    /// Remove `logical_id` from the cache.
    ///
    /// Removing an owning entry deletes its blob and hash-index entry;
    /// aliases pointing at it become misses on their next `get`.
    pub fn remove(&self, logical_id: &str) -> Result<()> {
        let mut index = self.index.lock();
        self.remove_locked(&mut index, logical_id)?;
        self.persist_locked(&index)
    }

    /// Remove entries created before `cutoff`, regardless of size pressure.
    pub fn evict_entries_before(&self, cutoff: DateTime<Utc>) -> Result<EvictionStats> {
        let mut index = self.index.lock();
        let expired: Vec<String> = index
            .entries
            .values()
            .filter(|e| e.created_at < cutoff)
            .map(|e| e.logical_id.clone())
            .collect();

        let mut stats = EvictionStats::default();
        for logical_id in expired {
            if let Some(freed) = self.remove_locked(&mut index, &logical_id)? {
                stats.entries_removed += 1;
                stats.bytes_freed += freed;
            }
        }
        self.persist_locked(&index)?;

        tracing::info!(removed = stats.entries_removed, "age-based cache eviction finished");
        Ok(stats)
    }

    /// Remove entries older than `max_age_days`.
    pub fn evict_older_than(&self, max_age_days: u32) -> Result<EvictionStats> {
        self.evict_entries_before(Utc::now() - Duration::days(i64::from(max_age_days)))
    }

    /// Evict least-recently-accessed owning entries until total blob size
    /// fits within `max_bytes`.
    ///
    /// Aliases are never evicted independently; they hold no bytes. When an
    /// owning entry is evicted, aliases that pointed at it resolve to a
    /// miss afterwards.
    pub fn enforce_size_limit(&self, max_bytes: u64) -> Result<EvictionStats> {
        let mut index = self.index.lock();

        let mut total: u64 = index
            .entries
            .values()
            .filter(|e| !e.is_alias())
            .map(|e| e.size_bytes)
            .sum();

        let mut stats = EvictionStats::default();
        if total <= max_bytes {
            return Ok(stats);
        }

        let mut owners: Vec<(DateTime<Utc>, String, u64)> = index
            .entries
            .values()
            .filter(|e| !e.is_alias())
            .map(|e| (e.last_accessed_at, e.logical_id.clone(), e.size_bytes))
            .collect();
        owners.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        for (_, logical_id, size) in owners {
            if total <= max_bytes {
                break;
            }
            if self.remove_locked(&mut index, &logical_id)?.is_some() {
                total -= size;
                stats.entries_removed += 1;
                stats.bytes_freed += size;
            }
        }
        self.persist_locked(&index)?;

        tracing::info!(
            removed = stats.entries_removed,
            freed = stats.bytes_freed,
            "size-based cache eviction finished"
        );
        Ok(stats)
    }

    /// Rebuild the index from surviving blobs after index loss.
    ///
    /// Logical ids cannot be recovered from blob contents, so recovered
    /// entries are keyed by their content hash. Existing index entries are
    /// kept; only unindexed blobs are adopted.
    pub fn rebuild_index(&self) -> Result<usize> {
        let mut index = self.index.lock();
        let now = Utc::now();
        let mut adopted = 0;

        for dir_entry in fs::read_dir(&self.blobs_dir)? {
            let dir_entry = match dir_entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!("skipping unreadable blob entry: {}", e);
                    continue;
                }
            };
            let path = dir_entry.path();
            let Ok(metadata) = dir_entry.metadata() else { continue };
            if !metadata.is_file() {
                continue;
            }

            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("skipping unreadable blob {}: {}", path.display(), e);
                    continue;
                }
            };
            let hash = content_hash(&bytes);
            if index.hashes.contains_key(&hash) {
                continue;
            }

            index.entries.insert(
                hash.clone(),
                CacheEntry {
                    logical_id: hash.clone(),
                    content_hash: hash.clone(),
                    storage_path: Some(path),
                    alias_of: None,
                    size_bytes: metadata.len(),
                    created_at: now,
                    last_accessed_at: now,
                },
            );
            index.hashes.insert(hash.clone(), hash);
            adopted += 1;
        }

        self.persist_locked(&index)?;
        tracing::info!(adopted, "rebuilt cache index from blobs");
        Ok(adopted)
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.index.lock();
        let alias_entries = index.entries.values().filter(|e| e.is_alias()).count();
        CacheStats {
            total_entries: index.entries.len(),
            alias_entries,
            total_size_bytes: index
                .entries
                .values()
                .filter(|e| !e.is_alias())
                .map(|e| e.size_bytes)
                .sum(),
        }
    }

    /// Resolve the blob path for `logical_id`, following at most one alias
    /// hop (aliases always point at owning entries).
    fn resolve_path_locked(&self, index: &CacheIndex, logical_id: &str) -> Option<PathBuf> {
        let entry = index.entries.get(logical_id)?;
        match &entry.alias_of {
            None => entry.storage_path.clone(),
            Some(owner_id) => index
                .entries
                .get(owner_id)
                .and_then(|owner| owner.storage_path.clone()),
        }
    }

    /// Remove an entry; returns freed blob bytes for owning entries.
    fn remove_locked(&self, index: &mut CacheIndex, logical_id: &str) -> Result<Option<u64>> {
        let Some(entry) = index.entries.remove(logical_id) else {
            return Ok(None);
        };

        if entry.is_alias() {
            return Ok(Some(0));
        }

        index.hashes.remove(&entry.content_hash);
        if let Some(path) = &entry.storage_path {
            if path.exists() {
                fs::remove_file(path)
                    .map_err(|e| KassenbonError::cache(format!("failed to remove blob {}: {}", path.display(), e)))?;
            }
        }
        Ok(Some(entry.size_bytes))
    }

    /// Persist the index atomically: temp file in the same directory, then
    /// rename over the live index.
    fn persist_locked(&self, index: &CacheIndex) -> Result<()> {
        let tmp_path = self.root.join("index.json.tmp");
        let json = serde_json::to_vec_pretty(index)?;
        fs::write(&tmp_path, json)
            .map_err(|e| KassenbonError::cache(format!("failed to write cache index: {}", e)))?;
        fs::rename(&tmp_path, &self.index_path)
            .map_err(|e| KassenbonError::cache(format!("failed to replace cache index: {}", e)))?;
        Ok(())
    }
}

/// SHA-256 of exact byte content, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(dir.path()).unwrap();

        let path = cache.put("receipt-1", b"image bytes").unwrap();
        assert!(path.exists());

        let got = cache.get("receipt-1").unwrap();
        assert_eq!(got, Some(path));
    }

    #[test]
    fn test_identical_content_creates_alias() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(dir.path()).unwrap();

        let path_a = cache.put("a", b"same bytes").unwrap();
        let path_b = cache.put("b", b"same bytes").unwrap();
        assert_eq!(path_a, path_b);

        // Both ids resolve to the single stored blob.
        assert_eq!(cache.get("a").unwrap(), Some(path_a.clone()));
        assert_eq!(cache.get("b").unwrap(), Some(path_a));

        let entry_b = cache.entry("b").unwrap();
        assert!(entry_b.is_alias());
        assert_eq!(entry_b.alias_of.as_deref(), Some("a"));

        let stats = cache.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.alias_entries, 1);
        assert_eq!(stats.total_size_bytes, b"same bytes".len() as u64);
    }

    #[test]
    fn test_get_miss_for_unknown_id() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(dir.path()).unwrap();
        assert_eq!(cache.get("nope").unwrap(), None);
    }

    #[test]
    fn test_get_self_heals_missing_blob() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(dir.path()).unwrap();

        let path = cache.put("x", b"bytes").unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(cache.get("x").unwrap(), None);
        // Entry and hash index healed away; a re-put works from scratch.
        assert!(cache.entry("x").is_none());
        let new_path = cache.put("x", b"bytes").unwrap();
        assert!(new_path.exists());
    }

    #[test]
    fn test_alias_misses_after_target_removed() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(dir.path()).unwrap();

        cache.put("owner", b"shared").unwrap();
        cache.put("alias", b"shared").unwrap();

        cache.remove("owner").unwrap();
        assert_eq!(cache.get("alias").unwrap(), None);
        // The miss healed the dangling alias out of the index.
        assert!(cache.entry("alias").is_none());
    }

    #[test]
    fn test_removing_owner_frees_hash_index() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(dir.path()).unwrap();

        cache.put("one", b"payload").unwrap();
        cache.remove("one").unwrap();

        // Same content can be re-ingested as a fresh owner.
        let path = cache.put("two", b"payload").unwrap();
        assert!(path.exists());
        assert!(!cache.entry("two").unwrap().is_alias());
    }

    #[test]
    fn test_enforce_size_limit_evicts_lru_order() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(dir.path()).unwrap();

        cache.put("old", &[1u8; 100]).unwrap();
        cache.put("mid", &[2u8; 100]).unwrap();
        cache.put("new", &[3u8; 100]).unwrap();

        // Touch "old" so "mid" becomes least recently accessed.
        cache.get("old").unwrap();

        let stats = cache.enforce_size_limit(250).unwrap();
        assert_eq!(stats.entries_removed, 1);
        assert_eq!(stats.bytes_freed, 100);

        assert!(cache.get("mid").unwrap().is_none());
        assert!(cache.get("old").unwrap().is_some());
        assert!(cache.get("new").unwrap().is_some());
    }

    #[test]
    fn test_enforce_size_limit_noop_under_budget() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(dir.path()).unwrap();
        cache.put("a", &[0u8; 10]).unwrap();

        let stats = cache.enforce_size_limit(1000).unwrap();
        assert_eq!(stats.entries_removed, 0);
    }

    #[test]
    fn test_evict_entries_before_cutoff() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(dir.path()).unwrap();

        cache.put("a", b"aaa").unwrap();
        cache.put("b", b"bbb").unwrap();

        // Cutoff in the future removes everything; in the past removes nothing.
        let stats = cache.evict_entries_before(Utc::now() - Duration::days(1)).unwrap();
        assert_eq!(stats.entries_removed, 0);

        let stats = cache.evict_entries_before(Utc::now() + Duration::days(1)).unwrap();
        assert_eq!(stats.entries_removed, 2);
        assert_eq!(cache.stats().total_entries, 0);
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = {
            let cache = ContentCache::open(dir.path()).unwrap();
            cache.put("persistent", b"still here").unwrap()
        };

        let cache = ContentCache::open(dir.path()).unwrap();
        assert_eq!(cache.get("persistent").unwrap(), Some(path));
    }

    #[test]
    fn test_rebuild_index_adopts_orphan_blobs() {
        let dir = tempdir().unwrap();
        {
            let cache = ContentCache::open(dir.path()).unwrap();
            cache.put("lost", b"orphan bytes").unwrap();
        }
        // Simulate index loss.
        fs::remove_file(dir.path().join("index.json")).unwrap();

        let cache = ContentCache::open(dir.path()).unwrap();
        assert_eq!(cache.get("lost").unwrap(), None);

        let adopted = cache.rebuild_index().unwrap();
        assert_eq!(adopted, 1);

        // Recovered entries are keyed by content hash.
        let hash = content_hash(b"orphan bytes");
        assert!(cache.get(&hash).unwrap().is_some());
    }

    #[test]
    fn test_put_same_id_new_content_replaces() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(dir.path()).unwrap();

        let first = cache.put("id", b"version one").unwrap();
        let second = cache.put("id", b"version two").unwrap();
        assert_ne!(first, second);
        assert!(!first.exists());
        assert!(second.exists());
        assert_eq!(cache.stats().total_entries, 1);
    }

    #[test]
    fn test_concurrent_puts_of_identical_content() {
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.put(&format!("id-{}", i), b"raced bytes").unwrap())
            })
            .collect();

        let paths: Vec<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Every put resolved to the same single blob.
        assert!(paths.windows(2).all(|w| w[0] == w[1]));

        let stats = cache.stats();
        assert_eq!(stats.total_entries, 8);
        assert_eq!(stats.alias_entries, 7);
        assert_eq!(stats.total_size_bytes, b"raced bytes".len() as u64);
    }
}

//! Content-addressed download cache
//!
//! Files are keyed by source URL and validated by size and SHA-256, so a
//! cache hit is indistinguishable from a fresh correct download. The
//! index manifest lives alongside the cached blobs and is rewritten whole
//! on every mutation. Entries whose file has already landed at its final
//! destination are indexed in place rather than copied.

use crate::error::Result;
use crate::hasher;
use crate::types::FileHash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Each access is worth one minute of recency in the eviction score
const ACCESS_BONUS_MS: i64 = 60_000;

/// Name of the index manifest inside the cache directory
const INDEX_FILE: &str = "index.json";

/// One cached file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Source URL (the cache key)
    pub url: String,
    /// Absolute path of the cached file
    pub path: PathBuf,
    /// Recorded digest; `path` must match `hash.size` and `hash.sha256`
    pub hash: FileHash,
    /// Creation time, ms since the Unix epoch
    pub created_at: i64,
    /// Last access time, ms since the Unix epoch
    pub last_accessed: i64,
    /// Number of cache hits on this entry
    pub access_count: u64,
}

impl CacheEntry {
    /// Eviction score: freshness in ms, each access worth one minute
    fn score(&self) -> i64 {
        self.last_accessed
            .saturating_add((self.access_count as i64).saturating_mul(ACCESS_BONUS_MS))
    }
}

/// Content-addressed cache store
///
/// All mutations are linearized through an internal mutex; the index is
/// a single-writer structure.
#[derive(Clone)]
pub struct CacheStore {
    cache_dir: PathBuf,
    max_bytes: u64,
    max_age: Duration,
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl CacheStore {
    /// Open the cache rooted at `cache_dir`, verifying integrity
    ///
    /// A missing index yields an empty cache; a corrupt index is dropped
    /// with a warning rather than failing startup. Entries older than
    /// `max_age` and entries whose file no longer matches its recorded
    /// hash are pruned.
    pub async fn open(cache_dir: &Path, max_bytes: u64, max_age: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(cache_dir).await?;

        let index_path = cache_dir.join(INDEX_FILE);
        let entries: HashMap<String, CacheEntry> = match tokio::fs::read(&index_path).await {
            Ok(raw) => match serde_json::from_slice::<Vec<CacheEntry>>(&raw) {
                Ok(list) => list.into_iter().map(|e| (e.url.clone(), e)).collect(),
                Err(e) => {
                    warn!(error = %e, "cache index corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        let store = Self {
            cache_dir: cache_dir.to_path_buf(),
            max_bytes,
            max_age,
            entries: Arc::new(Mutex::new(entries)),
        };
        store.verify_integrity().await?;
        Ok(store)
    }

    /// Look up a URL, re-validating the file before returning it
    ///
    /// On a valid hit the access bookkeeping is updated and persisted.
    /// A mismatching or missing file evicts the entry and returns `None`.
    pub async fn get(&self, url: &str) -> Result<Option<PathBuf>> {
        let entry = {
            let entries = self.entries.lock().await;
            match entries.get(url) {
                Some(entry) => entry.clone(),
                None => return Ok(None),
            }
        };

        // Validate outside the lock; hashing can take a while
        if !hasher::verify_file(&entry.path, &entry.hash).await? {
            warn!(url, path = %entry.path.display(), "cached file failed validation, evicting");
            let mut entries = self.entries.lock().await;
            if entries.remove(url).is_some() {
                self.delete_if_owned(&entry.path).await;
                self.persist(&entries).await?;
            }
            return Ok(None);
        }

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(url) {
            entry.last_accessed = now_ms();
            entry.access_count += 1;
        }
        self.persist(&entries).await?;
        Ok(Some(entry.path))
    }

    /// Record a downloaded file under its URL
    ///
    /// `src_path` must match `hash`; room is made by evicting the lowest
    /// scored entries first. A file larger than the whole budget is not
    /// indexed at all so the size invariant holds.
    pub async fn put(&self, url: &str, src_path: &Path, hash: &FileHash) -> Result<()> {
        if !hasher::verify_file(src_path, hash).await? {
            return Err(crate::error::Error::Download(
                crate::error::DownloadError::HashMismatch {
                    path: src_path.to_path_buf(),
                    expected: hash.sha256.clone(),
                    actual: "(stored file does not match recorded hash)".into(),
                },
            ));
        }

        if hash.size > self.max_bytes {
            debug!(url, size = hash.size, "file exceeds cache budget, not indexing");
            return Ok(());
        }

        let mut entries = self.entries.lock().await;

        // Replacing an entry frees its old size and its owned blob first
        if let Some(old) = entries.remove(url) {
            if old.path != src_path {
                self.delete_if_owned(&old.path).await;
            }
        }
        self.evict_to_fit(&mut entries, hash.size).await;

        let now = now_ms();
        entries.insert(
            url.to_string(),
            CacheEntry {
                url: url.to_string(),
                path: src_path.to_path_buf(),
                hash: hash.clone(),
                created_at: now,
                last_accessed: now,
                access_count: 0,
            },
        );
        self.persist(&entries).await?;
        Ok(())
    }

    /// Remove one entry, deleting its file when the cache owns it
    pub async fn remove(&self, url: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(url) {
            self.delete_if_owned(&entry.path).await;
            self.persist(&entries).await?;
        }
        Ok(())
    }

    /// Remove every entry and its owned files
    pub async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for entry in entries.values() {
            self.delete_if_owned(&entry.path).await;
        }
        entries.clear();
        self.persist(&entries).await?;
        Ok(())
    }

    /// Re-validate every entry, evicting corrupted and expired ones
    ///
    /// Invoked on startup by [`CacheStore::open`].
    pub async fn verify_integrity(&self) -> Result<()> {
        let snapshot: Vec<CacheEntry> = {
            let entries = self.entries.lock().await;
            entries.values().cloned().collect()
        };

        let now = now_ms();
        let max_age_ms = self.max_age.as_millis() as i64;
        let mut stale = Vec::new();

        for entry in snapshot {
            if now.saturating_sub(entry.created_at) > max_age_ms {
                debug!(url = %entry.url, "cache entry expired");
                stale.push(entry);
                continue;
            }
            if !hasher::verify_file(&entry.path, &entry.hash).await? {
                warn!(url = %entry.url, "cache entry corrupt");
                stale.push(entry);
            }
        }

        if !stale.is_empty() {
            let mut entries = self.entries.lock().await;
            for entry in &stale {
                entries.remove(&entry.url);
                self.delete_if_owned(&entry.path).await;
            }
            self.persist(&entries).await?;
            info!(pruned = stale.len(), "cache integrity check pruned entries");
        }
        Ok(())
    }

    /// Total bytes currently indexed
    pub async fn total_bytes(&self) -> u64 {
        let entries = self.entries.lock().await;
        entries.values().map(|e| e.hash.size).sum()
    }

    /// Number of indexed entries
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// True when no entries are indexed
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// A scratch path inside the cache directory for staged downloads
    pub fn staging_path(&self, file_name: &str) -> PathBuf {
        self.cache_dir.join(file_name)
    }

    async fn evict_to_fit(&self, entries: &mut HashMap<String, CacheEntry>, additional: u64) {
        let budget = self.max_bytes.saturating_sub(additional);
        let mut total: u64 = entries.values().map(|e| e.hash.size).sum();
        if total <= budget {
            return;
        }

        let mut by_score: Vec<CacheEntry> = entries.values().cloned().collect();
        by_score.sort_by_key(CacheEntry::score);

        for victim in by_score {
            if total <= budget {
                break;
            }
            debug!(url = %victim.url, score = victim.score(), "evicting cache entry");
            entries.remove(&victim.url);
            self.delete_if_owned(&victim.path).await;
            total -= victim.hash.size;
        }
    }

    /// Delete a referenced file, but only when it lives inside the cache
    /// directory. Entries indexed in place at an install location are
    /// left alone.
    async fn delete_if_owned(&self, path: &Path) {
        if path.starts_with(&self.cache_dir) {
            tokio::fs::remove_file(path).await.ok();
        }
    }

    /// Write the index manifest whole, atomically (tmp + rename)
    async fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<()> {
        let mut list: Vec<&CacheEntry> = entries.values().collect();
        list.sort_by(|a, b| a.url.cmp(&b.url));

        let raw = serde_json::to_vec_pretty(&list)?;
        let index_path = self.cache_dir.join(INDEX_FILE);
        let tmp_path = self.cache_dir.join(format!("{INDEX_FILE}.tmp"));
        tokio::fs::write(&tmp_path, raw).await?;
        tokio::fs::rename(&tmp_path, &index_path).await?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_budget(dir: &Path, max_bytes: u64) -> CacheStore {
        CacheStore::open(&dir.join("cache"), max_bytes, Duration::from_secs(86400))
            .await
            .unwrap()
    }

    async fn cached_file(store: &CacheStore, name: &str, content: &[u8]) -> (PathBuf, FileHash) {
        let path = store.staging_path(name);
        tokio::fs::write(&path, content).await.unwrap();
        let hash = hasher::hash_file(&path).await.unwrap();
        (path, hash)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_budget(dir.path(), 1 << 20).await;

        let (path, hash) = cached_file(&store, "blob.pwr", b"patch bytes").await;
        store.put("http://cdn/0/7.pwr", &path, &hash).await.unwrap();

        let hit = store.get("http://cdn/0/7.pwr").await.unwrap();
        assert_eq!(hit, Some(path));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn get_unknown_url_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_budget(dir.path(), 1 << 20).await;
        assert_eq!(store.get("http://cdn/unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_bumps_access_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_budget(dir.path(), 1 << 20).await;

        let (path, hash) = cached_file(&store, "blob.pwr", b"data").await;
        store.put("http://cdn/a", &path, &hash).await.unwrap();

        store.get("http://cdn/a").await.unwrap();
        store.get("http://cdn/a").await.unwrap();

        let entries = store.entries.lock().await;
        assert_eq!(entries["http://cdn/a"].access_count, 2);
    }

    #[tokio::test]
    async fn put_rejects_mismatched_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_budget(dir.path(), 1 << 20).await;

        let (path, mut hash) = cached_file(&store, "blob.pwr", b"data").await;
        hash.sha256 = "0".repeat(64);

        assert!(store.put("http://cdn/a", &path, &hash).await.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn tampered_file_is_evicted_on_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_budget(dir.path(), 1 << 20).await;

        let (path, hash) = cached_file(&store, "blob.pwr", b"original!").await;
        store.put("http://cdn/a", &path, &hash).await.unwrap();

        // Flip one byte, keeping the length
        tokio::fs::write(&path, b"originalX").await.unwrap();

        assert_eq!(store.get("http://cdn/a").await.unwrap(), None);
        assert!(store.is_empty().await, "entry must disappear from the index");
    }

    #[tokio::test]
    async fn eviction_respects_score_order() {
        let dir = tempfile::tempdir().unwrap();
        // Budget fits two 100-byte files but not three
        let store = store_with_budget(dir.path(), 250).await;

        let (path_a, hash_a) = cached_file(&store, "a.bin", &[b'a'; 100]).await;
        let (path_b, hash_b) = cached_file(&store, "b.bin", &[b'b'; 100]).await;
        let (path_c, hash_c) = cached_file(&store, "c.bin", &[b'c'; 100]).await;

        store.put("http://cdn/a", &path_a, &hash_a).await.unwrap();
        store.put("http://cdn/b", &path_b, &hash_b).await.unwrap();

        // Accessing "a" raises its score well above "b"
        store.get("http://cdn/a").await.unwrap();

        store.put("http://cdn/c", &path_c, &hash_c).await.unwrap();

        let entries = store.entries.lock().await;
        assert!(entries.contains_key("http://cdn/a"), "accessed entry survives");
        assert!(!entries.contains_key("http://cdn/b"), "lowest score evicted");
        assert!(entries.contains_key("http://cdn/c"));

        let total: u64 = entries.values().map(|e| e.hash.size).sum();
        assert!(total <= 250, "size invariant after eviction");
    }

    #[tokio::test]
    async fn oversized_file_is_not_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_budget(dir.path(), 50).await;

        let (path, hash) = cached_file(&store, "big.bin", &[0u8; 100]).await;
        store.put("http://cdn/big", &path, &hash).await.unwrap();

        assert!(store.is_empty().await);
        assert!(path.exists(), "the file itself is left alone");
    }

    #[tokio::test]
    async fn remove_deletes_owned_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_budget(dir.path(), 1 << 20).await;

        // Owned: inside the cache directory
        let (owned, owned_hash) = cached_file(&store, "owned.bin", b"owned").await;
        store.put("http://cdn/owned", &owned, &owned_hash).await.unwrap();

        // Indexed in place: outside the cache directory
        let external = dir.path().join("installed.bin");
        tokio::fs::write(&external, b"installed").await.unwrap();
        let external_hash = hasher::hash_file(&external).await.unwrap();
        store
            .put("http://cdn/external", &external, &external_hash)
            .await
            .unwrap();

        store.remove("http://cdn/owned").await.unwrap();
        store.remove("http://cdn/external").await.unwrap();

        assert!(!owned.exists(), "owned file deleted");
        assert!(external.exists(), "in-place file preserved");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn clear_empties_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_budget(dir.path(), 1 << 20).await;

        let (path, hash) = cached_file(&store, "blob.bin", b"x").await;
        store.put("http://cdn/a", &path, &hash).await.unwrap();
        store.clear().await.unwrap();

        assert!(store.is_empty().await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");

        {
            let store = CacheStore::open(&cache_dir, 1 << 20, Duration::from_secs(86400))
                .await
                .unwrap();
            let (path, hash) = cached_file(&store, "blob.bin", b"persist me").await;
            store.put("http://cdn/a", &path, &hash).await.unwrap();
        }

        let reopened = CacheStore::open(&cache_dir, 1 << 20, Duration::from_secs(86400))
            .await
            .unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(reopened.get("http://cdn/a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reopen_prunes_corrupted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let path;

        {
            let store = CacheStore::open(&cache_dir, 1 << 20, Duration::from_secs(86400))
                .await
                .unwrap();
            let (p, hash) = cached_file(&store, "blob.bin", b"pristine!").await;
            store.put("http://cdn/a", &p, &hash).await.unwrap();
            path = p;
        }

        // Corrupt the blob between sessions
        tokio::fs::write(&path, b"tampered!").await.unwrap();

        let reopened = CacheStore::open(&cache_dir, 1 << 20, Duration::from_secs(86400))
            .await
            .unwrap();
        assert!(reopened.is_empty().await, "integrity check removes the entry");
    }

    #[tokio::test]
    async fn reopen_prunes_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");

        {
            let store = CacheStore::open(&cache_dir, 1 << 20, Duration::from_secs(86400))
                .await
                .unwrap();
            let (path, hash) = cached_file(&store, "blob.bin", b"old data").await;
            store.put("http://cdn/a", &path, &hash).await.unwrap();

            // Backdate the entry beyond any plausible max_age
            let mut entries = store.entries.lock().await;
            entries.get_mut("http://cdn/a").unwrap().created_at = 0;
            let snapshot = entries.clone();
            store.persist(&snapshot).await.unwrap();
        }

        let reopened = CacheStore::open(&cache_dir, 1 << 20, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reopened.is_empty().await);
    }

    #[tokio::test]
    async fn corrupt_index_starts_empty_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        tokio::fs::create_dir_all(&cache_dir).await.unwrap();
        tokio::fs::write(cache_dir.join(INDEX_FILE), b"{ not json")
            .await
            .unwrap();

        let store = CacheStore::open(&cache_dir, 1 << 20, Duration::from_secs(86400))
            .await
            .unwrap();
        assert!(store.is_empty().await);
    }
}

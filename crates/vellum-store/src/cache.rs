//! Caching blob store layer
//!
//! [`CachingFileStore`] keeps a bounded local file cache in front of a
//! slower backing store. Writes stage into the cache directory first, so
//! the observer streams over local I/O, then forward to the backing store
//! from the staged file. Reads are fetch-through: a miss pulls the blob
//! from the backing store into the cache and serves it from there.
//!
//! The cache is bounded by total bytes and entry count, evicting the
//! least-recently-used entries first. Entries younger than a minimum age
//! are never evicted, so a blob cannot disappear while the write that
//! produced it is still forwarding.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::blob::{BlobStream, BlobWriteContext};
use crate::digest::{KeySource, WriteObserver};
use crate::error::StoreError;
use crate::local::LocalFileStore;
use crate::path::{random_key, validate_key, PathStrategy};
use crate::FileStore;

/// Bounds for the local file cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum total size of cached files in bytes
    pub max_bytes: u64,
    /// Maximum number of cached files
    pub max_count: usize,
    /// Entries younger than this are never evicted
    pub min_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            max_count: 10_000,
            min_age: Duration::from_secs(60),
        }
    }
}

struct CacheEntry {
    size: u64,
    inserted: Instant,
    last_access: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
}

/// A bounded LRU cache of blob files in one flat directory.
pub(crate) struct LruFileCache {
    paths: PathStrategy,
    config: CacheConfig,
    state: Mutex<CacheState>,
    tick: AtomicU64,
}

impl LruFileCache {
    fn new(dir: impl Into<PathBuf>, config: CacheConfig) -> Self {
        Self {
            paths: PathStrategy::flat(dir),
            config,
            state: Mutex::new(CacheState::default()),
            tick: AtomicU64::new(0),
        }
    }

    /// Path of the cached file for `key`, touching its LRU position.
    fn get(&self, key: &str) -> Option<PathBuf> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entries.get_mut(key)?;
        entry.last_access = self.tick.fetch_add(1, Ordering::Relaxed);
        self.paths.path_for_key(key).ok()
    }

    /// Adopt a finished staged file as the cache entry for `key`.
    ///
    /// The staged file must live in the cache directory already; adoption
    /// is one rename. Returns the cached path.
    async fn put(&self, key: &str, staged: &Path) -> Result<PathBuf, StoreError> {
        let size = tokio::fs::metadata(staged).await?.len();
        let dest = self.paths.path_for_key(key)?;
        tokio::fs::rename(staged, &dest).await?;

        let evicted = {
            let mut state = self.state.lock().unwrap();
            let previous = state.entries.insert(
                key.to_string(),
                CacheEntry {
                    size,
                    inserted: Instant::now(),
                    last_access: self.tick.fetch_add(1, Ordering::Relaxed),
                },
            );
            state.total_bytes += size;
            if let Some(previous) = previous {
                state.total_bytes -= previous.size;
            }
            self.select_evictions(&mut state)
        };

        for victim in &evicted {
            debug!(key = %victim, "evicting cached blob");
            if let Ok(path) = self.paths.path_for_key(victim) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(key = %victim, error = %e, "failed to remove evicted file");
                    }
                }
            }
        }
        Ok(dest)
    }

    /// Pick LRU victims until the cache fits its bounds, skipping entries
    /// younger than the minimum age. The map is updated; file removal is
    /// the caller's, outside the lock.
    fn select_evictions(&self, state: &mut CacheState) -> Vec<String> {
        let mut evicted = Vec::new();
        let now = Instant::now();
        while state.total_bytes > self.config.max_bytes
            || state.entries.len() > self.config.max_count
        {
            let victim = state
                .entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.inserted) >= self.config.min_age)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else {
                // Everything left is too young; run over budget rather
                // than evict a file someone may still be adopting.
                break;
            };
            if let Some(entry) = state.entries.remove(&victim) {
                state.total_bytes -= entry.size;
            }
            evicted.push(victim);
        }
        evicted
    }

    async fn remove(&self, key: &str) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let entry = state.entries.remove(key);
            if let Some(entry) = &entry {
                state.total_bytes -= entry.size;
            }
            entry
        };
        if removed.is_some() {
            if let Ok(path) = self.paths.path_for_key(key) {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    #[cfg(test)]
    fn total_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_bytes
    }
}

/// A caching layer over a slower backing store.
pub struct CachingFileStore {
    backing: Arc<dyn FileStore>,
    cache: LruFileCache,
    tmp_store: LocalFileStore,
}

impl CachingFileStore {
    /// Create a caching layer with its cache files under `cache_dir`.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        config: CacheConfig,
        backing: Arc<dyn FileStore>,
    ) -> Self {
        let cache_dir = cache_dir.into();
        // Staged files share the cache directory so adoption into the
        // cache is a same-directory rename.
        let tmp_store = LocalFileStore::new(PathStrategy::flat(cache_dir.clone()));
        Self {
            backing,
            cache: LruFileCache::new(cache_dir, config),
            tmp_store,
        }
    }

    /// The store behind the cache
    pub fn backing(&self) -> &Arc<dyn FileStore> {
        &self.backing
    }

    /// The cached file for `key`, pulling it from the backing store on a
    /// miss. `Ok(None)` when the backing store does not have it either.
    async fn fetch(&self, key: &str) -> Result<Option<PathBuf>, StoreError> {
        validate_key(key)?;
        if let Some(path) = self.cache.get(key) {
            return Ok(Some(path));
        }

        let staging_key = random_key();
        let found = self
            .tmp_store
            .copy_file(&staging_key, self.backing.as_ref(), key, false, true)
            .await?;
        if !found {
            return Ok(None);
        }
        let staged = self.tmp_store.paths().path_for_key(&staging_key)?;
        let cached = self.cache.put(key, &staged).await?;
        debug!(key = %key, "fetched blob into cache");
        Ok(Some(cached))
    }
}

#[async_trait]
impl FileStore for CachingFileStore {
    async fn write_file(
        &self,
        ctx: &mut BlobWriteContext,
        mut observer: Option<&mut (dyn WriteObserver + '_)>,
        key: &KeySource,
    ) -> Result<String, StoreError> {
        // Stage into the cache directory first so the observer streams
        // over local I/O and the final key is known before the slower
        // backing write starts.
        let staging_key = random_key();
        self.tmp_store
            .write_file(ctx, observer.as_deref_mut(), &KeySource::Fixed(staging_key.clone()))
            .await?;
        let resolved = key.resolve(observer.as_deref()).and_then(|key| {
            validate_key(&key)?;
            Ok(key)
        });
        let key = match resolved {
            // A staged file must not outlive a failed write.
            Err(e) => {
                let _ = self.tmp_store.delete_file(&staging_key).await;
                return Err(e);
            }
            Ok(key) => key,
        };

        if self.cache.get(&key).is_some() {
            // Already cached means already in the backing store; the
            // duplicate staged bytes are dropped.
            debug!(key = %key, "write coalesced with cached blob");
            self.tmp_store.delete_file(&staging_key).await?;
            return Ok(key);
        }

        let staged = self.tmp_store.paths().path_for_key(&staging_key)?;
        let cached = self.cache.put(&key, &staged).await?;
        ctx.set_local_file(&cached);
        self.backing
            .write_file(ctx, None, &KeySource::Fixed(key.clone()))
            .await?;
        Ok(key)
    }

    /// Copies must go through the backing store or the unwrapped form;
    /// the cache is not an authoritative source.
    async fn copy_file(
        &self,
        _key: &str,
        _source: &dyn FileStore,
        _source_key: &str,
        _move_source: bool,
        _atomic: bool,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unsupported("copy_file on caching store"))
    }

    /// A non-triggering probe: reports the cached file without fetching
    /// from the backing store.
    async fn get_local_file(&self, key: &str) -> Result<Option<PathBuf>, StoreError> {
        validate_key(key)?;
        Ok(self.cache.get(key))
    }

    /// Unlike the other reads, a miss in the backing store is an error
    /// here: a caching layer is only put in front of a store expected to
    /// hold every key that is asked for.
    async fn get_stream(&self, key: &str) -> Result<Option<BlobStream>, StoreError> {
        // Two attempts cover the narrow window where an entry is evicted
        // between the fetch and the open.
        for _ in 0..2 {
            let Some(path) = self.fetch(key).await? else {
                return Err(StoreError::not_found(key));
            };
            match tokio::fs::File::open(&path).await {
                Ok(file) => return Ok(Some(Box::new(file))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::not_found(key))
    }

    async fn read_file_to(&self, key: &str, dest: &Path) -> Result<bool, StoreError> {
        let Some(path) = self.fetch(key).await? else {
            return Ok(false);
        };
        tokio::fs::copy(&path, dest).await?;
        Ok(true)
    }

    async fn delete_file(&self, key: &str) -> Result<(), StoreError> {
        self.cache.remove(key).await;
        self.backing.delete_file(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{Blob, BlobContext};
    use crate::digest::{DigestAlgorithm, DigestWriter};
    use crate::memory::InMemoryFileStore;
    use crate::path::TEMP_DIR_NAME;
    use tokio::io::AsyncReadExt;

    fn caching_store(
        dir: &Path,
        config: CacheConfig,
    ) -> (CachingFileStore, Arc<InMemoryFileStore>) {
        let backing = Arc::new(InMemoryFileStore::new());
        let store = CachingFileStore::new(dir, config, backing.clone());
        (store, backing)
    }

    fn write_ctx(data: &'static [u8]) -> BlobWriteContext {
        BlobWriteContext::new(BlobContext::new(Blob::from_bytes(data), "default"))
    }

    #[tokio::test]
    async fn test_write_populates_cache_and_backing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, backing) = caching_store(dir.path(), CacheConfig::default());

        let mut ctx = write_ctx(b"hello");
        let mut observer = DigestWriter::new(DigestAlgorithm::Sha256);
        let key = store
            .write_file(&mut ctx, Some(&mut observer), &KeySource::FromObserver)
            .await
            .unwrap();

        assert!(backing.contains(&key));
        assert!(store.cache.get(&key).is_some());
        // The forwarded write read from the staged cache file.
        assert!(ctx.local_file().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_write_skips_backing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, backing) = caching_store(dir.path(), CacheConfig::default());

        let mut ctx = write_ctx(b"hello");
        let mut observer = DigestWriter::new(DigestAlgorithm::Sha256);
        let key = store
            .write_file(&mut ctx, Some(&mut observer), &KeySource::FromObserver)
            .await
            .unwrap();

        backing.delete_file(&key).await.unwrap();

        let mut ctx = write_ctx(b"hello");
        let mut observer = DigestWriter::new(DigestAlgorithm::Sha256);
        let again = store
            .write_file(&mut ctx, Some(&mut observer), &KeySource::FromObserver)
            .await
            .unwrap();
        assert_eq!(again, key);
        // Coalesced with the cached entry, so the backing store was not
        // written a second time.
        assert!(!backing.contains(&key));
        assert_eq!(store.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let (store, backing) = caching_store(&cache_dir, CacheConfig::default());

        let mut ctx = write_ctx(b"orphan");
        let result = store
            .write_file(&mut ctx, None, &KeySource::Fixed("bad/key".to_string()))
            .await;
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));

        let mut ctx = write_ctx(b"orphan");
        let result = store.write_file(&mut ctx, None, &KeySource::FromObserver).await;
        assert!(matches!(result, Err(StoreError::MissingKey)));

        assert_eq!(store.cache.len(), 0);
        assert!(!backing.contains("bad/key"));
        // Only the empty tmp/ area remains in the cache directory.
        let mut entries = tokio::fs::read_dir(&cache_dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert_eq!(entry.file_name(), TEMP_DIR_NAME);
        }
    }

    #[tokio::test]
    async fn test_fetch_through_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (store, backing) = caching_store(dir.path(), CacheConfig::default());

        for key in ["k1", "k2"] {
            let mut ctx = write_ctx(b"remote bytes");
            backing
                .write_file(&mut ctx, None, &KeySource::Fixed(key.to_string()))
                .await
                .unwrap();
        }

        // The local-file probe never fetches, even for a key the
        // backing store holds.
        assert!(store.get_local_file("k2").await.unwrap().is_none());

        let mut stream = store.get_stream("k1").await.unwrap().unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"remote bytes");
        assert!(store.cache.get("k1").is_some());

        assert!(matches!(
            store.get_stream("absent").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_eviction_by_count_then_refetch() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            max_count: 2,
            min_age: Duration::ZERO,
            ..CacheConfig::default()
        };
        let (store, _backing) = caching_store(dir.path(), config);

        for (key, data) in [("k1", &b"aa"[..]), ("k2", b"bb"), ("k3", b"cc")] {
            let mut ctx =
                BlobWriteContext::new(BlobContext::new(Blob::from_bytes(data), "default"));
            store
                .write_file(&mut ctx, None, &KeySource::Fixed(key.to_string()))
                .await
                .unwrap();
        }
        assert_eq!(store.cache.len(), 2);
        // k1 was least recently used and got evicted, but survives in
        // the backing store and comes back through a read.
        assert!(store.cache.get("k1").is_none());
        let mut stream = store.get_stream("k1").await.unwrap().unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"aa");
    }

    #[tokio::test]
    async fn test_min_age_blocks_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            max_bytes: 1,
            min_age: Duration::from_secs(3600),
            ..CacheConfig::default()
        };
        let (store, _backing) = caching_store(dir.path(), config);

        for key in ["k1", "k2"] {
            let mut ctx = write_ctx(b"payload");
            store
                .write_file(&mut ctx, None, &KeySource::Fixed(key.to_string()))
                .await
                .unwrap();
        }
        // Over budget, but every entry is younger than the minimum age.
        assert_eq!(store.cache.len(), 2);
        assert!(store.cache.total_bytes() > 1);
    }

    #[tokio::test]
    async fn test_delete_clears_cache_and_backing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, backing) = caching_store(dir.path(), CacheConfig::default());

        let mut ctx = write_ctx(b"x");
        store
            .write_file(&mut ctx, None, &KeySource::Fixed("k1".to_string()))
            .await
            .unwrap();

        store.delete_file("k1").await.unwrap();
        assert!(store.cache.get("k1").is_none());
        assert!(!backing.contains("k1"));
        assert!(matches!(
            store.get_stream("k1").await,
            Err(StoreError::NotFound(_))
        ));
    }
}

//! VideoCache: read-through facade over storage and the fetch coordinator

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};
use vidstore::{ByteRange, CacheKey, DiskStore, MemoryStore, StorageBackend};

use crate::config::{CacheConfig, StorageConfig};
use crate::coordinator::FetchCoordinator;
use crate::error::{Error, Result};
use crate::origin::Origin;
use crate::stats::CacheStats;

/// Byte-range cache for remote media segments
///
/// Create one instance with [`VideoCache::init`] and share the returned
/// `Arc` with every caller; tear it down with [`VideoCache::shutdown`].
pub struct VideoCache {
    store: Arc<dyn StorageBackend>,
    coordinator: FetchCoordinator,
    stats: Arc<CacheStats>,
    config: CacheConfig,
    closed: AtomicBool,
}

impl VideoCache {
    /// Build the configured backend and a cache reading from `origin`
    pub fn init(config: CacheConfig, origin: Arc<dyn Origin>) -> Result<Arc<Self>> {
        let store: Arc<dyn StorageBackend> = match &config.storage {
            StorageConfig::Memory => Arc::new(MemoryStore::new(config.capacity)),
            StorageConfig::Disk(path) => Arc::new(DiskStore::open(path, config.capacity)?),
        };

        info!(
            capacity = config.capacity,
            storage = ?config.storage,
            cached_bytes = store.current_size(),
            "video cache ready"
        );
        Ok(Self::with_store(store, origin, config))
    }

    /// Build a cache over a caller-supplied backend
    ///
    /// The backend's own capacity applies; `config.capacity` is ignored.
    pub fn with_store(
        store: Arc<dyn StorageBackend>,
        origin: Arc<dyn Origin>,
        config: CacheConfig,
    ) -> Arc<Self> {
        let stats = Arc::new(CacheStats::new());
        let coordinator =
            FetchCoordinator::new(Arc::clone(&store), origin, &config, Arc::clone(&stats));

        Arc::new(Self {
            store,
            coordinator,
            stats,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Read `range` of `resource`, fetching it from the origin on a miss
    ///
    /// Concurrent reads of the same range share one origin request.
    pub async fn read(&self, resource: &str, range: ByteRange) -> Result<Bytes> {
        self.ensure_open()?;
        let key = CacheKey::new(resource, range);

        match self.store.get(&key) {
            Ok(bytes) => {
                self.stats.record_hit();
                debug!(%key, "cache hit");
                return Ok(bytes);
            }
            Err(e) if e.is_miss() => {
                self.stats.record_miss();
                debug!(%key, "cache miss");
            }
            Err(e) => return Err(e.into()),
        }

        self.coordinator.fetch(key).await
    }

    /// Read `[start, end)` of `resource`
    pub async fn read_range(&self, resource: &str, start: u64, end: u64) -> Result<Bytes> {
        let range = ByteRange::new(start, end)?;
        self.read(resource, range).await
    }

    /// Drop every cached segment of `resource` and cancel its pending fetches
    ///
    /// Returns the number of cached segments removed.
    pub fn invalidate(&self, resource: &str) -> Result<usize> {
        self.ensure_open()?;
        self.coordinator.invalidate(resource)
    }

    /// Whether `range` of `resource` is cached
    pub fn contains(&self, resource: &str, range: ByteRange) -> bool {
        self.store.contains(&CacheKey::new(resource, range))
    }

    /// Close the cache: cancel pending fetches and flush the backend
    ///
    /// Reads after shutdown fail with [`Error::Closed`]. Calling it again is a
    /// no-op.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancelled = self.coordinator.close();
        self.store.flush()?;
        info!(cancelled, cached_bytes = self.store.current_size(), "video cache shut down");
        Ok(())
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Get the configuration the cache was built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Bytes currently cached
    pub fn current_size(&self) -> u64 {
        self.store.current_size()
    }

    /// Capacity of the backend in bytes
    pub fn capacity(&self) -> u64 {
        self.store.capacity()
    }

    /// Number of cached segments
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Number of origin fetches in flight
    pub fn pending_fetches(&self) -> usize {
        self.coordinator.pending_count()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Serves `range.len()` copies of the first byte of the resource name
    #[derive(Default)]
    struct FillOrigin {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Origin for FillOrigin {
        async fn fetch_range(
            &self,
            resource: &str,
            range: ByteRange,
        ) -> std::result::Result<Bytes, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fill = resource.as_bytes().first().copied().unwrap_or(0);
            Ok(Bytes::from(vec![fill; range.len() as usize]))
        }
    }

    fn range(start: u64, end: u64) -> ByteRange {
        ByteRange::new(start, end).unwrap()
    }

    #[tokio::test]
    async fn test_cache_basic() {
        let origin = Arc::new(FillOrigin::default());
        let cache = VideoCache::init(CacheConfig::new().with_capacity(1024), origin.clone()).unwrap();

        let data = cache.read("v1", range(0, 10)).await.unwrap();
        assert_eq!(data, Bytes::from(vec![b'v'; 10]));
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hits(), 0);

        let again = cache.read("v1", range(0, 10)).await.unwrap();
        assert_eq!(again, data);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_range_validates() {
        let cache = VideoCache::init(CacheConfig::new(), Arc::new(FillOrigin::default())).unwrap();

        let result = cache.read_range("v1", 10, 10).await;
        assert!(matches!(result, Err(Error::InvalidRange { start: 10, end: 10 })));
    }

    #[tokio::test]
    async fn test_cache_eviction() {
        let origin = Arc::new(FillOrigin::default());
        let cache = VideoCache::init(CacheConfig::new().with_capacity(100), origin.clone()).unwrap();

        cache.read("A", range(0, 60)).await.unwrap();
        cache.read("B", range(0, 60)).await.unwrap();

        assert!(!cache.contains("A", range(0, 60)));
        assert!(cache.contains("B", range(0, 60)));
        assert_eq!(cache.current_size(), 60);
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let origin = Arc::new(FillOrigin::default());
        let cache = VideoCache::init(CacheConfig::new(), origin.clone()).unwrap();

        cache.read("v1", range(0, 10)).await.unwrap();
        cache.read("v1", range(10, 20)).await.unwrap();
        cache.read("v2", range(0, 10)).await.unwrap();

        assert_eq!(cache.invalidate("v1").unwrap(), 2);
        assert_eq!(cache.len(), 1);

        cache.read("v1", range(0, 10)).await.unwrap();
        assert_eq!(origin.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let cache = VideoCache::init(CacheConfig::new(), Arc::new(FillOrigin::default())).unwrap();

        cache.shutdown().unwrap();
        cache.shutdown().unwrap();

        assert!(cache.is_closed());
        assert!(matches!(cache.read("v1", range(0, 1)).await, Err(Error::Closed)));
        assert!(matches!(cache.invalidate("v1"), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_disk_backed_cache_survives_restart() {
        let dir = TempDir::new().unwrap();
        let origin = Arc::new(FillOrigin::default());
        let config = CacheConfig::new().with_capacity(4096).on_disk(dir.path());

        {
            let cache = VideoCache::init(config.clone(), origin.clone()).unwrap();
            cache.read("seg", range(0, 100)).await.unwrap();
            cache.shutdown().unwrap();
        }

        let cache = VideoCache::init(config, origin.clone()).unwrap();
        let data = cache.read("seg", range(0, 100)).await.unwrap();

        assert_eq!(data.len(), 100);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    }
}

//! Storage backend contract

use bytes::Bytes;

use crate::error::Result;
use crate::key::CacheKey;

/// Thread-safe byte-range store with capacity-bounded LRU eviction
///
/// Implementations keep `current_size() <= capacity()` after every `put`.
pub trait StorageBackend: Send + Sync {
    /// Insert or replace a segment
    ///
    /// Evicts entries first when the insert would exceed capacity and
    /// returns the evicted keys. A segment larger than the capacity is
    /// rejected with [`Error::Full`](crate::Error::Full) and nothing is
    /// evicted.
    fn put(&self, key: CacheKey, data: Bytes) -> Result<Vec<CacheKey>>;

    /// Fetch a segment and mark it most recently used
    ///
    /// Returns [`Error::Miss`](crate::Error::Miss) when the key is not cached.
    fn get(&self, key: &CacheKey) -> Result<Bytes>;

    /// Remove a segment, returning whether it was present
    fn remove(&self, key: &CacheKey) -> Result<bool>;

    /// Remove every segment of `resource`
    fn remove_resource(&self, resource: &str) -> Result<Vec<CacheKey>>;

    /// Check for a servable segment without touching its recency
    fn contains(&self, key: &CacheKey) -> bool;

    /// Snapshot of all cached keys
    fn keys(&self) -> Vec<CacheKey>;

    /// Drop every segment
    fn clear(&self) -> Result<()>;

    /// Persist whatever the backend keeps only in memory
    fn flush(&self) -> Result<()>;

    /// Bytes currently held
    fn current_size(&self) -> u64;

    /// Configured capacity in bytes
    fn capacity(&self) -> u64;

    /// Number of cached segments
    fn len(&self) -> usize;

    /// True when nothing is cached
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

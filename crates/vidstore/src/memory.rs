//! In-memory storage backend

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::backend::StorageBackend;
use crate::error::{Error, Result};
use crate::eviction::{EvictionPolicy, LruPolicy};
use crate::key::CacheKey;
use crate::ledger::Ledger;

/// Segments held as reference-counted buffers
pub struct MemoryStore {
    ledger: Mutex<Ledger<Bytes>>,
}

impl MemoryStore {
    /// Create a store bounded to `capacity` bytes with LRU eviction
    pub fn new(capacity: u64) -> Self {
        Self::with_policy(capacity, Arc::new(LruPolicy))
    }

    /// Create a store with a custom eviction policy
    pub fn with_policy(capacity: u64, policy: Arc<dyn EvictionPolicy>) -> Self {
        Self {
            ledger: Mutex::new(Ledger::new(capacity, policy)),
        }
    }
}

impl StorageBackend for MemoryStore {
    fn put(&self, key: CacheKey, data: Bytes) -> Result<Vec<CacheKey>> {
        let size = data.len() as u64;
        let mut ledger = self.ledger.lock();

        ledger.check_fits(size)?;
        ledger.remove(&key);
        let evicted = ledger.make_room(size)?;
        ledger.insert(key, data, size);

        Ok(evicted.into_iter().map(|(key, _)| key).collect())
    }

    fn get(&self, key: &CacheKey) -> Result<Bytes> {
        let mut ledger = self.ledger.lock();
        ledger
            .touch(key)
            .map(|entry| entry.payload().clone())
            .ok_or(Error::Miss)
    }

    fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.ledger.lock().remove(key).is_some())
    }

    fn remove_resource(&self, resource: &str) -> Result<Vec<CacheKey>> {
        let removed = self.ledger.lock().remove_resource(resource);
        Ok(removed.into_iter().map(|(key, _)| key).collect())
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.ledger.lock().contains(key)
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.ledger.lock().keys()
    }

    fn clear(&self) -> Result<()> {
        self.ledger.lock().drain();
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn current_size(&self) -> u64 {
        self.ledger.lock().size()
    }

    fn capacity(&self) -> u64 {
        self.ledger.lock().capacity()
    }

    fn len(&self) -> usize {
        self.ledger.lock().len()
    }
}

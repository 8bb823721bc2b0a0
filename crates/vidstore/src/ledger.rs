//! Entry index and size accounting shared by every backend
//!
//! A `Ledger` is never locked on its own; each backend keeps it behind its
//! own mutex together with whatever owns the payload bytes.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;

use crate::error::{Error, Result};
use crate::eviction::{Candidate, EvictionPolicy};
use crate::key::CacheKey;

/// One cached segment
#[derive(Debug)]
pub(crate) struct CacheEntry<P> {
    payload: P,
    last_access: u64,
    size: u64,
    valid: bool,
}

impl<P> CacheEntry<P> {
    pub(crate) fn payload(&self) -> &P {
        &self.payload
    }

    pub(crate) fn into_payload(self) -> P {
        self.payload
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access
    }
}

pub(crate) struct Ledger<P> {
    entries: HashMap<CacheKey, CacheEntry<P>, RandomState>,
    size: u64,
    capacity: u64,
    clock: u64,
    policy: Arc<dyn EvictionPolicy>,
}

impl<P> Ledger<P> {
    pub(crate) fn new(capacity: u64, policy: Arc<dyn EvictionPolicy>) -> Self {
        Self {
            entries: HashMap::with_hasher(RandomState::new()),
            size: 0,
            capacity,
            clock: 0,
            policy,
        }
    }

    /// Advance the logical clock
    pub(crate) fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up a servable entry and mark it as most recently used
    pub(crate) fn touch(&mut self, key: &CacheKey) -> Option<&CacheEntry<P>> {
        let now = self.next_tick();
        match self.entries.get_mut(key) {
            Some(entry) if entry.valid => {
                entry.last_access = now;
                Some(entry)
            }
            _ => None,
        }
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.valid)
    }

    /// Reject entries that could never fit, before anything is touched
    pub(crate) fn check_fits(&self, size: u64) -> Result<()> {
        if size > self.capacity {
            return Err(Error::Full {
                needed: size,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Evict until `incoming` more bytes fit under capacity
    ///
    /// Returns the evicted entries so the caller can release their payloads.
    pub(crate) fn make_room(&mut self, incoming: u64) -> Result<Vec<(CacheKey, CacheEntry<P>)>> {
        self.check_fits(incoming)?;

        let mut evicted = Vec::new();
        while self.size + incoming > self.capacity {
            let needed = self.size + incoming - self.capacity;
            let victims = self.policy.select_victims(&self.candidates(), needed);

            let before = evicted.len();
            for key in victims {
                if let Some(entry) = self.remove(&key) {
                    evicted.push((key, entry));
                }
            }

            if evicted.len() == before {
                return Err(Error::Full {
                    needed: incoming,
                    capacity: self.capacity,
                });
            }
        }
        Ok(evicted)
    }

    /// Insert an entry stamped with a fresh tick
    ///
    /// Callers must have removed any previous entry for `key` and made room.
    pub(crate) fn insert(&mut self, key: CacheKey, payload: P, size: u64) -> u64 {
        let stamp = self.next_tick();
        self.insert_stamped(key, payload, size, stamp);
        stamp
    }

    /// Insert an entry restored with a known access tick
    pub(crate) fn insert_stamped(&mut self, key: CacheKey, payload: P, size: u64, stamp: u64) {
        self.clock = self.clock.max(stamp);
        self.size += size;
        let entry = CacheEntry {
            payload,
            last_access: stamp,
            size,
            valid: true,
        };
        if let Some(old) = self.entries.insert(key, entry) {
            self.size -= old.size;
        }
    }

    pub(crate) fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry<P>> {
        let entry = self.entries.remove(key)?;
        self.size -= entry.size;
        Some(entry)
    }

    pub(crate) fn remove_resource(&mut self, resource: &str) -> Vec<(CacheKey, CacheEntry<P>)> {
        let keys: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|k| k.resource() == resource)
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|key| self.remove(&key).map(|entry| (key, entry)))
            .collect()
    }

    /// Stop serving an entry; it stays accounted until evicted or removed
    pub(crate) fn mark_invalid(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.valid = false;
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<(CacheKey, CacheEntry<P>)> {
        self.size = 0;
        self.entries.drain().collect()
    }

    pub(crate) fn keys(&self) -> Vec<CacheKey> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&CacheKey, &CacheEntry<P>)> {
        self.entries.iter()
    }

    fn candidates(&self) -> Vec<Candidate> {
        self.entries
            .iter()
            .map(|(key, entry)| Candidate {
                key: key.clone(),
                last_access: entry.last_access,
                size: entry.size,
                valid: entry.valid,
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }
}

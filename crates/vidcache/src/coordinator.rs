//! Single-flight fetch coordination
//!
//! At most one origin retrieval runs per [`CacheKey`]. The first caller to
//! miss spawns the retrieval as a Tokio task; later callers subscribe to the
//! same outcome slot. The task stores the bytes, removes the pending entry and
//! publishes the outcome while holding the pending-map lock, so a caller
//! either joins the in-flight fetch or finds the bytes already stored.
//!
//! Lock order: pending map, then storage backend. Completion writes into the
//! backend under the pending-map lock, so a slow backend put (a disk write
//! with fsync) stalls every `fetch` and `invalidate` until it returns. That
//! keeps invalidation exact: once `invalidate` returns, no fetch that started
//! before it can still store bytes for the resource.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use vidstore::{CacheKey, StorageBackend};

use crate::config::{CacheConfig, RetryPolicy};
use crate::error::{Error, NetworkError, Result};
use crate::origin::Origin;
use crate::stats::CacheStats;

type Outcome = Result<Bytes>;

/// In-flight retrieval shared by every waiter on one key
struct PendingFetch {
    id: u64,
    waiters: usize,
    outcome: watch::Sender<Option<Outcome>>,
    task: AbortHandle,
}

struct Shared {
    store: Arc<dyn StorageBackend>,
    origin: Arc<dyn Origin>,
    retry: RetryPolicy,
    timeout: Duration,
    stats: Arc<CacheStats>,
    pending: Mutex<HashMap<CacheKey, PendingFetch, RandomState>>,
    next_id: AtomicU64,
    // Written and read only under the `pending` lock.
    closed: AtomicBool,
}

enum Joined {
    Ready(Bytes),
    Waiting {
        outcome: watch::Receiver<Option<Outcome>>,
        guard: WaiterGuard,
    },
}

/// Deduplicates origin reads and populates the storage backend
pub struct FetchCoordinator {
    shared: Arc<Shared>,
}

impl FetchCoordinator {
    /// Create a coordinator writing into `store`
    pub fn new(
        store: Arc<dyn StorageBackend>,
        origin: Arc<dyn Origin>,
        config: &CacheConfig,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                origin,
                retry: config.retry.clone(),
                timeout: config.fetch_timeout,
                stats,
                pending: Mutex::new(HashMap::with_hasher(RandomState::new())),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Fetch `key` from the origin, joining an in-flight fetch if one exists
    ///
    /// Must be called from within a Tokio runtime. Dropping the returned
    /// future leaves the waiter set; when the last waiter leaves, the
    /// retrieval is aborted.
    pub async fn fetch(&self, key: CacheKey) -> Result<Bytes> {
        let (mut outcome, guard) = match self.join(key)? {
            Joined::Ready(bytes) => return Ok(bytes),
            Joined::Waiting { outcome, guard } => (outcome, guard),
        };

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(slot) => {
                let published: Option<Outcome> = (*slot).clone();
                published.unwrap_or(Err(Error::Cancelled))
            }
            Err(_) => Err(Error::Cancelled),
        };
        drop(guard);
        result
    }

    /// Cancel pending fetches for `resource` and drop its stored segments
    ///
    /// Waiters of the cancelled fetches receive [`Error::Cancelled`]. Returns
    /// the number of stored segments removed.
    pub fn invalidate(&self, resource: &str) -> Result<usize> {
        let mut pending = self.shared.pending.lock();
        let cancelled = self
            .shared
            .cancel_where(&mut pending, |key| key.resource() == resource);
        let removed = self.shared.store.remove_resource(resource)?;

        debug!(resource, cancelled, removed = removed.len(), "invalidated resource");
        Ok(removed.len())
    }

    /// Cancel pending fetches for `resource`, leaving stored segments alone
    pub fn cancel_resource(&self, resource: &str) -> usize {
        let mut pending = self.shared.pending.lock();
        self.shared
            .cancel_where(&mut pending, |key| key.resource() == resource)
    }

    /// Cancel every pending fetch, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.shared.pending.lock();
        self.shared.cancel_where(&mut pending, |_| true)
    }

    /// Refuse new fetches and cancel every pending one
    ///
    /// Later calls to [`fetch`](Self::fetch) fail with [`Error::Closed`].
    /// Returns how many fetches were cancelled.
    pub fn close(&self) -> usize {
        let mut pending = self.shared.pending.lock();
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cancel_where(&mut pending, |_| true)
    }

    /// Number of fetches in flight
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Whether a fetch for `key` is in flight
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.shared.pending.lock().contains_key(key)
    }

    fn join(&self, key: CacheKey) -> Result<Joined> {
        let shared = &self.shared;
        let mut pending = shared.pending.lock();
        if shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        if let Some(fetch) = pending.get_mut(&key) {
            fetch.waiters += 1;
            shared.stats.record_coalesced();
            debug!(%key, waiters = fetch.waiters, "joined in-flight fetch");
            return Ok(Joined::Waiting {
                outcome: fetch.outcome.subscribe(),
                guard: WaiterGuard::new(shared, key, fetch.id),
            });
        }

        // The caller's miss may predate a fetch that has since completed.
        match shared.store.get(&key) {
            Ok(bytes) => return Ok(Joined::Ready(bytes)),
            Err(e) if e.is_miss() => {}
            Err(e) => return Err(e.into()),
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        let task = tokio::spawn(Arc::clone(shared).run(key.clone(), id));

        debug!(%key, id, "starting fetch");
        pending.insert(
            key.clone(),
            PendingFetch {
                id,
                waiters: 1,
                outcome: sender,
                task: task.abort_handle(),
            },
        );

        Ok(Joined::Waiting {
            outcome: receiver,
            guard: WaiterGuard::new(shared, key, id),
        })
    }
}

impl Shared {
    async fn run(self: Arc<Self>, key: CacheKey, id: u64) {
        let outcome = match tokio::time::timeout(self.timeout, self.retrieve(&key)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(%key, timeout = ?self.timeout, "fetch timed out");
                Err(Error::Timeout(self.timeout))
            }
        };
        self.complete(&key, id, outcome);
    }

    async fn retrieve(&self, key: &CacheKey) -> Outcome {
        let range = key.range();
        let mut attempt = 0;

        loop {
            self.stats.record_origin_request();
            match self.origin.fetch_range(key.resource(), range).await {
                Ok(bytes) if bytes.len() as u64 > range.len() => {
                    return Err(NetworkError::permanent(format!(
                        "origin returned {} bytes for a {}-byte range",
                        bytes.len(),
                        range.len()
                    ))
                    .into());
                }
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    attempt += 1;
                    self.stats.record_retry();
                    warn!(%key, attempt, ?delay, error = %err, "transient origin failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn complete(&self, key: &CacheKey, id: u64, outcome: Outcome) {
        let mut pending = self.pending.lock();
        if !pending.get(key).is_some_and(|fetch| fetch.id == id) {
            // Cancelled while the origin was answering.
            return;
        }

        let outcome = outcome.and_then(|bytes| {
            let evicted = self.store.put(key.clone(), bytes.clone())?;
            self.stats.record_insert();
            self.stats.record_evictions(evicted.len());
            Ok(bytes)
        });

        match &outcome {
            Ok(bytes) => debug!(%key, len = bytes.len(), "fetch complete"),
            Err(e) => {
                self.stats.record_failure();
                warn!(%key, error = %e, "fetch failed");
            }
        }

        if let Some(fetch) = pending.remove(key) {
            fetch.outcome.send_replace(Some(outcome));
        }
    }

    fn cancel_where(
        &self,
        pending: &mut HashMap<CacheKey, PendingFetch, RandomState>,
        matches: impl Fn(&CacheKey) -> bool,
    ) -> usize {
        let keys: Vec<CacheKey> = pending.keys().filter(|k| matches(k)).cloned().collect();

        for key in &keys {
            if let Some(fetch) = pending.remove(key) {
                fetch.task.abort();
                fetch.outcome.send_replace(Some(Err(Error::Cancelled)));
                self.stats.record_cancellation();
                debug!(%key, waiters = fetch.waiters, "fetch cancelled");
            }
        }
        keys.len()
    }

    fn leave(&self, key: &CacheKey, id: u64) {
        let mut pending = self.pending.lock();
        let abandoned = match pending.get_mut(key) {
            Some(fetch) if fetch.id == id => {
                fetch.waiters -= 1;
                fetch.waiters == 0
            }
            _ => false,
        };

        if abandoned {
            if let Some(fetch) = pending.remove(key) {
                fetch.task.abort();
                self.stats.record_cancellation();
                debug!(%key, "all waiters left, fetch aborted");
            }
        }
    }
}

/// Membership in a pending fetch's waiter set
struct WaiterGuard {
    shared: Arc<Shared>,
    key: CacheKey,
    id: u64,
}

impl WaiterGuard {
    fn new(shared: &Arc<Shared>, key: CacheKey, id: u64) -> Self {
        Self {
            shared: Arc::clone(shared),
            key,
            id,
        }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.shared.leave(&self.key, self.id);
    }
}

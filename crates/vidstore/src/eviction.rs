//! Eviction policy: which entries to reclaim under capacity pressure

use crate::key::CacheKey;

/// Snapshot of one entry handed to an [`EvictionPolicy`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Key of the entry
    pub key: CacheKey,
    /// Logical tick of the last `put` or `get`
    pub last_access: u64,
    /// Payload size in bytes
    pub size: u64,
    /// False once the entry can no longer be served
    pub valid: bool,
}

/// Chooses victims when an insert would exceed capacity
pub trait EvictionPolicy: Send + Sync {
    /// Return keys to evict, in eviction order, freeing at least
    /// `bytes_needed` bytes when the candidates allow it
    fn select_victims(&self, candidates: &[Candidate], bytes_needed: u64) -> Vec<CacheKey>;
}

/// Least-recently-used, smallest entry first on equal access time
///
/// Invalid entries go before every valid one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LruPolicy;

impl LruPolicy {
    /// Create the policy
    pub fn new() -> Self {
        Self
    }
}

impl EvictionPolicy for LruPolicy {
    fn select_victims(&self, candidates: &[Candidate], bytes_needed: u64) -> Vec<CacheKey> {
        if bytes_needed == 0 {
            return Vec::new();
        }

        let mut order: Vec<&Candidate> = candidates.iter().collect();
        order.sort_by(|a, b| {
            a.valid
                .cmp(&b.valid)
                .then(a.last_access.cmp(&b.last_access))
                .then(a.size.cmp(&b.size))
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut freed = 0u64;
        let mut victims = Vec::new();
        for candidate in order {
            if freed >= bytes_needed {
                break;
            }
            freed += candidate.size;
            victims.push(candidate.key.clone());
        }
        victims
    }
}

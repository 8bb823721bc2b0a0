//! Cache configuration

use std::path::PathBuf;
use std::time::Duration;

/// Where cached segments live
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageConfig {
    /// Process memory, lost on shutdown
    #[default]
    Memory,
    /// One file per segment under this directory
    Disk(PathBuf),
}

/// Retry schedule for transient origin failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_backoff.checked_mul(factor))
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Configuration for [`VideoCache`](crate::VideoCache)
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum bytes held by the storage backend
    pub capacity: u64,
    /// Storage medium
    pub storage: StorageConfig,
    /// Deadline for one coordinated fetch, retries included
    pub fetch_timeout: Duration,
    /// Retry schedule for transient failures
    pub retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256 * 1024 * 1024, // 256 MiB
            storage: StorageConfig::Memory,
            fetch_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity in bytes
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Keep segments in memory
    pub fn in_memory(mut self) -> Self {
        self.storage = StorageConfig::Memory;
        self
    }

    /// Persist segments under `path`
    pub fn on_disk(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage = StorageConfig::Disk(path.into());
        self
    }

    /// Set the per-fetch timeout
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_retries: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };

        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(500));
        assert_eq!(retry.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_builder() {
        let config = CacheConfig::new()
            .with_capacity(1024)
            .on_disk("/tmp/segments")
            .with_fetch_timeout(Duration::from_secs(2))
            .with_retry(RetryPolicy::none());

        assert_eq!(config.capacity, 1024);
        assert_eq!(config.storage, StorageConfig::Disk(PathBuf::from("/tmp/segments")));
        assert_eq!(config.fetch_timeout, Duration::from_secs(2));
        assert_eq!(config.retry.max_retries, 0);
    }
}

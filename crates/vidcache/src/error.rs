//! Error types for vidcache

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Whether a failed origin read is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection reset, throttling, temporary unavailability
    Transient,
    /// Resource missing, range unsatisfiable, malformed response
    Permanent,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkErrorKind::Transient => f.write_str("transient"),
            NetworkErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Failure reported by an [`Origin`](crate::Origin)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} network error: {message}")]
pub struct NetworkError {
    kind: NetworkErrorKind,
    message: String,
}

impl NetworkError {
    /// A failure that may succeed on retry
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: NetworkErrorKind::Transient,
            message: message.into(),
        }
    }

    /// A failure that will not go away by retrying
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: NetworkErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Error classification
    pub fn kind(&self) -> NetworkErrorKind {
        self.kind
    }

    /// Human-readable cause
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for retryable failures
    pub fn is_transient(&self) -> bool {
        self.kind == NetworkErrorKind::Transient
    }
}

/// Error returned to cache readers
///
/// Cloneable so one fetch outcome can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Origin read failed (after retries, for transient failures)
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// The segment cannot fit in the cache
    #[error("Cache full: cannot fit {needed} bytes (capacity {capacity} bytes)")]
    Full {
        /// Size of the rejected segment
        needed: u64,
        /// Configured capacity
        capacity: u64,
    },

    /// The fetch did not finish within the configured timeout
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The fetch was cancelled by invalidation or shutdown
    #[error("Fetch cancelled")]
    Cancelled,

    /// Byte range with `start >= end`
    #[error("Invalid byte range: [{start}, {end})")]
    InvalidRange {
        /// Requested start offset
        start: u64,
        /// Requested end offset
        end: u64,
    },

    /// The cache has been shut down
    #[error("Cache is shut down")]
    Closed,

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Store(Arc<vidstore::Error>),
}

impl From<vidstore::Error> for Error {
    fn from(err: vidstore::Error) -> Self {
        match err {
            vidstore::Error::Full { needed, capacity } => Error::Full { needed, capacity },
            vidstore::Error::InvalidRange { start, end } => Error::InvalidRange { start, end },
            vidstore::Error::Closed => Error::Closed,
            other => Error::Store(Arc::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_kind() {
        let err = NetworkError::transient("connection reset");
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "transient network error: connection reset");

        let err = NetworkError::permanent("404");
        assert!(!err.is_transient());
        assert_eq!(err.kind(), NetworkErrorKind::Permanent);
    }

    #[test]
    fn test_store_error_mapping() {
        let err: Error = vidstore::Error::Full {
            needed: 10,
            capacity: 5,
        }
        .into();
        assert!(matches!(err, Error::Full { needed: 10, capacity: 5 }));

        let err: Error = vidstore::Error::Parse("bad".to_string()).into();
        assert!(matches!(err, Error::Store(_)));
    }
}

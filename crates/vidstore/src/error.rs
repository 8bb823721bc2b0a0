//! Error types for vidstore

use std::io;

use thiserror::Error;

/// Result type alias for vidstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed segment or index file
    #[error("Parse error: {0}")]
    Parse(String),

    /// Byte range with `start >= end`
    #[error("Invalid byte range: [{start}, {end})")]
    InvalidRange {
        /// Requested start offset
        start: u64,
        /// Requested end offset
        end: u64,
    },

    /// The store cannot make room for an entry of this size
    #[error("Cache full: cannot fit {needed} bytes (capacity {capacity} bytes)")]
    Full {
        /// Size of the rejected entry
        needed: u64,
        /// Configured capacity
        capacity: u64,
    },

    /// Key not cached
    #[error("Cache miss")]
    Miss,

    /// Store has been closed
    #[error("Store is closed")]
    Closed,
}

impl Error {
    /// Returns true for a cache miss
    pub fn is_miss(&self) -> bool {
        matches!(self, Error::Miss)
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => Error::Parse("truncated input".to_string()),
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                Error::Parse(format!("{:?} with {} bytes remaining", e.code, e.input.len()))
            }
        }
    }
}

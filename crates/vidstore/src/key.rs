//! Cache keys: a resource identifier plus a half-open byte range

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    /// Create a range, rejecting empty or inverted bounds
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// First byte offset (inclusive)
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Last byte offset (exclusive)
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered by the range
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Always false: empty ranges cannot be constructed
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Immutable cache key
///
/// Keys match exactly: a cached `[0, 100)` does not satisfy a read of `[0, 50)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    resource: Arc<str>,
    range: ByteRange,
}

impl CacheKey {
    /// Build a key for `resource` covering `range`
    pub fn new(resource: impl Into<Arc<str>>, range: ByteRange) -> Self {
        Self {
            resource: resource.into(),
            range,
        }
    }

    /// Resource identifier (opaque to the cache)
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Byte range of the segment
    pub fn range(&self) -> ByteRange {
        self.range
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.resource, self.range)
    }
}

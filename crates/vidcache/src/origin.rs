//! Network-fetch capability supplied by the host

use async_trait::async_trait;
use bytes::Bytes;
use vidstore::ByteRange;

use crate::error::NetworkError;

/// Source of segment bytes on a cache miss
///
/// Implementations may return fewer bytes than requested when the range runs
/// past the end of the resource, never more.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Read `range` of `resource`
    async fn fetch_range(&self, resource: &str, range: ByteRange) -> Result<Bytes, NetworkError>;
}

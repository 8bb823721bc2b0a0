//! # vidcache
//!
//! Read-through cache for byte ranges of remote media segments.
//!
//! ## Architecture
//! - **Storage**: [`vidstore`] backends, bounded by capacity with LRU eviction
//! - **Coordinator**: single-flight origin reads with retry, timeout and
//!   cancellation
//! - **Facade**: [`VideoCache`] checks storage first and delegates misses
//!
//! The host supplies the network side by implementing [`Origin`].

#![warn(missing_docs)]

mod cache;
mod config;
mod coordinator;
mod error;
mod origin;
mod stats;

pub use cache::VideoCache;
pub use config::{CacheConfig, RetryPolicy, StorageConfig};
pub use coordinator::FetchCoordinator;
pub use error::{Error, NetworkError, NetworkErrorKind, Result};
pub use origin::Origin;
pub use stats::CacheStats;
pub use vidstore::{ByteRange, CacheKey};

//! # vidstore
//!
//! Byte-range segment storage for the video cache.
//!
//! ## Architecture
//! - **CacheKey**: resource identifier + half-open byte range
//! - **Ledger**: AHash index with size accounting and a logical access clock
//! - **EvictionPolicy**: LRU by access tick, smallest entry first on ties
//! - **Backends**: [`MemoryStore`] (in-process buffers) and [`DiskStore`]
//!   (one file per segment, recovered on open)
//!
//! Every backend keeps `current_size() <= capacity()` once a `put` returns.

#![warn(missing_docs)]

mod backend;
mod disk;
mod error;
mod eviction;
pub mod format;
mod key;
mod ledger;
mod memory;

pub use backend::StorageBackend;
pub use disk::DiskStore;
pub use error::{Error, Result};
pub use eviction::{Candidate, EvictionPolicy, LruPolicy};
pub use key::{ByteRange, CacheKey};
pub use memory::MemoryStore;

//! # proxycache
//!
//! LRU decorator for [`proxystore::Storage`] backends.
//!
//! ## Architecture
//! - **LruStorage**: recency list + AHash key map, item/byte ceilings, O(1) eviction
//! - **LruStorageSt**: direct pass-through for a single owner
//! - **LruStorageMt**: one `parking_lot::Mutex` per instance, held for one call
//! - **CacheStats**: hit/miss/insert/update/delete/eviction counters

#![warn(missing_docs)]

mod lru;
mod stats;
mod storage;

pub use lru::{Limits, LruStorage};
pub use stats::CacheStats;
pub use storage::{LruStorageMt, LruStorageSt};

//! # proxystore
//!
//! Key/value storage interface for the query result cache.
//!
//! ## Architecture
//! - **Storage**: trait every backend implements (get/put/delete, head/tail, totals, info)
//! - **CacheKey**: opaque `u64` identity derived from the query and default database
//! - **InMemoryStorage**: AHash map backend with optional soft/hard TTL

#![warn(missing_docs)]

mod error;
mod key;
mod memory;
mod storage;

pub use error::{Error, Result};
pub use key::CacheKey;
pub use memory::{InMemoryStorage, TtlConfig};
pub use storage::{GetFlags, InfoFlags, Storage};

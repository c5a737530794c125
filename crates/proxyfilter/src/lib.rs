//! # proxyfilter
//!
//! Query interception chain for a database proxy.
//!
//! ## Architecture
//! - **Filter / FilterSession**: a filter type and its per-connection sessions
//! - **Downstream / Upstream**: non-owning handles on the neighbouring components
//! - **FilterModule**: the panic-guarded entry points a pipeline driver calls
//! - **CacheFilter**: answers repeated `SELECT`s from an LRU storage

#![warn(missing_docs)]

mod cache;
mod config;
mod error;
mod filter;

pub use cache::{CacheFilter, CacheSession, StorageFactory};
pub use config::{
    parse_options, parse_size, CacheConfig, FilterParameter, ThreadModel,
    DEFAULT_MAX_RESULTSET_SIZE, DEBUG_DECISIONS, DEBUG_MATCHING, DEBUG_MAX, DEBUG_NON_MATCHING,
    DEBUG_NON_USE, DEBUG_USE,
};
pub use error::{Error, Result};
pub use filter::{
    Capabilities, Downstream, Filter, FilterModule, FilterSession, Links, Packet, QueryTarget,
    ReplyTarget, SessionCell, SessionInfo, Upstream,
};

//! Cache key

use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

use ahash::RandomState;

// Fixed seeds so a query maps to the same key in every session and thread.
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Opaque identity of a cached entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(u64);

impl CacheKey {
    /// Wrap an already computed key value
    pub const fn from_raw(raw: u64) -> Self {
        CacheKey(raw)
    }

    /// Raw key value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Derive the key of a query issued with the given default database
    pub fn for_query(default_db: Option<&str>, query: &[u8]) -> Self {
        let state = RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]);
        let mut hasher = state.build_hasher();
        default_db.hash(&mut hasher);
        query.hash(&mut hasher);
        CacheKey(hasher.finish())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

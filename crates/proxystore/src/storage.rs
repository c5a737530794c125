//! Storage interface
//!
//! Every cache backend implements [`Storage`]. Operations are synchronous and
//! report their outcome through [`Result`]; a miss is `Err(Error::NotFound)`
//! or `Err(Error::Stale)` and callers must check each result.

use std::ops::BitOr;

use bytes::Bytes;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::key::CacheKey;

/// Flags modifying a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetFlags(u32);

impl GetFlags {
    /// Plain lookup; stale values are reported as `Error::Stale`
    pub const NONE: GetFlags = GetFlags(0);

    /// Return stale values as if they were fresh
    pub const INCLUDE_STALE: GetFlags = GetFlags(0x01);

    /// Check whether all bits of `other` are set
    pub fn contains(self, other: GetFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for GetFlags {
    type Output = GetFlags;

    fn bitor(self, rhs: GetFlags) -> GetFlags {
        GetFlags(self.0 | rhs.0)
    }
}

/// Selects what `get_info` reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoFlags(u32);

impl InfoFlags {
    /// Totals and limits only
    pub const NONE: InfoFlags = InfoFlags(0);

    /// Everything the storage knows, including counters
    pub const ALL: InfoFlags = InfoFlags(0xffff_ffff);

    /// Check whether all bits of `other` are set
    pub fn contains(self, other: InfoFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Pluggable key/value store beneath the cache
pub trait Storage: Send {
    /// Structured diagnostics about the storage
    fn get_info(&self, flags: InfoFlags) -> Result<Value>;

    /// Look up a value
    fn get_value(&mut self, key: &CacheKey, flags: GetFlags) -> Result<Bytes>;

    /// Insert or overwrite a value
    fn put_value(&mut self, key: CacheKey, value: Bytes) -> Result<()>;

    /// Remove a value; `Err(Error::NotFound)` if absent
    fn del_value(&mut self, key: &CacheKey) -> Result<()>;

    /// Most recently used entry
    fn get_head(&mut self) -> Result<(CacheKey, Bytes)> {
        Err(Error::Unsupported("get_head"))
    }

    /// Least recently used entry
    fn get_tail(&mut self) -> Result<(CacheKey, Bytes)> {
        Err(Error::Unsupported("get_tail"))
    }

    /// Total bytes of all stored values
    fn get_size(&self) -> Result<u64>;

    /// Number of stored values
    fn get_items(&self) -> Result<u64>;
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn get_info(&self, flags: InfoFlags) -> Result<Value> {
        (**self).get_info(flags)
    }

    fn get_value(&mut self, key: &CacheKey, flags: GetFlags) -> Result<Bytes> {
        (**self).get_value(key, flags)
    }

    fn put_value(&mut self, key: CacheKey, value: Bytes) -> Result<()> {
        (**self).put_value(key, value)
    }

    fn del_value(&mut self, key: &CacheKey) -> Result<()> {
        (**self).del_value(key)
    }

    fn get_head(&mut self) -> Result<(CacheKey, Bytes)> {
        (**self).get_head()
    }

    fn get_tail(&mut self) -> Result<(CacheKey, Bytes)> {
        (**self).get_tail()
    }

    fn get_size(&self) -> Result<u64> {
        (**self).get_size()
    }

    fn get_items(&self) -> Result<u64> {
        (**self).get_items()
    }
}

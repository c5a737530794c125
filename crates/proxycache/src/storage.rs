//! Thread-safety wrappers around [`LruStorage`]

use bytes::Bytes;
use parking_lot::Mutex;
use proxystore::{CacheKey, GetFlags, InfoFlags, Result, Storage};
use serde_json::Value;
use tracing::info;

use crate::lru::{Limits, LruStorage};

/// LRU storage for a single owner
///
/// Calls go straight to the LRU core. `&mut self` on every mutating call
/// means the borrow checker enforces the one-caller-at-a-time discipline.
pub struct LruStorageSt<S> {
    core: LruStorage<S>,
}

impl<S: Storage> LruStorageSt<S> {
    /// Wrap `storage` with the given limits
    pub fn create(storage: S, limits: Limits) -> Self {
        info!("Created single threaded LRU storage.");

        Self {
            core: LruStorage::new(storage, limits),
        }
    }

    /// The LRU core, for statistics and consistency checks
    pub fn core(&self) -> &LruStorage<S> {
        &self.core
    }
}

impl<S: Storage> Storage for LruStorageSt<S> {
    fn get_info(&self, flags: InfoFlags) -> Result<Value> {
        self.core.do_get_info(flags)
    }

    fn get_value(&mut self, key: &CacheKey, flags: GetFlags) -> Result<Bytes> {
        self.core.do_get_value(key, flags)
    }

    fn put_value(&mut self, key: CacheKey, value: Bytes) -> Result<()> {
        self.core.do_put_value(key, value)
    }

    fn del_value(&mut self, key: &CacheKey) -> Result<()> {
        self.core.do_del_value(key)
    }

    fn get_head(&mut self) -> Result<(CacheKey, Bytes)> {
        self.core.do_get_head()
    }

    fn get_tail(&mut self) -> Result<(CacheKey, Bytes)> {
        self.core.do_get_tail()
    }

    fn get_size(&self) -> Result<u64> {
        self.core.do_get_size()
    }

    fn get_items(&self) -> Result<u64> {
        self.core.do_get_items()
    }
}

/// LRU storage shared between threads
///
/// Every call holds one lock for its own duration only. There is no
/// transaction across calls: a get followed by a put may interleave with
/// other callers.
pub struct LruStorageMt<S> {
    core: Mutex<LruStorage<S>>,
}

impl<S: Storage> LruStorageMt<S> {
    /// Wrap `storage` with the given limits
    pub fn create(storage: S, limits: Limits) -> Self {
        info!("Created multi threaded LRU storage.");

        Self {
            core: Mutex::new(LruStorage::new(storage, limits)),
        }
    }

    /// Diagnostic snapshot
    pub fn get_info(&self, flags: InfoFlags) -> Result<Value> {
        self.core.lock().do_get_info(flags)
    }

    /// Look up a value
    pub fn get_value(&self, key: &CacheKey, flags: GetFlags) -> Result<Bytes> {
        self.core.lock().do_get_value(key, flags)
    }

    /// Insert or overwrite a value
    pub fn put_value(&self, key: CacheKey, value: Bytes) -> Result<()> {
        self.core.lock().do_put_value(key, value)
    }

    /// Remove a value
    pub fn del_value(&self, key: &CacheKey) -> Result<()> {
        self.core.lock().do_del_value(key)
    }

    /// Most recently used entry
    pub fn get_head(&self) -> Result<(CacheKey, Bytes)> {
        self.core.lock().do_get_head()
    }

    /// Least recently used entry
    pub fn get_tail(&self) -> Result<(CacheKey, Bytes)> {
        self.core.lock().do_get_tail()
    }

    /// Total bytes stored
    pub fn get_size(&self) -> Result<u64> {
        self.core.lock().do_get_size()
    }

    /// Number of entries stored
    pub fn get_items(&self) -> Result<u64> {
        self.core.lock().do_get_items()
    }

    /// Recount under the lock
    pub fn is_consistent(&self) -> bool {
        self.core.lock().is_consistent()
    }
}

impl<S: Storage> Storage for LruStorageMt<S> {
    fn get_info(&self, flags: InfoFlags) -> Result<Value> {
        LruStorageMt::get_info(self, flags)
    }

    fn get_value(&mut self, key: &CacheKey, flags: GetFlags) -> Result<Bytes> {
        self.core.get_mut().do_get_value(key, flags)
    }

    fn put_value(&mut self, key: CacheKey, value: Bytes) -> Result<()> {
        self.core.get_mut().do_put_value(key, value)
    }

    fn del_value(&mut self, key: &CacheKey) -> Result<()> {
        self.core.get_mut().do_del_value(key)
    }

    fn get_head(&mut self) -> Result<(CacheKey, Bytes)> {
        self.core.get_mut().do_get_head()
    }

    fn get_tail(&mut self) -> Result<(CacheKey, Bytes)> {
        self.core.get_mut().do_get_tail()
    }

    fn get_size(&self) -> Result<u64> {
        LruStorageMt::get_size(self)
    }

    fn get_items(&self) -> Result<u64> {
        LruStorageMt::get_items(self)
    }
}

//! LRU storage decorator
//!
//! Wraps any [`Storage`] and keeps it within an item count and a byte size
//! ceiling, evicting least recently used entries first. Uses an intrusive,
//! index-addressed linked list for O(1) reordering and eviction.
//!
//! Head of the list is the most recently used entry, tail the least recently
//! used one. The key map and the list always hold the same key set, and the
//! running totals are only ever adjusted after the underlying storage call
//! succeeded.

use std::collections::HashMap;

use ahash::RandomState;
use bytes::Bytes;
use proxystore::{CacheKey, Error, GetFlags, InfoFlags, Result, Storage};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::stats::CacheStats;

/// Ceilings enforced by the decorator; zero disables a ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limits {
    /// Maximum number of entries
    pub max_count: u64,
    /// Maximum total bytes of all values
    pub max_size: u64,
}

impl Limits {
    /// Limits with the given ceilings
    pub const fn new(max_count: u64, max_size: u64) -> Self {
        Self {
            max_count,
            max_size,
        }
    }

    /// No ceilings at all
    pub const fn unlimited() -> Self {
        Self::new(0, 0)
    }
}

/// Node in the LRU doubly-linked list
struct Node {
    key: CacheKey,
    size: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Clone, Copy)]
enum End {
    Head,
    Tail,
}

/// Single-threaded LRU bookkeeping around an underlying storage
///
/// The `do_*` operations are the whole algorithm; the thread-safety wrappers
/// in [`crate::LruStorageSt`] and [`crate::LruStorageMt`] only decide how
/// access to them is serialized.
pub struct LruStorage<S> {
    storage: S,
    limits: Limits,
    nodes_by_key: HashMap<CacheKey, usize, RandomState>,
    nodes: Vec<Option<Node>>,
    head: Option<usize>,
    tail: Option<usize>,
    free_list: Vec<usize>,
    size: u64,
    stats: CacheStats,
}

impl<S: Storage> LruStorage<S> {
    /// Wrap `storage`, enforcing `limits` from now on
    pub fn new(storage: S, limits: Limits) -> Self {
        Self {
            storage,
            limits,
            nodes_by_key: HashMap::with_hasher(RandomState::new()),
            nodes: Vec::new(),
            head: None,
            tail: None,
            free_list: Vec::new(),
            size: 0,
            stats: CacheStats::new(),
        }
    }

    /// Ceilings in effect
    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Activity counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Diagnostic snapshot: limits, totals and the underlying storage's info
    pub fn do_get_info(&self, flags: InfoFlags) -> Result<Value> {
        let mut info = json!({
            "max_item_count": self.limits.max_count,
            "max_total_size": self.limits.max_size,
            "item_count": self.items(),
            "total_size": self.size,
        });

        if flags.contains(InfoFlags::ALL) {
            info["stats"] = self.stats.to_json();
        }
        info["storage"] = self.storage.get_info(flags)?;

        Ok(info)
    }

    /// Look up `key`; a hit makes it the most recently used entry
    pub fn do_get_value(&mut self, key: &CacheKey, flags: GetFlags) -> Result<Bytes> {
        let existing = self.nodes_by_key.get(key).copied();

        match self.storage.get_value(key, flags) {
            Ok(value) => {
                match existing {
                    Some(idx) => self.move_to_front(idx),
                    None => warn!("Key {} found in storage but not in LRU", key),
                }
                self.stats.record_hit();
                Ok(value)
            }
            Err(Error::NotFound) => {
                if let Some(idx) = existing {
                    debug!("Key {} vanished from storage, dropping LRU node", key);
                    self.forget(idx);
                }
                self.stats.record_miss();
                Err(Error::NotFound)
            }
            Err(Error::Stale) => {
                self.stats.record_miss();
                Err(Error::Stale)
            }
            Err(e) => Err(e),
        }
    }

    /// Insert or overwrite `key`, then evict until within limits
    ///
    /// A value larger than `max_size` is accepted and then evicted right
    /// away, so the key is not retained.
    pub fn do_put_value(&mut self, key: CacheKey, value: Bytes) -> Result<()> {
        let value_size = value.len() as u64;

        if let Some(&idx) = self.nodes_by_key.get(&key) {
            self.storage.put_value(key, value)?;

            if let Some(node) = &mut self.nodes[idx] {
                self.size = self.size - node.size + value_size;
                node.size = value_size;
            }
            self.move_to_front(idx);
            self.stats.record_update();
        } else {
            // Reserve before touching the storage so a failed allocation
            // leaves both sides untouched.
            self.nodes_by_key.try_reserve(1)?;
            if self.free_list.is_empty() {
                self.nodes.try_reserve(1)?;
            }

            self.storage.put_value(key, value)?;

            let idx = self.alloc_node();
            self.nodes[idx] = Some(Node {
                key,
                size: value_size,
                prev: None,
                next: self.head,
            });

            if let Some(head_idx) = self.head {
                if let Some(head) = &mut self.nodes[head_idx] {
                    head.prev = Some(idx);
                }
            }

            self.head = Some(idx);
            if self.tail.is_none() {
                self.tail = Some(idx);
            }

            self.nodes_by_key.insert(key, idx);
            self.size += value_size;
            self.stats.record_insert();
        }

        if self.limits.max_size != 0 && value_size > self.limits.max_size {
            debug!(
                "Value of {} bytes for key {} exceeds max_size {}, it will be evicted",
                value_size, key, self.limits.max_size
            );
        }

        self.evict_overflow()
    }

    /// Remove `key` from the storage and the LRU
    pub fn do_del_value(&mut self, key: &CacheKey) -> Result<()> {
        let existing = self.nodes_by_key.get(key).copied();

        match self.storage.del_value(key) {
            Ok(()) => {
                if let Some(idx) = existing {
                    self.forget(idx);
                }
                self.stats.record_delete();
                Ok(())
            }
            Err(Error::NotFound) => {
                if let Some(idx) = existing {
                    self.forget(idx);
                }
                Err(Error::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Most recently used entry, without reordering
    ///
    /// The value is read from the backend with `INCLUDE_STALE`, so the read
    /// shows up in the backend's own get counters. Nodes whose key the backend
    /// no longer holds are dropped on the way.
    pub fn do_get_head(&mut self) -> Result<(CacheKey, Bytes)> {
        self.peek(End::Head)
    }

    /// Least recently used entry, without reordering
    ///
    /// Same backend side effects as [`LruStorage::do_get_head`].
    pub fn do_get_tail(&mut self) -> Result<(CacheKey, Bytes)> {
        self.peek(End::Tail)
    }

    /// Total bytes of all tracked values
    pub fn do_get_size(&self) -> Result<u64> {
        Ok(self.size)
    }

    /// Number of tracked values
    pub fn do_get_items(&self) -> Result<u64> {
        Ok(self.items())
    }

    /// Walk the list and recount everything
    ///
    /// Diagnostics only; the running totals are what operations use.
    pub fn is_consistent(&self) -> bool {
        let mut count = 0usize;
        let mut size = 0u64;
        let mut prev = None;
        let mut cursor = self.head;

        while let Some(idx) = cursor {
            let Some(node) = self.nodes.get(idx).and_then(Option::as_ref) else {
                return false;
            };
            if node.prev != prev || self.nodes_by_key.get(&node.key) != Some(&idx) {
                return false;
            }

            count += 1;
            size += node.size;
            if count > self.nodes_by_key.len() {
                return false; // cycle
            }

            prev = Some(idx);
            cursor = node.next;
        }

        self.tail == prev && count == self.nodes_by_key.len() && size == self.size
    }

    fn items(&self) -> u64 {
        self.nodes_by_key.len() as u64
    }

    fn over_limits(&self) -> bool {
        (self.limits.max_count != 0 && self.items() > self.limits.max_count)
            || (self.limits.max_size != 0 && self.size > self.limits.max_size)
    }

    fn evict_overflow(&mut self) -> Result<()> {
        while self.over_limits() {
            let Some(tail_idx) = self.tail else {
                break;
            };
            let Some(key) = self.nodes[tail_idx].as_ref().map(|node| node.key) else {
                break;
            };

            match self.storage.del_value(&key) {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => {
                    error!("Could not evict key {} from storage: {}", key, e);
                    return Err(e);
                }
            }

            let size = self.forget(tail_idx);
            self.stats.record_eviction();
            debug!("Evicted key {} ({} bytes)", key, size);
        }

        Ok(())
    }

    fn peek(&mut self, end: End) -> Result<(CacheKey, Bytes)> {
        loop {
            let idx = match end {
                End::Head => self.head,
                End::Tail => self.tail,
            }
            .ok_or(Error::NotFound)?;

            let Some(key) = self.nodes[idx].as_ref().map(|node| node.key) else {
                return Err(Error::NotFound);
            };

            match self.storage.get_value(&key, GetFlags::INCLUDE_STALE) {
                Ok(value) => return Ok((key, value)),
                Err(Error::NotFound) => {
                    debug!("Key {} vanished from storage, dropping LRU node", key);
                    self.forget(idx);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop a node and its totals; returns the size it accounted for
    fn forget(&mut self, idx: usize) -> u64 {
        self.unlink(idx);
        self.free_node(idx);

        match self.nodes[idx].take() {
            Some(node) => {
                self.nodes_by_key.remove(&node.key);
                self.size -= node.size;
                node.size
            }
            None => 0,
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }

        self.unlink(idx);

        if let Some(node) = &mut self.nodes[idx] {
            node.prev = None;
            node.next = self.head;
        }

        if let Some(head_idx) = self.head {
            if let Some(head) = &mut self.nodes[head_idx] {
                head.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = if let Some(node) = &self.nodes[idx] {
            (node.prev, node.next)
        } else {
            return;
        };

        match prev {
            Some(prev_idx) => {
                if let Some(prev_node) = &mut self.nodes[prev_idx] {
                    prev_node.next = next;
                }
            }
            None => {
                self.head = next;
            }
        }

        match next {
            Some(next_idx) => {
                if let Some(next_node) = &mut self.nodes[next_idx] {
                    next_node.prev = prev;
                }
            }
            None => {
                self.tail = prev;
            }
        }
    }

    fn alloc_node(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            let idx = self.nodes.len();
            self.nodes.push(None);
            idx
        }
    }

    fn free_node(&mut self, idx: usize) {
        self.free_list.push(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxystore::{InMemoryStorage, TtlConfig};
    use std::thread;
    use std::time::Duration;

    fn key(n: u64) -> CacheKey {
        CacheKey::from_raw(n)
    }

    fn value(len: usize) -> Bytes {
        Bytes::from(vec![b'x'; len])
    }

    fn lru(max_count: u64, max_size: u64) -> LruStorage<InMemoryStorage> {
        LruStorage::new(InMemoryStorage::new("test"), Limits::new(max_count, max_size))
    }

    /// Backend whose puts and deletes can be made to fail
    struct FlakyStorage {
        inner: InMemoryStorage,
        fail_puts: bool,
        fail_dels: bool,
    }

    impl FlakyStorage {
        fn new() -> Self {
            Self {
                inner: InMemoryStorage::new("flaky"),
                fail_puts: false,
                fail_dels: false,
            }
        }
    }

    impl Storage for FlakyStorage {
        fn get_info(&self, flags: InfoFlags) -> Result<Value> {
            self.inner.get_info(flags)
        }

        fn get_value(&mut self, key: &CacheKey, flags: GetFlags) -> Result<Bytes> {
            self.inner.get_value(key, flags)
        }

        fn put_value(&mut self, key: CacheKey, value: Bytes) -> Result<()> {
            if self.fail_puts {
                return Err(Error::Backend("put refused".into()));
            }
            self.inner.put_value(key, value)
        }

        fn del_value(&mut self, key: &CacheKey) -> Result<()> {
            if self.fail_dels {
                return Err(Error::Backend("delete refused".into()));
            }
            self.inner.del_value(key)
        }

        fn get_size(&self) -> Result<u64> {
            self.inner.get_size()
        }

        fn get_items(&self) -> Result<u64> {
            self.inner.get_items()
        }
    }

    #[test]
    fn test_put_and_get() {
        let mut lru = lru(0, 0);

        lru.do_put_value(key(1), Bytes::from_static(b"one")).unwrap();

        assert_eq!(lru.do_get_value(&key(1), GetFlags::NONE).unwrap(), "one");
        assert_eq!(lru.do_get_items().unwrap(), 1);
        assert_eq!(lru.do_get_size().unwrap(), 3);
        assert!(lru.is_consistent());
    }

    #[test]
    fn test_recency_decides_eviction() {
        let mut lru = lru(2, 0);

        lru.do_put_value(key(1), value(1)).unwrap(); // A
        lru.do_put_value(key(2), value(1)).unwrap(); // B
        lru.do_get_value(&key(1), GetFlags::NONE).unwrap();
        lru.do_put_value(key(3), value(1)).unwrap(); // C evicts B

        assert!(lru.do_get_value(&key(1), GetFlags::NONE).is_ok());
        assert_eq!(lru.do_get_value(&key(2), GetFlags::NONE), Err(Error::NotFound));
        assert!(lru.do_get_value(&key(3), GetFlags::NONE).is_ok());
        assert_eq!(lru.stats().evictions(), 1);
    }

    #[test]
    fn test_head_and_tail() {
        let mut lru = lru(0, 0);

        assert_eq!(lru.do_get_head(), Err(Error::NotFound));

        lru.do_put_value(key(1), Bytes::from_static(b"a")).unwrap();
        lru.do_put_value(key(2), Bytes::from_static(b"b")).unwrap();

        assert_eq!(lru.do_get_head().unwrap().0, key(2));
        assert_eq!(lru.do_get_tail().unwrap().0, key(1));

        lru.do_get_value(&key(1), GetFlags::NONE).unwrap();

        assert_eq!(lru.do_get_head().unwrap(), (key(1), Bytes::from_static(b"a")));
        assert_eq!(lru.do_get_tail().unwrap().0, key(2));
        // Peeking does not reorder.
        assert_eq!(lru.do_get_tail().unwrap().0, key(2));
    }

    #[test]
    fn test_overwrite_keeps_count() {
        let mut lru = lru(0, 0);

        lru.do_put_value(key(1), value(10)).unwrap();
        lru.do_put_value(key(1), value(4)).unwrap();

        assert_eq!(lru.do_get_items().unwrap(), 1);
        assert_eq!(lru.do_get_size().unwrap(), 4);
        assert_eq!(lru.do_get_value(&key(1), GetFlags::NONE).unwrap(), value(4));
        assert_eq!(lru.stats().updates(), 1);
        assert!(lru.is_consistent());
    }

    #[test]
    fn test_overwrite_refreshes_recency() {
        let mut lru = lru(2, 0);

        lru.do_put_value(key(1), value(1)).unwrap();
        lru.do_put_value(key(2), value(1)).unwrap();
        lru.do_put_value(key(1), value(2)).unwrap();
        lru.do_put_value(key(3), value(1)).unwrap();

        assert!(lru.do_get_value(&key(1), GetFlags::NONE).is_ok());
        assert_eq!(lru.do_get_value(&key(2), GetFlags::NONE), Err(Error::NotFound));
    }

    #[test]
    fn test_delete_restores_totals() {
        let mut lru = lru(0, 0);
        lru.do_put_value(key(1), value(7)).unwrap();

        lru.do_put_value(key(2), value(5)).unwrap();
        lru.do_del_value(&key(2)).unwrap();

        assert_eq!(lru.do_get_value(&key(2), GetFlags::NONE), Err(Error::NotFound));
        assert_eq!(lru.do_get_items().unwrap(), 1);
        assert_eq!(lru.do_get_size().unwrap(), 7);
        assert_eq!(lru.do_del_value(&key(2)), Err(Error::NotFound));
        assert!(lru.is_consistent());
    }

    #[test]
    fn test_oversized_value_is_not_retained() {
        let mut lru = lru(0, 100);

        lru.do_put_value(key(1), value(10)).unwrap();
        lru.do_put_value(key(2), value(200)).unwrap();

        assert_eq!(lru.do_get_value(&key(2), GetFlags::NONE), Err(Error::NotFound));
        assert_eq!(lru.do_get_value(&key(1), GetFlags::NONE), Err(Error::NotFound));
        assert_eq!(lru.do_get_size().unwrap(), 0);
        assert_eq!(lru.do_get_items().unwrap(), 0);
        assert_eq!(lru.stats().evictions(), 2);
        assert!(lru.is_consistent());
    }

    #[test]
    fn test_size_limit_evicts_oldest() {
        let mut lru = lru(0, 100);

        lru.do_put_value(key(1), value(40)).unwrap();
        lru.do_put_value(key(2), value(40)).unwrap();
        lru.do_put_value(key(3), value(40)).unwrap();

        assert_eq!(lru.do_get_value(&key(1), GetFlags::NONE), Err(Error::NotFound));
        assert_eq!(lru.do_get_size().unwrap(), 80);
        assert_eq!(lru.do_get_items().unwrap(), 2);
    }

    #[test]
    fn test_limits_hold_after_every_put() {
        let mut lru = lru(16, 1000);
        let mut seed = 0x2545_f491_4f6c_dd1du64;

        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            let k = key(seed % 64);
            let len = (seed >> 8) as usize % 300;
            lru.do_put_value(k, value(len)).unwrap();

            assert!(lru.do_get_items().unwrap() <= 16);
            assert!(lru.do_get_size().unwrap() <= 1000);
        }

        assert!(lru.is_consistent());
    }

    #[test]
    fn test_zero_limits_are_unbounded() {
        let mut lru = lru(0, 0);

        for i in 0..500 {
            lru.do_put_value(key(i), value(1024)).unwrap();
        }

        assert_eq!(lru.do_get_items().unwrap(), 500);
        assert_eq!(lru.do_get_size().unwrap(), 500 * 1024);
        assert_eq!(lru.stats().evictions(), 0);
    }

    #[test]
    fn test_failed_put_changes_nothing() {
        let mut lru = LruStorage::new(FlakyStorage::new(), Limits::unlimited());
        lru.do_put_value(key(1), value(3)).unwrap();

        lru.storage.fail_puts = true;
        let result = lru.do_put_value(key(2), value(5));
        assert_eq!(result, Err(Error::Backend("put refused".into())));
        let result = lru.do_put_value(key(1), value(9));
        assert!(result.is_err());

        assert_eq!(lru.do_get_items().unwrap(), 1);
        assert_eq!(lru.do_get_size().unwrap(), 3);
        assert!(lru.is_consistent());
    }

    #[test]
    fn test_failed_delete_changes_nothing() {
        let mut lru = LruStorage::new(FlakyStorage::new(), Limits::unlimited());
        lru.do_put_value(key(1), value(3)).unwrap();

        lru.storage.fail_dels = true;
        assert!(lru.do_del_value(&key(1)).is_err());

        assert_eq!(lru.do_get_items().unwrap(), 1);
        assert!(lru.do_get_value(&key(1), GetFlags::NONE).is_ok());
    }

    #[test]
    fn test_failed_eviction_propagates() {
        let mut lru = LruStorage::new(FlakyStorage::new(), Limits::new(1, 0));
        lru.do_put_value(key(1), value(3)).unwrap();

        lru.storage.fail_dels = true;
        let result = lru.do_put_value(key(2), value(3));

        assert_eq!(result, Err(Error::Backend("delete refused".into())));
        // Both entries are still in the storage, so both are still tracked.
        assert_eq!(lru.do_get_items().unwrap(), 2);
        assert_eq!(lru.storage.get_items().unwrap(), 2);
        assert!(lru.is_consistent());
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let ttl = TtlConfig {
            soft_ttl: Duration::ZERO,
            hard_ttl: Duration::from_millis(10),
        };
        let mut lru = LruStorage::new(InMemoryStorage::with_ttl("ttl", ttl), Limits::unlimited());

        lru.do_put_value(key(1), value(8)).unwrap();
        thread::sleep(Duration::from_millis(30));

        assert_eq!(lru.do_get_value(&key(1), GetFlags::NONE), Err(Error::NotFound));
        assert_eq!(lru.do_get_items().unwrap(), 0);
        assert_eq!(lru.do_get_size().unwrap(), 0);
        assert!(lru.is_consistent());
    }

    #[test]
    fn test_peek_skips_expired_nodes_without_counting() {
        let ttl = TtlConfig {
            soft_ttl: Duration::ZERO,
            hard_ttl: Duration::from_millis(10),
        };
        let mut lru = LruStorage::new(InMemoryStorage::with_ttl("ttl", ttl), Limits::unlimited());

        lru.do_put_value(key(1), value(8)).unwrap();
        thread::sleep(Duration::from_millis(30));
        lru.do_put_value(key(2), value(4)).unwrap();

        assert_eq!(lru.do_get_tail().unwrap().0, key(2));
        assert_eq!(lru.do_get_head().unwrap().0, key(2));
        assert_eq!(lru.do_get_items().unwrap(), 1);
        assert_eq!(lru.do_get_size().unwrap(), 4);
        assert_eq!(lru.stats().hits(), 0);
        assert_eq!(lru.stats().misses(), 0);
        assert!(lru.is_consistent());
    }

    #[test]
    fn test_stale_is_a_miss_without_reordering() {
        let ttl = TtlConfig {
            soft_ttl: Duration::from_millis(10),
            hard_ttl: Duration::ZERO,
        };
        let mut lru = LruStorage::new(InMemoryStorage::with_ttl("ttl", ttl), Limits::unlimited());

        lru.do_put_value(key(1), value(1)).unwrap();
        lru.do_put_value(key(2), value(1)).unwrap();
        thread::sleep(Duration::from_millis(30));

        assert_eq!(lru.do_get_value(&key(1), GetFlags::NONE), Err(Error::Stale));
        assert_eq!(lru.do_get_tail().unwrap().0, key(1));
        assert!(lru.do_get_value(&key(1), GetFlags::INCLUDE_STALE).is_ok());
        assert_eq!(lru.do_get_head().unwrap().0, key(1));
        assert_eq!(lru.stats().misses(), 1);
    }

    #[test]
    fn test_info() {
        let mut lru = lru(10, 1000);
        lru.do_put_value(key(1), value(12)).unwrap();

        let info = lru.do_get_info(InfoFlags::ALL).unwrap();

        assert_eq!(info["max_item_count"], 10);
        assert_eq!(info["max_total_size"], 1000);
        assert_eq!(info["item_count"], 1);
        assert_eq!(info["total_size"], 12);
        assert_eq!(info["stats"]["inserts"], 1);
        assert_eq!(info["storage"]["name"], "test");
    }

    #[test]
    fn test_slots_are_reused() {
        let mut lru = lru(0, 0);

        for i in 0..10 {
            lru.do_put_value(key(i), value(1)).unwrap();
        }
        for i in 0..10 {
            lru.do_del_value(&key(i)).unwrap();
        }
        for i in 10..20 {
            lru.do_put_value(key(i), value(1)).unwrap();
        }

        assert_eq!(lru.nodes.len(), 10);
        assert!(lru.is_consistent());
    }
}

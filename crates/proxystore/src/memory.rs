//! In-memory storage backend
//!
//! Hash map of values with optional time-based staleness:
//! - older than `soft_ttl`: reported `Stale` (or returned with `INCLUDE_STALE`)
//! - older than `hard_ttl`: removed on access and reported `NotFound`

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ahash::RandomState;
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::storage::{GetFlags, InfoFlags, Storage};

/// Staleness policy of an [`InMemoryStorage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TtlConfig {
    /// Age after which a value is stale; zero disables
    pub soft_ttl: Duration,
    /// Age after which a value is dropped; zero disables
    pub hard_ttl: Duration,
}

struct Entry {
    value: Bytes,
    stored: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    gets: u64,
    puts: u64,
    hits: u64,
    misses: u64,
    updates: u64,
    deletes: u64,
}

/// Hash map backed storage
pub struct InMemoryStorage {
    name: String,
    entries: HashMap<CacheKey, Entry, RandomState>,
    size: u64,
    ttl: TtlConfig,
    counters: Counters,
}

impl InMemoryStorage {
    /// Create an empty storage without staleness
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_ttl(name, TtlConfig::default())
    }

    /// Create an empty storage with the given staleness policy
    pub fn with_ttl(name: impl Into<String>, mut ttl: TtlConfig) -> Self {
        if !ttl.hard_ttl.is_zero() && (ttl.soft_ttl.is_zero() || ttl.soft_ttl > ttl.hard_ttl) {
            // A value cannot be stale after it is already gone.
            ttl.soft_ttl = ttl.hard_ttl;
        }

        Self {
            name: name.into(),
            entries: HashMap::with_hasher(RandomState::new()),
            size: 0,
            ttl,
            counters: Counters::default(),
        }
    }

    /// Staleness policy in effect
    pub fn ttl(&self) -> TtlConfig {
        self.ttl
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.size -= entry.value.len() as u64;
        Some(entry)
    }
}

impl Storage for InMemoryStorage {
    fn get_info(&self, flags: InfoFlags) -> Result<Value> {
        let mut info = json!({
            "name": self.name,
            "size": self.size,
            "items": self.entries.len(),
            "soft_ttl_ms": self.ttl.soft_ttl.as_millis() as u64,
            "hard_ttl_ms": self.ttl.hard_ttl.as_millis() as u64,
        });

        if flags.contains(InfoFlags::ALL) {
            info["stats"] = json!({
                "gets": self.counters.gets,
                "puts": self.counters.puts,
                "hits": self.counters.hits,
                "misses": self.counters.misses,
                "updates": self.counters.updates,
                "deletes": self.counters.deletes,
            });
        }

        Ok(info)
    }

    fn get_value(&mut self, key: &CacheKey, flags: GetFlags) -> Result<Bytes> {
        self.counters.gets += 1;

        let (age, value) = match self.entries.get(key) {
            Some(entry) => (entry.stored.elapsed(), entry.value.clone()),
            None => {
                self.counters.misses += 1;
                return Err(Error::NotFound);
            }
        };

        if !self.ttl.hard_ttl.is_zero() && age > self.ttl.hard_ttl {
            debug!("Hard TTL of {} exceeded, dropping entry", key);
            self.remove(key);
            self.counters.misses += 1;
            return Err(Error::NotFound);
        }

        if !self.ttl.soft_ttl.is_zero()
            && age > self.ttl.soft_ttl
            && !flags.contains(GetFlags::INCLUDE_STALE)
        {
            self.counters.misses += 1;
            return Err(Error::Stale);
        }

        self.counters.hits += 1;
        Ok(value)
    }

    fn put_value(&mut self, key: CacheKey, value: Bytes) -> Result<()> {
        self.counters.puts += 1;
        let entry = Entry {
            value,
            stored: Instant::now(),
        };

        if let Some(existing) = self.entries.get_mut(&key) {
            self.size = self.size - existing.value.len() as u64 + entry.value.len() as u64;
            *existing = entry;
            self.counters.updates += 1;
            return Ok(());
        }

        self.entries.try_reserve(1)?;
        self.size += entry.value.len() as u64;
        self.entries.insert(key, entry);
        Ok(())
    }

    fn del_value(&mut self, key: &CacheKey) -> Result<()> {
        match self.remove(key) {
            Some(_) => {
                self.counters.deletes += 1;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn get_size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn get_items(&self) -> Result<u64> {
        Ok(self.entries.len() as u64)
    }
}

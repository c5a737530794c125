//! Query result cache filter
//!
//! `SELECT` statements are looked up in an LRU storage keyed by the
//! statement and the session's default database. A hit is answered straight
//! back upstream and never reaches the backend. On a miss the statement is
//! forwarded and the reply that comes back is stored before it continues
//! toward the client.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use proxycache::{LruStorageMt, LruStorageSt};
use proxystore::{CacheKey, GetFlags, InMemoryStorage, InfoFlags, Storage, TtlConfig};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::config::{
    parse_options, CacheConfig, FilterParameter, ThreadModel, DEBUG_DECISIONS, DEBUG_MATCHING,
    DEBUG_NON_MATCHING, DEBUG_NON_USE, DEBUG_USE,
};
use crate::error::Result;
use crate::filter::{Capabilities, Filter, FilterSession, Links, Packet, SessionInfo};

/// Builds the backend beneath each LRU storage the filter creates
///
/// Called with the filter name and the configured TTLs: once per filter in
/// `mt` mode, once per session in `st` mode.
pub type StorageFactory = Arc<dyn Fn(&str, TtlConfig) -> Box<dyn Storage> + Send + Sync>;

type Backend = Box<dyn Storage>;
type SharedStorage = Arc<LruStorageMt<Backend>>;
type OwnedStorage = LruStorageSt<Backend>;

fn in_memory(name: &str, ttl: TtlConfig) -> Backend {
    Box::new(InMemoryStorage::with_ttl(name, ttl))
}

/// Cache filter instance; owns the shared storage in `mt` mode
pub struct CacheFilter {
    name: String,
    config: CacheConfig,
    factory: StorageFactory,
    storage: Option<SharedStorage>,
    sessions: AtomicU64,
}

impl CacheFilter {
    /// Create an instance whose LRU storages sit on backends built by `factory`
    pub fn with_storage(
        name: &str,
        options: &[String],
        params: &[FilterParameter],
        factory: StorageFactory,
    ) -> Result<Self> {
        let mut all = Vec::new();
        for option in options {
            all.extend(parse_options(option)?);
        }
        all.extend_from_slice(params);

        let config = CacheConfig::from_params(&all)?;

        let mut filter = CacheFilter {
            name: name.to_string(),
            config,
            factory,
            storage: None,
            sessions: AtomicU64::new(0),
        };

        if filter.config.thread_model == ThreadModel::Mt {
            let storage = LruStorageMt::create(filter.new_storage(), filter.config.limits());
            filter.storage = Some(Arc::new(storage));
        }

        info!(
            "Created cache filter '{}' (max_count: {}, max_size: {}, thread_model: {:?})",
            name, filter.config.max_count, filter.config.max_size, filter.config.thread_model
        );

        Ok(filter)
    }

    /// Effective configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Storage shared by all sessions, if the thread model is `mt`
    pub fn shared_storage(&self) -> Option<&SharedStorage> {
        self.storage.as_ref()
    }

    fn new_storage(&self) -> Backend {
        (self.factory)(&self.name, self.config.ttl())
    }
}

impl Filter for CacheFilter {
    type Session = CacheSession;

    fn create(name: &str, options: &[String], params: &[FilterParameter]) -> Result<Self> {
        Self::with_storage(name, options, params, Arc::new(in_memory))
    }

    fn new_session(&self, session: &SessionInfo) -> Result<CacheSession> {
        let storage = match &self.storage {
            Some(shared) => SessionStorage::Shared(Arc::clone(shared)),
            None => SessionStorage::Owned(Mutex::new(Some(LruStorageSt::create(
                self.new_storage(),
                self.config.limits(),
            )))),
        };

        self.sessions.fetch_add(1, Ordering::Relaxed);
        debug!("Cache filter '{}' created session {}", self.name, session.id);

        Ok(CacheSession {
            links: Links::default(),
            id: session.id,
            default_db: session.default_db.clone(),
            config: self.config.clone(),
            storage,
            inner: Mutex::new(SessionState::default()),
        })
    }

    fn capabilities() -> Capabilities {
        Capabilities::STMT_INPUT | Capabilities::TRANSACTION_TRACKING
    }

    fn diagnostics(&self) -> Value {
        let storage = match &self.storage {
            Some(shared) => shared
                .get_info(InfoFlags::ALL)
                .unwrap_or_else(|e| json!({ "error": e.to_string() })),
            None => json!("per session"),
        };

        json!({
            "name": self.name,
            "config": serde_json::to_value(&self.config).unwrap_or(Value::Null),
            "sessions_created": self.sessions.load(Ordering::Relaxed),
            "storage": storage,
        })
    }
}

enum SessionStorage {
    Shared(SharedStorage),
    /// `None` once the session is closed.
    ///
    /// Only this session touches the storage, so the lock is never contended;
    /// it is there because sessions are called through `&self` and must be `Sync`.
    Owned(Mutex<Option<OwnedStorage>>),
}

impl SessionStorage {
    fn get_value(&self, key: &CacheKey) -> proxystore::Result<Bytes> {
        match self {
            SessionStorage::Shared(storage) => storage.get_value(key, GetFlags::NONE),
            SessionStorage::Owned(storage) => match storage.lock().as_mut() {
                Some(storage) => storage.get_value(key, GetFlags::NONE),
                None => Err(proxystore::Error::NotFound),
            },
        }
    }

    fn put_value(&self, key: CacheKey, value: Bytes) -> proxystore::Result<()> {
        match self {
            SessionStorage::Shared(storage) => storage.put_value(key, value),
            SessionStorage::Owned(storage) => match storage.lock().as_mut() {
                Some(storage) => storage.put_value(key, value),
                None => Ok(()),
            },
        }
    }

    fn release(&self) {
        if let SessionStorage::Owned(storage) = self {
            storage.lock().take();
        }
    }

    fn info(&self) -> Value {
        let info = match self {
            SessionStorage::Shared(_) => return json!("shared"),
            SessionStorage::Owned(storage) => match storage.lock().as_ref() {
                Some(storage) => storage.get_info(InfoFlags::NONE),
                None => return json!("released"),
            },
        };
        info.unwrap_or_else(|e| json!({ "error": e.to_string() }))
    }
}

/// What to do with the reply to a forwarded query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// Store it under this key
    Fetching(CacheKey),
    /// Pass it through uncached
    Ignoring,
}

#[derive(Debug, Default)]
struct SessionState {
    /// One entry per forwarded query, oldest first; replies arrive in order
    outstanding: VecDeque<(u64, Pending)>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    stored: u64,
}

impl SessionState {
    fn expect_reply(&mut self, pending: Pending) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.outstanding.push_back((seq, pending));
        seq
    }
}

/// Per-connection cache session
pub struct CacheSession {
    links: Links,
    id: u64,
    default_db: Option<String>,
    config: CacheConfig,
    storage: SessionStorage,
    inner: Mutex<SessionState>,
}

impl CacheSession {
    /// Replies served from the cache
    pub fn hits(&self) -> u64 {
        self.inner.lock().hits
    }

    /// Cacheable statements that went to the backend
    pub fn misses(&self) -> u64 {
        self.inner.lock().misses
    }

    /// Forwarded queries still waiting for their reply
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    /// Send `packet` to the backend, remembering how to treat its reply
    fn forward(&self, packet: Packet, pending: Pending) -> Result<()> {
        let seq = self.inner.lock().expect_reply(pending);
        let result = self.links.route_query(packet);
        if result.is_err() {
            // An undelivered query gets no reply.
            self.inner.lock().outstanding.retain(|(s, _)| *s != seq);
        }
        result
    }

    fn store(&self, key: CacheKey, packet: &Packet) {
        if packet.len() as u64 > self.config.max_resultset_size {
            if self.config.debug_enabled(DEBUG_DECISIONS) {
                info!(
                    "Session {}: reply of {} bytes exceeds max_resultset_size, not storing",
                    self.id,
                    packet.len()
                );
            }
            return;
        }

        // The packet goes on upstream; the cache keeps its own copy.
        match self.storage.put_value(key, Bytes::copy_from_slice(packet)) {
            Ok(()) => {
                self.inner.lock().stored += 1;
                if self.config.debug_enabled(DEBUG_DECISIONS) {
                    info!("Session {}: stored reply for key {}", self.id, key);
                }
            }
            Err(e) => error!("Session {}: could not store reply for key {}: {}", self.id, key, e),
        }
    }
}

impl FilterSession for CacheSession {
    fn links(&self) -> &Links {
        &self.links
    }

    fn route_query(&self, packet: Packet) -> Result<()> {
        if !is_select(&packet) {
            if self.config.debug_enabled(DEBUG_NON_MATCHING) {
                info!("Session {}: not cacheable: {}", self.id, preview(&packet));
            }
            return self.forward(packet, Pending::Ignoring);
        }

        if self.config.debug_enabled(DEBUG_MATCHING) {
            info!("Session {}: cacheable: {}", self.id, preview(&packet));
        }

        let key = CacheKey::for_query(self.default_db.as_deref(), &packet);

        let waiting = {
            let mut inner = self.inner.lock();
            let waiting = inner.outstanding.len();
            if waiting > 0 {
                inner.misses += 1;
            }
            waiting
        };

        if waiting > 0 {
            // A cached reply sent now would overtake the ones still on their way.
            if self.config.debug_enabled(DEBUG_NON_USE) {
                info!(
                    "Session {}: {} replies outstanding, fetching key {} from the backend",
                    self.id, waiting, key
                );
            }
            return self.forward(packet, Pending::Fetching(key));
        }

        match self.storage.get_value(&key) {
            Ok(value) => {
                self.inner.lock().hits += 1;
                if self.config.debug_enabled(DEBUG_USE) {
                    info!("Session {}: using cached reply for key {}", self.id, key);
                }
                self.links.client_reply(value)
            }
            Err(e) if e.is_miss() => {
                self.inner.lock().misses += 1;
                if self.config.debug_enabled(DEBUG_NON_USE) {
                    info!("Session {}: no usable reply for key {} ({})", self.id, key, e);
                }
                self.forward(packet, Pending::Fetching(key))
            }
            Err(e) => {
                error!("Session {}: could not read from cache storage: {}", self.id, e);
                self.forward(packet, Pending::Ignoring)
            }
        }
    }

    fn client_reply(&self, packet: Packet) -> Result<()> {
        let pending = self.inner.lock().outstanding.pop_front();

        match pending {
            Some((_, Pending::Fetching(key))) => self.store(key, &packet),
            Some((_, Pending::Ignoring)) => {}
            None => debug!("Session {}: reply without an outstanding query", self.id),
        }

        self.links.client_reply(packet)
    }

    fn close(&self) {
        self.inner.lock().outstanding.clear();
        self.storage.release();
        debug!("Session {}: cache session closed", self.id);
    }

    fn diagnostics(&self) -> Value {
        let inner = self.inner.lock();
        json!({
            "id": self.id,
            "default_db": self.default_db,
            "outstanding": inner.outstanding.len(),
            "hits": inner.hits,
            "misses": inner.misses,
            "stored": inner.stored,
            "storage": self.storage.info(),
        })
    }
}

fn is_select(packet: &[u8]) -> bool {
    let start = packet
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(packet.len());
    let statement = &packet[start..];

    statement.len() >= 6
        && statement[..6].eq_ignore_ascii_case(b"select")
        && statement
            .get(6)
            .map_or(true, |b| !b.is_ascii_alphanumeric() && *b != b'_')
}

fn preview(packet: &[u8]) -> String {
    let end = packet.len().min(64);
    String::from_utf8_lossy(&packet[..end]).into_owned()
}

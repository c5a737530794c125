//! Filter chain scaffold
//!
//! A chain is a sequence of components between the client and the backend.
//! Each filter session holds one [`Downstream`] handle (toward the backend)
//! and one [`Upstream`] handle (toward the client). Queries travel down via
//! `route_query`, replies travel up via `client_reply`.
//!
//! [`FilterModule`] binds a concrete [`Filter`] at compile time into the set
//! of entry points a pipeline driver calls. Every entry point catches panics
//! raised by the filter, logs them and turns them into a failure result for
//! that one call.
//!
//! Sessions are called through `&self` and must not hold their own locks
//! while invoking a handle: a cache hit in one session replies upstream into
//! a session that is still inside its own `route_query`.

use std::any::Any;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::config::FilterParameter;
use crate::error::{Error, Result};

/// One protocol message travelling through the chain
pub type Packet = Bytes;

/// A component that accepts queries heading for the backend
pub trait QueryTarget: Send + Sync {
    /// Deliver a query
    fn route_query(&self, packet: Packet) -> Result<()>;
}

/// A component that accepts replies heading for the client
pub trait ReplyTarget: Send + Sync {
    /// Deliver a reply
    fn client_reply(&self, packet: Packet) -> Result<()>;
}

/// Handle on the next component toward the backend
///
/// Non-owning: the driver owns every component. A default handle is the
/// end of the chain and fails if invoked.
#[derive(Clone, Default)]
pub struct Downstream {
    target: Option<Weak<dyn QueryTarget>>,
}

impl Downstream {
    /// Bind to `target`
    pub fn new<T: QueryTarget + 'static>(target: &Arc<T>) -> Self {
        let weak: Weak<T> = Arc::downgrade(target);
        let target: Weak<dyn QueryTarget> = weak;
        Self {
            target: Some(target),
        }
    }

    /// Whether the handle points anywhere
    pub fn is_bound(&self) -> bool {
        self.target.is_some()
    }

    /// Send `packet` to the next component and return its result
    pub fn route_query(&self, packet: Packet) -> Result<()> {
        match &self.target {
            Some(target) => match target.upgrade() {
                Some(target) => target.route_query(packet),
                None => Err(Error::Closed),
            },
            None => {
                error!("routeQuery invoked on an unbound downstream handle");
                Err(Error::EndOfChain("downstream"))
            }
        }
    }
}

impl fmt::Debug for Downstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downstream")
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Handle on the previous component toward the client
#[derive(Clone, Default)]
pub struct Upstream {
    target: Option<Weak<dyn ReplyTarget>>,
}

impl Upstream {
    /// Bind to `target`
    pub fn new<T: ReplyTarget + 'static>(target: &Arc<T>) -> Self {
        let weak: Weak<T> = Arc::downgrade(target);
        let target: Weak<dyn ReplyTarget> = weak;
        Self {
            target: Some(target),
        }
    }

    /// Whether the handle points anywhere
    pub fn is_bound(&self) -> bool {
        self.target.is_some()
    }

    /// Send `packet` to the previous component and return its result
    pub fn client_reply(&self, packet: Packet) -> Result<()> {
        match &self.target {
            Some(target) => match target.upgrade() {
                Some(target) => target.client_reply(packet),
                None => Err(Error::Closed),
            },
            None => {
                error!("clientReply invoked on an unbound upstream handle");
                Err(Error::EndOfChain("upstream"))
            }
        }
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// The two neighbour handles of a session, each bound once
#[derive(Debug, Default)]
pub struct Links {
    down: OnceLock<Downstream>,
    up: OnceLock<Upstream>,
}

impl Links {
    /// Bind the downstream handle; a second binding is ignored
    pub fn set_downstream(&self, down: Downstream) {
        if self.down.set(down).is_err() {
            warn!("Downstream already bound, ignoring rebind");
        }
    }

    /// Bind the upstream handle; a second binding is ignored
    pub fn set_upstream(&self, up: Upstream) {
        if self.up.set(up).is_err() {
            warn!("Upstream already bound, ignoring rebind");
        }
    }

    /// Forward a query downstream
    pub fn route_query(&self, packet: Packet) -> Result<()> {
        match self.down.get() {
            Some(down) => down.route_query(packet),
            None => Downstream::default().route_query(packet),
        }
    }

    /// Forward a reply upstream
    pub fn client_reply(&self, packet: Packet) -> Result<()> {
        match self.up.get() {
            Some(up) => up.client_reply(packet),
            None => Upstream::default().client_reply(packet),
        }
    }
}

/// Per-connection instance of a filter
///
/// The provided methods forward unchanged; a concrete session overrides
/// `route_query` / `client_reply` to short-circuit or transform.
pub trait FilterSession: Send + Sync + 'static {
    /// Neighbour handles of this session
    fn links(&self) -> &Links;

    /// Called once while the chain is wired
    fn set_downstream(&self, down: Downstream) {
        self.links().set_downstream(down);
    }

    /// Called once while the chain is wired
    fn set_upstream(&self, up: Upstream) {
        self.links().set_upstream(up);
    }

    /// A query on its way to the backend
    fn route_query(&self, packet: Packet) -> Result<()> {
        self.links().route_query(packet)
    }

    /// A reply on its way to the client
    fn client_reply(&self, packet: Packet) -> Result<()> {
        self.links().client_reply(packet)
    }

    /// The client session has ended; release held resources
    fn close(&self) {}

    /// Session state for diagnostics
    fn diagnostics(&self) -> Value {
        Value::Null
    }
}

/// Descriptor of the client session a filter session is created for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session id assigned by the driver
    pub id: u64,
    /// Authenticated user
    pub user: String,
    /// Default database of the connection, if any
    pub default_db: Option<String>,
}

/// Optional behaviours a filter needs from the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u64);

impl Capabilities {
    /// Nothing beyond plain packet forwarding
    pub const NONE: Capabilities = Capabilities(0);
    /// Queries arrive as complete statements
    pub const STMT_INPUT: Capabilities = Capabilities(1 << 0);
    /// Queries arrive in one contiguous buffer
    pub const CONTIGUOUS_INPUT: Capabilities = Capabilities(1 << 1);
    /// The pipeline tracks transaction state
    pub const TRANSACTION_TRACKING: Capabilities = Capabilities(1 << 2);
    /// Replies arrive as complete result sets
    pub const RESULTSET_OUTPUT: Capabilities = Capabilities(1 << 3);

    /// Raw bitmask
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Check whether all bits of `other` are set
    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

/// A filter type: creates instances, and sessions of an instance
pub trait Filter: Sized + Send + Sync + 'static {
    /// Session type created per client connection
    type Session: FilterSession;

    /// Create an instance from its configuration
    fn create(name: &str, options: &[String], params: &[FilterParameter]) -> Result<Self>;

    /// Create the session for one client connection
    fn new_session(&self, session: &SessionInfo) -> Result<Self::Session>;

    /// Capabilities the filter requires
    fn capabilities() -> Capabilities;

    /// Instance state for diagnostics
    fn diagnostics(&self) -> Value;
}

/// Driver-side handle on one filter session
///
/// Neighbours bind to the cell, never to the session itself, so every call
/// into the session passes the panic guard and the closed check.
pub struct SessionCell<S> {
    session: S,
    closed: AtomicBool,
}

impl<S: FilterSession> SessionCell<S> {
    fn new(session: S) -> Self {
        Self {
            session,
            closed: AtomicBool::new(false),
        }
    }

    /// The wrapped session
    pub fn session(&self) -> &S {
        &self.session
    }

    /// Whether `close` has been delivered
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Session already closed");
            return;
        }
        let _ = guard("closeSession", || self.session.close());
    }

    fn call<T>(&self, entry: &'static str, f: impl FnOnce(&S) -> Result<T>) -> Result<T> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        guard(entry, || f(&self.session)).unwrap_or_else(|msg| Err(Error::Fault(msg)))
    }
}

impl<S: FilterSession> QueryTarget for SessionCell<S> {
    fn route_query(&self, packet: Packet) -> Result<()> {
        self.call("routeQuery", |session| session.route_query(packet))
    }
}

impl<S: FilterSession> ReplyTarget for SessionCell<S> {
    fn client_reply(&self, packet: Packet) -> Result<()> {
        self.call("clientReply", |session| session.client_reply(packet))
    }
}

/// Entry points of a filter type, resolved at compile time
///
/// This is what a pipeline driver calls: `create_instance` once per
/// configuration, `new_session` per connection, `route_query` and
/// `client_reply` per packet, then `close_session`, `free_session` and
/// finally `destroy_instance`.
pub struct FilterModule<F>(PhantomData<fn() -> F>);

impl<F: Filter> FilterModule<F> {
    /// Create an instance; `None` if the filter refused or panicked
    pub fn create_instance(name: &str, options: &[String], params: &[FilterParameter]) -> Option<F> {
        match guard("createInstance", || F::create(name, options, params)) {
            Ok(Ok(instance)) => Some(instance),
            Ok(Err(e)) => {
                error!("Could not create filter instance '{}': {}", name, e);
                None
            }
            Err(_) => None,
        }
    }

    /// Create the session of one connection; `None` on failure
    pub fn new_session(instance: &F, info: &SessionInfo) -> Option<Arc<SessionCell<F::Session>>> {
        match guard("newSession", || instance.new_session(info)) {
            Ok(Ok(session)) => Some(Arc::new(SessionCell::new(session))),
            Ok(Err(e)) => {
                error!("Could not create filter session {}: {}", info.id, e);
                None
            }
            Err(_) => None,
        }
    }

    /// Deliver `close`; only the first call reaches the session
    pub fn close_session(session: &SessionCell<F::Session>) {
        session.close();
    }

    /// Release the driver's handle on a session
    pub fn free_session(session: Arc<SessionCell<F::Session>>) {
        if !session.is_closed() {
            warn!("Freeing a session that was never closed");
            session.close();
        }
        let _ = guard("freeSession", move || drop(session));
    }

    /// Bind the component following the session
    pub fn set_downstream(session: &SessionCell<F::Session>, down: Downstream) {
        let _ = guard("setDownstream", || session.session.set_downstream(down));
    }

    /// Bind the component preceding the session
    pub fn set_upstream(session: &SessionCell<F::Session>, up: Upstream) {
        let _ = guard("setUpstream", || session.session.set_upstream(up));
    }

    /// Route a client packet into the session
    pub fn route_query(session: &SessionCell<F::Session>, packet: Packet) -> Result<()> {
        QueryTarget::route_query(session, packet)
    }

    /// Route a backend packet into the session
    pub fn client_reply(session: &SessionCell<F::Session>, packet: Packet) -> Result<()> {
        ReplyTarget::client_reply(session, packet)
    }

    /// Write instance (and optionally session) diagnostics as JSON
    pub fn diagnostics(
        instance: &F,
        session: Option<&SessionCell<F::Session>>,
        out: &mut dyn io::Write,
    ) -> io::Result<()> {
        let report = guard("diagnostics", || {
            let mut report = json!({ "filter": instance.diagnostics() });
            if let Some(session) = session {
                report["session"] = session.session.diagnostics();
            }
            report
        })
        .unwrap_or_else(|msg| json!({ "error": msg }));

        serde_json::to_writer_pretty(&mut *out, &report)?;
        writeln!(out)
    }

    /// Capabilities of the filter type; empty if the query panicked
    pub fn capabilities() -> Capabilities {
        guard("getCapabilities", F::capabilities).unwrap_or(Capabilities::NONE)
    }

    /// Drop the instance
    pub fn destroy_instance(instance: F) {
        let _ = guard("destroyInstance", move || drop(instance));
    }
}

/// Run `f`, converting a panic into a logged error message
fn guard<T>(entry: &'static str, f: impl FnOnce() -> T) -> std::result::Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let msg = panic_message(payload.as_ref());
        error!("Caught fault in {}: {}", entry, msg);
        msg
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Chain end points: the client sink and a backend stub

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use proxyfilter::{Packet, QueryTarget, ReplyTarget, Result};

/// Receives replies at the client end of the chain
#[derive(Default)]
pub struct Client {
    replies: AtomicU64,
    bytes: AtomicU64,
}

impl Client {
    pub fn replies(&self) -> u64 {
        self.replies.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl ReplyTarget for Client {
    fn client_reply(&self, packet: Packet) -> Result<()> {
        self.replies.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(packet.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Backend stub answering every query with a synthetic result
///
/// Replies are queued and handed out by [`Backend::next_reply`] after
/// `route_query` returns, the way a network transport would deliver them.
pub struct Backend {
    latency: Duration,
    queries: AtomicU64,
    pending: Mutex<VecDeque<Packet>>,
}

impl Backend {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            queries: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Queries that reached the backend
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Produce the reply to the oldest outstanding query
    pub fn next_reply(&self) -> Option<Packet> {
        let query = self.pending.lock().pop_front()?;

        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let mut reply = BytesMut::with_capacity(query.len() + 16);
        reply.put_slice(b"resultset[");
        reply.put_slice(&query);
        reply.put_slice(b"]");
        Some(reply.freeze())
    }
}

impl QueryTarget for Backend {
    fn route_query(&self, packet: Packet) -> Result<()> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().push_back(packet);
        Ok(())
    }
}

/// Turn query text into packets, skipping blank lines and `#` comments
pub fn parse_queries(text: &str) -> Vec<Bytes> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Bytes::copy_from_slice(line.as_bytes()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_queues_replies() {
        let backend = Backend::new(Duration::ZERO);

        backend.route_query(Bytes::from_static(b"SELECT 1")).unwrap();
        backend.route_query(Bytes::from_static(b"SELECT 2")).unwrap();

        assert_eq!(backend.queries(), 2);
        assert_eq!(backend.next_reply().unwrap(), "resultset[SELECT 1]");
        assert_eq!(backend.next_reply().unwrap(), "resultset[SELECT 2]");
        assert!(backend.next_reply().is_none());
    }

    #[test]
    fn test_client_counts() {
        let client = Client::default();
        client.client_reply(Bytes::from_static(b"abcd")).unwrap();

        assert_eq!(client.replies(), 1);
        assert_eq!(client.bytes(), 4);
    }

    #[test]
    fn test_parse_queries() {
        let queries = parse_queries("SELECT 1\n\n# comment\n  SELECT 2  \n");
        assert_eq!(queries, vec![Bytes::from("SELECT 1"), Bytes::from("SELECT 2")]);
    }
}

//! Replays queries through one cache filter session per worker

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use proxyfilter::{CacheFilter, Downstream, FilterModule, SessionInfo, Upstream};
use tracing::{info, warn};

use crate::endpoint::{Backend, Client};

type CacheModule = FilterModule<CacheFilter>;

/// Outcome of one worker's replay
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub worker: u64,
    pub queries: u64,
    pub backend_queries: u64,
    pub replies: u64,
    pub failures: u64,
    pub elapsed: Duration,
}

impl WorkerReport {
    /// Queries answered without reaching the backend
    pub fn served_from_cache(&self) -> u64 {
        // A forwarded query whose reply failed counts in both terms.
        self.queries
            .saturating_sub(self.failures)
            .saturating_sub(self.backend_queries)
    }
}

/// Wire `client ⇄ cache session ⇄ backend` and push every query through it
pub fn run_worker(
    filter: &CacheFilter,
    worker: u64,
    database: Option<&str>,
    queries: &[Bytes],
    latency: Duration,
) -> Result<WorkerReport> {
    let info = SessionInfo {
        id: worker,
        user: "proxyd".to_string(),
        default_db: database.map(str::to_string),
    };
    let session = CacheModule::new_session(filter, &info)
        .ok_or_else(|| anyhow!("could not create session for worker {}", worker))?;

    let client = Arc::new(Client::default());
    let backend = Arc::new(Backend::new(latency));
    CacheModule::set_upstream(&session, Upstream::new(&client));
    CacheModule::set_downstream(&session, Downstream::new(&backend));

    let started = Instant::now();
    let mut failures = 0;

    for query in queries {
        if let Err(e) = CacheModule::route_query(&session, query.clone()) {
            warn!("Worker {}: query failed: {}", worker, e);
            failures += 1;
            continue;
        }

        while let Some(reply) = backend.next_reply() {
            if let Err(e) = CacheModule::client_reply(&session, reply) {
                warn!("Worker {}: reply failed: {}", worker, e);
                failures += 1;
            }
        }
    }

    let elapsed = started.elapsed();

    CacheModule::close_session(&session);
    CacheModule::free_session(session);

    info!("Worker {} finished {} queries in {:?}", worker, queries.len(), elapsed);

    Ok(WorkerReport {
        worker,
        queries: queries.len() as u64,
        backend_queries: backend.queries(),
        replies: client.replies(),
        failures,
        elapsed,
    })
}

/// Run `workers` sessions concurrently over the same query list
pub fn run_workers(
    filter: &CacheFilter,
    workers: u64,
    database: Option<&str>,
    queries: &[Bytes],
    latency: Duration,
) -> Result<Vec<WorkerReport>> {
    thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                scope.spawn(move || run_worker(filter, worker, database, queries, latency))
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow!("worker thread panicked"))?
            })
            .collect()
    })
}

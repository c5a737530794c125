//! proxyd - replays a query log through the result cache filter

mod endpoint;
mod replay;

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use proxyfilter::{CacheFilter, FilterModule, FilterParameter};
use tracing::info;

use crate::endpoint::parse_queries;
use crate::replay::run_workers;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Maximum number of cached results (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_count: u64,

    /// Maximum total size of cached results, e.g. 64Mi (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_size: String,

    /// Largest single result that will be cached
    #[arg(long, default_value = "64Ki")]
    max_resultset_size: String,

    /// Storage sharing between sessions: mt (shared) or st (per session)
    #[arg(long, default_value = "mt")]
    thread_model: String,

    /// Seconds after which a cached result is stale (0 = never)
    #[arg(long, default_value_t = 0)]
    soft_ttl: u64,

    /// Seconds after which a cached result is discarded (0 = never)
    #[arg(long, default_value_t = 0)]
    hard_ttl: u64,

    /// Decision logging mask (1..31)
    #[arg(long, default_value_t = 0)]
    debug: u32,

    /// Number of concurrent client sessions
    #[arg(short, long, default_value_t = 1)]
    workers: u64,

    /// Default database of each session
    #[arg(long)]
    database: Option<String>,

    /// Simulated backend latency per query in milliseconds
    #[arg(long, default_value_t = 0)]
    backend_latency_ms: u64,

    /// File with one query per line (reads stdin when omitted)
    #[arg(short, long)]
    queries: Option<PathBuf>,
}

impl Args {
    fn filter_parameters(&self) -> Vec<FilterParameter> {
        vec![
            FilterParameter::new("max_count", self.max_count.to_string()),
            FilterParameter::new("max_size", self.max_size.clone()),
            FilterParameter::new("max_resultset_size", self.max_resultset_size.clone()),
            FilterParameter::new("thread_model", self.thread_model.clone()),
            FilterParameter::new("soft_ttl", self.soft_ttl.to_string()),
            FilterParameter::new("hard_ttl", self.hard_ttl.to_string()),
            FilterParameter::new("debug", self.debug.to_string()),
        ]
    }

    fn read_queries(&self) -> Result<String> {
        match &self.queries {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("reading queries from {}", path.display())),
            None => {
                let mut text = String::new();
                io::stdin().read_to_string(&mut text)?;
                Ok(text)
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    info!("Starting proxyd v{}", env!("CARGO_PKG_VERSION"));

    let queries = parse_queries(&args.read_queries()?);
    info!("Loaded {} queries", queries.len());

    let filter = FilterModule::<CacheFilter>::create_instance("cache", &[], &args.filter_parameters())
        .ok_or_else(|| anyhow!("could not create the cache filter"))?;

    let reports = run_workers(
        &filter,
        args.workers.max(1),
        args.database.as_deref(),
        &queries,
        Duration::from_millis(args.backend_latency_ms),
    )?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    for report in &reports {
        writeln!(
            out,
            "worker {}: {} queries, {} from cache, {} to backend, {} failed, {:?}",
            report.worker,
            report.queries,
            report.served_from_cache(),
            report.backend_queries,
            report.failures,
            report.elapsed,
        )?;
    }

    FilterModule::diagnostics(&filter, None, &mut out)?;
    writeln!(out)?;

    FilterModule::destroy_instance(filter);
    info!("Shutdown complete");

    Ok(())
}

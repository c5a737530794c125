//! Cache filter configuration
//!
//! Parameters arrive as `name=value` pairs, either already split
//! ([`FilterParameter`]) or as one option string:
//!
//! ```text
//! max_count=1000, max_size=64Mi, thread_model=st
//! ```
//!
//! Sizes accept decimal (`K`, `M`, `G`) and binary (`Ki`, `Mi`, `Gi`) suffixes.

use std::time::Duration;

use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{char, digit1, multispace0},
    combinator::{all_consuming, map, map_res, opt, value},
    multi::separated_list0,
    sequence::{delimited, pair, separated_pair},
    IResult,
};
use proxycache::Limits;
use proxystore::TtlConfig;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Replies larger than this are not cached unless configured otherwise
pub const DEFAULT_MAX_RESULTSET_SIZE: u64 = 64 * 1024;

/// Log statements that match the cache rules
pub const DEBUG_MATCHING: u32 = 1;
/// Log statements that do not match the cache rules
pub const DEBUG_NON_MATCHING: u32 = 2;
/// Log replies served from the cache
pub const DEBUG_USE: u32 = 4;
/// Log statements that had to go to the backend
pub const DEBUG_NON_USE: u32 = 8;
/// Log whether replies were stored
pub const DEBUG_DECISIONS: u32 = 16;
/// Highest valid debug mask
pub const DEBUG_MAX: u32 = 31;

/// One configured `name=value` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterParameter {
    /// Parameter name
    pub name: String,
    /// Raw value
    pub value: String,
}

impl FilterParameter {
    /// Create a parameter
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// How the cache storage is shared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadModel {
    /// One storage shared by all sessions, guarded by a lock
    Mt,
    /// One storage per session, no locking
    St,
}

/// Settings of a cache filter instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheConfig {
    /// Maximum number of cached replies; 0 is unlimited
    pub max_count: u64,
    /// Maximum total bytes of cached replies; 0 is unlimited
    pub max_size: u64,
    /// Largest reply that is stored
    pub max_resultset_size: u64,
    /// Storage sharing
    pub thread_model: ThreadModel,
    /// Seconds after which a cached reply is stale; 0 disables
    pub soft_ttl: u64,
    /// Seconds after which a cached reply is dropped; 0 disables
    pub hard_ttl: u64,
    /// `DEBUG_*` bitmask
    pub debug: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_count: 0,
            max_size: 0,
            max_resultset_size: DEFAULT_MAX_RESULTSET_SIZE,
            thread_model: ThreadModel::Mt,
            soft_ttl: 0,
            hard_ttl: 0,
            debug: 0,
        }
    }
}

impl CacheConfig {
    /// Build a configuration from parameters; later parameters win
    pub fn from_params(params: &[FilterParameter]) -> Result<Self> {
        let mut config = CacheConfig::default();

        for param in params {
            let value = param.value.as_str();
            match param.name.as_str() {
                "max_count" => config.max_count = parse_number(&param.name, value)?,
                "max_size" => config.max_size = parse_size(value)?,
                "max_resultset_size" => config.max_resultset_size = parse_size(value)?,
                "soft_ttl" => config.soft_ttl = parse_number(&param.name, value)?,
                "hard_ttl" => config.hard_ttl = parse_number(&param.name, value)?,
                "thread_model" => {
                    config.thread_model = match value.trim().to_ascii_lowercase().as_str() {
                        "mt" => ThreadModel::Mt,
                        "st" => ThreadModel::St,
                        other => {
                            return Err(Error::Config(format!(
                                "thread_model must be 'mt' or 'st', not '{}'",
                                other
                            )))
                        }
                    }
                }
                "debug" => {
                    let debug = parse_number(&param.name, value)?;
                    if debug > u64::from(DEBUG_MAX) {
                        return Err(Error::Config(format!(
                            "debug must be between 0 and {}, not {}",
                            DEBUG_MAX, debug
                        )));
                    }
                    config.debug = debug as u32;
                }
                other => return Err(Error::Config(format!("unknown parameter '{}'", other))),
            }
        }

        // A single reply above max_size would flush the whole cache on insert.
        if config.max_size != 0 && config.max_resultset_size > config.max_size {
            warn!(
                "max_resultset_size ({}) exceeds max_size ({}), lowering it to max_size",
                config.max_resultset_size, config.max_size
            );
            config.max_resultset_size = config.max_size;
        }

        Ok(config)
    }

    /// LRU ceilings
    pub fn limits(&self) -> Limits {
        Limits::new(self.max_count, self.max_size)
    }

    /// Staleness policy for the in-memory backend
    pub fn ttl(&self) -> TtlConfig {
        TtlConfig {
            soft_ttl: Duration::from_secs(self.soft_ttl),
            hard_ttl: Duration::from_secs(self.hard_ttl),
        }
    }

    /// Check a `DEBUG_*` bit
    pub fn debug_enabled(&self, flag: u32) -> bool {
        self.debug & flag != 0
    }
}

fn parameter(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        delimited(
            multispace0,
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
            multispace0,
        ),
        char('='),
        delimited(
            multispace0,
            take_while1(|c: char| c != ',' && !c.is_whitespace()),
            multispace0,
        ),
    )(input)
}

/// Split a `name=value,name=value` option string
pub fn parse_options(input: &str) -> Result<Vec<FilterParameter>> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }

    let (_, pairs) = all_consuming(separated_list0(char(','), parameter))(input)
        .map_err(|e| Error::Config(format!("malformed options '{}': {:?}", input, e)))?;

    Ok(pairs
        .into_iter()
        .map(|(name, value)| FilterParameter::new(name, value))
        .collect())
}

fn size(input: &str) -> IResult<&str, (u64, u64)> {
    pair(
        map_res(digit1, str::parse::<u64>),
        map(
            opt(alt((
                value(1u64 << 10, tag_no_case("Ki")),
                value(1u64 << 20, tag_no_case("Mi")),
                value(1u64 << 30, tag_no_case("Gi")),
                value(1_000u64, tag_no_case("K")),
                value(1_000_000u64, tag_no_case("M")),
                value(1_000_000_000u64, tag_no_case("G")),
            ))),
            |multiplier| multiplier.unwrap_or(1),
        ),
    )(input)
}

/// Parse a byte size such as `4096`, `64Ki` or `2M`
pub fn parse_size(input: &str) -> Result<u64> {
    let (_, (number, multiplier)) = all_consuming(size)(input.trim())
        .map_err(|_| Error::Config(format!("invalid size '{}'", input)))?;

    number
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Config(format!("size '{}' is too large", input)))
}

fn parse_number(name: &str, input: &str) -> Result<u64> {
    input
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be an unsigned integer, not '{}'", name, input)))
}

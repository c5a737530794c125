//! Error types for proxystore

use std::fmt;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Outcomes of a storage operation other than success
///
/// `NotFound` and `Stale` are ordinary cache misses. Everything else is a
/// failure and must reach the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Key not present
    NotFound,

    /// Key present but the backend considers the value out of date
    Stale,

    /// Operation not provided by this backend
    Unsupported(&'static str),

    /// Allocation failed while creating an entry
    OutOfResources,

    /// Backend failure
    Backend(String),
}

impl Error {
    /// True for the normal miss outcomes (`NotFound`, `Stale`)
    pub fn is_miss(&self) -> bool {
        matches!(self, Error::NotFound | Error::Stale)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "Key not found"),
            Error::Stale => write!(f, "Value is stale"),
            Error::Unsupported(op) => write!(f, "Operation not supported: {}", op),
            Error::OutOfResources => write!(f, "Out of resources"),
            Error::Backend(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfResources
    }
}

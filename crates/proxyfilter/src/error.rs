//! Error types for proxyfilter

use std::fmt;

/// Result type alias for filter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised along the filter chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Storage failure surfaced by a filter
    Storage(proxystore::Error),

    /// Invalid filter parameter or option
    Config(String),

    /// A handle was invoked before being bound to a neighbour
    EndOfChain(&'static str),

    /// The session has already been closed
    Closed,

    /// A filter entry point panicked; the call failed, the chain survives
    Fault(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Storage(e) => write!(f, "Storage error: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::EndOfChain(direction) => write!(f, "No {} component bound", direction),
            Error::Closed => write!(f, "Session is closed"),
            Error::Fault(msg) => write!(f, "Filter fault: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<proxystore::Error> for Error {
    fn from(err: proxystore::Error) -> Self {
        Error::Storage(err)
    }
}

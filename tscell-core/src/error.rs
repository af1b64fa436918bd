//! Error types for tscell

use thiserror::Error;

/// Result type alias for tscell operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for store collaborator calls
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// tscell error types
#[derive(Error, Debug)]
pub enum Error {
    /// Timestamp cannot be represented in a row key or qualifier
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Value cannot be stored (NaN, infinite, unparsable)
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Series key does not match the configured identifier widths
    #[error("Invalid series key: {0}")]
    InvalidSeriesKey(String),

    /// Row key too short to carry a base time
    #[error("Invalid row key: expected at least {expected} bytes, got {actual}")]
    InvalidRowKey { expected: usize, actual: usize },

    /// Qualifier/value pair that does not decode as data points
    #[error("Invalid qualifier: {0}")]
    InvalidQualifier(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Store collaborator failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if error was raised before any store I/O happened
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidTimestamp(_)
                | Error::InvalidValue(_)
                | Error::InvalidSeriesKey(_)
                | Error::InvalidRowKey { .. }
                | Error::InvalidQualifier(_)
        )
    }
}

/// Failures reported by the wide-column store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store asks the caller to slow down and retry later
    #[error("store is throttling requests")]
    Backpressure,

    /// The request did not complete in time
    #[error("store request timed out")]
    Timeout,

    /// The store (or the region serving the row) is unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Any other server-side failure
    #[error("store failure: {0}")]
    Other(String),
}

impl StoreError {
    /// Backpressure is a scheduling signal, not a failure
    pub fn is_backpressure(&self) -> bool {
        matches!(self, StoreError::Backpressure)
    }

    /// Check if the same request may succeed later
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Other(_))
    }
}

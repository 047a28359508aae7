//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Rejections are not errors; they are ordinary [`Decision`](crate::ratelimit::Decision)
/// values. Only configuration faults and backend faults live here.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Malformed configuration or policy table. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared store could not be reached or did not answer in time.
    #[error("Rate limit backend unavailable: {0}")]
    BackendUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::BackendUnavailable(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

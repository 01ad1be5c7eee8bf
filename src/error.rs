//! Error types for the Tollgate engine.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Invalid configuration or rule template
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure reaching the rate authority or the bootstrap source
    #[error("Transport error: {0}")]
    Transport(String),

    /// A pending decision did not complete in time
    #[error("Decision timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Verdict bookkeeping went wrong (duplicate, overflow, unknown rule)
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    /// The pending decision was cancelled before it completed
    #[error("Decision cancelled")]
    Cancelled,

    /// The engine no longer accepts new decisions
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// gRPC transport errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for TollgateError {
    fn from(err: serde_yaml::Error) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

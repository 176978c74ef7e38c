//! Error types for NetWarden

use thiserror::Error;

/// NetWarden error type
#[derive(Error, Debug)]
pub enum WardenError {
    /// Invalid configuration value
    #[error("config error: {0}")]
    Config(String),

    /// Persistence payload could not be read or written; the engine keeps
    /// running on in-memory state
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Result type for NetWarden
pub type WardenResult<T> = Result<T, WardenError>;

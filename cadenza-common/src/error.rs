//! Shared error type for the Cadenza crates

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the shared store, config and filesystem helpers
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored JSON could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bootstrap TOML could not be read or written
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stored value violates an invariant (e.g. an unknown status string)
    #[error("Internal error: {0}")]
    Internal(String),
}

//! Error types for `overmux` core library.

use thiserror::Error;

use crate::addr::AddrError;

/// Result type alias using `overmux` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `overmux` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Overlay address error
    #[error("Address error: {0}")]
    Addr(#[from] AddrError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

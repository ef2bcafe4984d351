//! Error types for DataFlow

use thiserror::Error;

/// Result type alias for DataFlow operations
pub type Result<T> = std::result::Result<T, DataflowError>;

/// Main error type shared by DataFlow crates
#[derive(Error, Debug)]
pub enum DataflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

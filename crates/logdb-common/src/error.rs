//! Error types for LogDB

use thiserror::Error;

/// Result type alias for LogDB operations
pub type Result<T> = std::result::Result<T, LogdbError>;

/// Main error type for LogDB
#[derive(Error, Debug)]
pub enum LogdbError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

//! Server-specific error types

use thiserror::Error;

use crate::broker::BrokerError;

/// Result type alias for worker operations
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// Errors from the relational store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Errors that end a worker process.
///
/// Nothing here is retried in place. `main` logs the error and exits
/// non-zero so the supervisor can start a clean replacement.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<logdb_common::LogdbError> for WorkerError {
    fn from(e: logdb_common::LogdbError) -> Self {
        WorkerError::Config(e.to_string())
    }
}

/// Supervisor-side failures. None of them stop the other worker classes.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn {class}: {source}")]
    Spawn {
        class: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {class} has no stdout to read liveness from")]
    MissingStdout { class: String },
}

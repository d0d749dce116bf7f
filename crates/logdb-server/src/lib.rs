//! LogDB Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ingests log records from remote devices, buffers them durably in an AMQP
//! broker and drains them into PostgreSQL, with a supervisor that keeps every
//! worker process alive.
//!
//! # Overview
//!
//! - **Protocol listener**: accepts device TCP connections, frames and
//!   validates newline-delimited JSON, publishes to a fanout exchange
//! - **Loader**: consumes the bound queue, batches rows and acknowledges each
//!   delivery only after its batch is committed
//! - **Cleaner**: optional retention job
//! - **Supervisor**: one OS process per worker class, restarted on exit and
//!   killed when its liveness signal stops
//!
//! # Delivery guarantees
//!
//! At least once. Any broker or database failure ends the worker process;
//! the broker redelivers whatever was not acknowledged to the replacement,
//! and the insert ignores rows it has already stored.
//!
//! # Example
//!
//! ```no_run
//! use logdb_server::config::Config;
//! use logdb_server::liveness::NoopLiveness;
//! use logdb_server::loader::run_loader;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     run_loader(&config, NoopLiveness).await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod liveness;
pub mod loader;
pub mod protocol;
pub mod record;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use error::{StoreError, SupervisorError, WorkerError, WorkerResult};

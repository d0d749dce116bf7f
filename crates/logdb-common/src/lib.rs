//! LogDB Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging and error handling for the LogDB workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`LogdbError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup shared by the supervisor and every
//!   worker process
//! - **Types**: broker resource namespacing and worker class names
//!
//! # Example
//!
//! ```no_run
//! use logdb_common::logging::{init_logging, LogConfig};
//! use logdb_common::types::Namespace;
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!
//!     let ns = Namespace::test();
//!     assert_eq!(ns.resource("android_loader_log"), "android_loader_log_test");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{LogdbError, Result};

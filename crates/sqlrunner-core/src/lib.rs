//! # sqlrunner-core
//!
//! Run SQL over an in-memory Arrow record batch with an embedded DuckDB
//! engine.
//!
//! The batch is encoded as an Arrow IPC stream, ingested as a table through an
//! ADBC-style connectivity layer, queried, and the final statement's batches
//! are returned as Arrow again.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sqlrunner_core::{sample_record_batch, SqlRunner};
//!
//! fn main() -> Result<(), sqlrunner_core::Error> {
//!     let mut runner = SqlRunner::in_memory()?;
//!     let batches = runner.run_sql_on_record(
//!         &sample_record_batch(),
//!         &["SELECT column1 + 1 FROM {{.Table}}"],
//!     )?;
//!     for batch in &batches {
//!         print!("{}", sqlrunner_core::format_record_batch(batch));
//!     }
//!     runner.close();
//!     Ok(())
//! }
//! ```

pub mod adbc;
pub mod batch;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod ipc;
pub mod result;
pub mod runner;
pub mod template;

pub use adbc::{Canceller, DriverError, DriverManager, Status};
pub use batch::sample_record_batch;
pub use cancel::CancelToken;
pub use config::{RunnerConfig, RunnerConfigBuilder, DEFAULT_TABLE_NAME};
pub use error::{Error, Result};
pub use format::{describe_record_batch, format_record_batch, format_value};
pub use ipc::{deserialize_record_batches, serialize_record_batch, IpcError};
pub use result::{ExecOutcome, Output};
pub use runner::{RunStep, SqlRunner};
pub use template::TemplateError;

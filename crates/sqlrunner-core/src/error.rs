use crate::adbc::DriverError;
use crate::ipc::IpcError;
use crate::runner::RunStep;
use crate::template::TemplateError;
use thiserror::Error;

/// Error type for runner operations.
///
/// Each variant names the step that failed; the underlying cause is kept as
/// the error source.
#[derive(Error, Debug)]
pub enum Error {
    /// Engine database or connection could not be opened.
    #[error("connection error: {context}")]
    Connection {
        context: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Input batch could not be encoded.
    #[error("failed to serialize record")]
    Serialization(#[source] IpcError),

    /// Table creation, binding or ingestion failed.
    #[error("failed to import record into '{table}': {context}")]
    Ingestion {
        table: String,
        context: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Malformed placeholder in one of the statements.
    #[error("failed to expand statement {index}")]
    Template {
        index: usize,
        #[source]
        source: TemplateError,
    },

    /// A statement in the sequence failed.
    #[error("failed to run statement {index}: {context}")]
    Query {
        index: usize,
        context: &'static str,
        #[source]
        source: DriverError,
    },

    /// The ingested table could not be dropped.
    #[error("failed to drop '{table}' after running query")]
    Cleanup {
        table: String,
        #[source]
        source: DriverError,
    },

    #[error("runner is closed")]
    Closed,

    #[error("cancelled during {step}")]
    Cancelled { step: RunStep },
}

pub type Result<T> = std::result::Result<T, Error>;

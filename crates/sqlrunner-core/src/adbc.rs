//! Generic database connectivity.
//!
//! A small, synchronous rendition of the ADBC object model: a [`Driver`] opens
//! a [`Database`], a database hands out [`Connection`]s, and a connection
//! creates [`Statement`]s that either run SQL or ingest a bound Arrow stream.
//! Option keys and values use the standard ADBC strings so configuration
//! written for other ADBC drivers reads the same here.

use arrow_array::{RecordBatch, RecordBatchReader};
use arrow_schema::{ArrowError, SchemaRef};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Statement option naming the table a bound stream is ingested into.
pub const OPTION_INGEST_TARGET_TABLE: &str = "adbc.ingest.target_table";
/// Statement option selecting how ingestion treats an existing table.
pub const OPTION_INGEST_MODE: &str = "adbc.ingest.mode";
pub const INGEST_MODE_CREATE: &str = "adbc.ingest.mode.create";
pub const INGEST_MODE_APPEND: &str = "adbc.ingest.mode.append";
pub const INGEST_MODE_REPLACE: &str = "adbc.ingest.mode.replace";
pub const INGEST_MODE_CREATE_APPEND: &str = "adbc.ingest.mode.create_append";

pub const DATABASE_OPTION_DRIVER: &str = "driver";
pub const DATABASE_OPTION_ENTRYPOINT: &str = "entrypoint";
pub const DATABASE_OPTION_PATH: &str = "path";

pub const DUCKDB_DRIVER: &str = "duckdb";
pub const DUCKDB_ENTRYPOINT: &str = "duckdb_adbc_init";
pub const IN_MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    InvalidArgument,
    InvalidState,
    NotFound,
    AlreadyExists,
    NotImplemented,
    Internal,
    Io,
    Cancelled,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::InvalidArgument => "invalid argument",
            Status::InvalidState => "invalid state",
            Status::NotFound => "not found",
            Status::AlreadyExists => "already exists",
            Status::NotImplemented => "not implemented",
            Status::Internal => "internal",
            Status::Io => "io",
            Status::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Error reported by a driver, database, connection or statement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct DriverError {
    pub status: Status,
    pub message: String,
}

impl DriverError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Status::InvalidArgument, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(Status::InvalidState, message)
    }
}

impl From<ArrowError> for DriverError {
    fn from(e: ArrowError) -> Self {
        match e {
            ArrowError::IoError(msg, _) => DriverError::new(Status::Io, msg),
            ArrowError::NotYetImplemented(msg) => DriverError::new(Status::NotImplemented, msg),
            other => DriverError::new(Status::Internal, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// How ingestion treats the target table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum IngestMode {
    /// Create the table; fail if it exists.
    #[default]
    Create,
    /// Append to an existing table; fail if it is missing.
    Append,
    /// Drop any existing table, then create it.
    Replace,
    /// Create the table if missing, then append.
    CreateAppend,
}

impl IngestMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            INGEST_MODE_CREATE => Ok(IngestMode::Create),
            INGEST_MODE_APPEND => Ok(IngestMode::Append),
            INGEST_MODE_REPLACE => Ok(IngestMode::Replace),
            INGEST_MODE_CREATE_APPEND => Ok(IngestMode::CreateAppend),
            other => Err(DriverError::invalid_argument(format!(
                "unknown ingest mode '{other}'"
            ))),
        }
    }

    pub fn as_option_value(&self) -> &'static str {
        match self {
            IngestMode::Create => INGEST_MODE_CREATE,
            IngestMode::Append => INGEST_MODE_APPEND,
            IngestMode::Replace => INGEST_MODE_REPLACE,
            IngestMode::CreateAppend => INGEST_MODE_CREATE_APPEND,
        }
    }
}

/// Key/value options used to open a database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseOptions {
    options: HashMap<String, String>,
}

impl DatabaseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn driver(&self) -> Option<&str> {
        self.get(DATABASE_OPTION_DRIVER)
    }

    pub fn entrypoint(&self) -> Option<&str> {
        self.get(DATABASE_OPTION_ENTRYPOINT)
    }

    /// Database path; `:memory:` when unset.
    pub fn path(&self) -> &str {
        self.get(DATABASE_OPTION_PATH).unwrap_or(IN_MEMORY_PATH)
    }
}

/// Result cursor of [`Statement::execute_query`].
///
/// The DuckDB backend materialises the whole result before returning, so the
/// stream only hands out batches already in memory and holds no engine
/// resources.
pub struct QueryStream {
    reader: Box<dyn RecordBatchReader + Send>,
}

impl QueryStream {
    pub fn new(reader: Box<dyn RecordBatchReader + Send>) -> Self {
        Self { reader }
    }

    pub fn schema(&self) -> SchemaRef {
        self.reader.schema()
    }

    /// Drain the cursor, keeping every batch in emission order.
    pub fn collect_batches(self) -> Result<Vec<RecordBatch>> {
        self.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DriverError::from)
    }
}

impl Iterator for QueryStream {
    type Item = std::result::Result<RecordBatch, ArrowError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next()
    }
}

impl fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStream")
            .field("schema", &self.reader.schema())
            .finish()
    }
}

pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    fn new_database(&self, options: &DatabaseOptions) -> Result<Box<dyn Database>>;
}

pub trait Database: Send {
    fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Release the database. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Interrupts whatever its connection is executing. Callable from any thread.
pub trait Canceller: Send + Sync {
    fn cancel(&self);
}

pub trait Connection: Send {
    fn new_statement(&self) -> Result<Box<dyn Statement>>;

    /// Handle that aborts the statement currently running on this
    /// connection. The aborted call fails with [`Status::Cancelled`].
    fn canceller(&self) -> Result<Arc<dyn Canceller>>;

    /// Release the connection. Statements created from it fail afterwards.
    fn close(&mut self) -> Result<()>;
}

pub trait Statement: Send {
    fn set_option(&mut self, key: &str, value: &str) -> Result<()>;

    fn set_sql_query(&mut self, sql: &str) -> Result<()>;

    /// Bind a stream for bulk ingestion into the target table option.
    fn bind_stream(&mut self, reader: Box<dyn RecordBatchReader + Send>) -> Result<()>;

    fn execute_query(&mut self) -> Result<QueryStream>;

    /// Run without producing a result set. Returns affected rows when known.
    fn execute_update(&mut self) -> Result<Option<i64>>;

    fn close(&mut self) -> Result<()>;
}

/// Resolves the `driver` database option to a built-in driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverManager;

impl DriverManager {
    pub fn load(options: &DatabaseOptions) -> Result<Box<dyn Driver>> {
        let name = options
            .driver()
            .ok_or_else(|| DriverError::invalid_argument("missing 'driver' option"))?;
        match name {
            DUCKDB_DRIVER => {
                if let Some(entrypoint) = options.entrypoint() {
                    if entrypoint != DUCKDB_ENTRYPOINT {
                        return Err(DriverError::new(
                            Status::NotFound,
                            format!("driver '{name}' has no entrypoint '{entrypoint}'"),
                        ));
                    }
                }
                Ok(Box::new(crate::engine::DuckDbDriver))
            }
            other => Err(DriverError::new(
                Status::NotFound,
                format!("no driver registered under '{other}'"),
            )),
        }
    }

    /// Load the driver named by `options` and open a database with it.
    pub fn open(options: &DatabaseOptions) -> Result<Box<dyn Database>> {
        let driver = Self::load(options)?;
        tracing::debug!(driver = driver.name(), path = options.path(), "opening database");
        driver.new_database(options)
    }
}

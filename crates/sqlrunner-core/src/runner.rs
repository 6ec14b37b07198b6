use crate::adbc::{
    Canceller, Connection, Database, DriverError, DriverManager, Statement, INGEST_MODE_CREATE,
    OPTION_INGEST_MODE, OPTION_INGEST_TARGET_TABLE,
};
use crate::cancel::CancelToken;
use crate::config::{validate_table_name, RunnerConfig};
use crate::error::{Error, Result};
use crate::ipc;
use crate::result::{total_rows, ExecOutcome, Output};
use crate::template;
use arrow_array::{RecordBatch, RecordBatchReader};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a running step re-checks its cancel token.
const WATCH_INTERVAL: Duration = Duration::from_millis(10);

/// Steps of one `run_sql_on_record` call, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStep {
    Serializing,
    Importing,
    /// Zero-based statement index.
    Executing(usize),
    CleaningUp,
}

impl fmt::Display for RunStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStep::Serializing => f.write_str("serializing"),
            RunStep::Importing => f.write_str("importing"),
            RunStep::Executing(i) => write!(f, "statement {i}"),
            RunStep::CleaningUp => f.write_str("cleanup"),
        }
    }
}

/// A failed sub-step inside statement execution or ingestion.
struct StepFailure {
    context: &'static str,
    source: DriverError,
}

trait StepContext<T> {
    fn step(self, context: &'static str) -> std::result::Result<T, StepFailure>;
}

impl<T> StepContext<T> for std::result::Result<T, DriverError> {
    fn step(self, context: &'static str) -> std::result::Result<T, StepFailure> {
        self.map_err(|source| StepFailure { context, source })
    }
}

/// Cancellation for one call: checked between steps and, while a step runs,
/// enforced inside the engine through the connection's canceller.
struct Watch<'a> {
    cancel: Option<&'a CancelToken>,
    canceller: Option<&'a dyn Canceller>,
}

impl Watch<'_> {
    fn check(&self, step: RunStep) -> Result<()> {
        match self.cancel {
            Some(cancel) if cancel.is_cancelled() => {
                debug!(step = %step, "run cancelled");
                Err(Error::Cancelled { step })
            }
            _ => Ok(()),
        }
    }

    /// Run `op` as `step`. A failure while the token has fired is reported as
    /// cancellation.
    fn run<T>(&self, step: RunStep, op: impl FnOnce() -> Result<T>) -> Result<T> {
        self.check(step)?;
        let (Some(cancel), Some(canceller)) = (self.cancel, self.canceller) else {
            return op();
        };

        let done = AtomicBool::new(false);
        let outcome = thread::scope(|scope| {
            scope.spawn(|| interrupt_when_cancelled(cancel, canceller, &done));
            let outcome = op();
            done.store(true, Ordering::Release);
            outcome
        });
        match outcome {
            Err(e) if cancel.is_cancelled() => {
                debug!(step = %step, error = %e, "step interrupted");
                Err(Error::Cancelled { step })
            }
            other => other,
        }
    }
}

/// Keep interrupting the engine once the token fires, until `done`. The engine
/// drops an interrupt that lands between two of its queries.
fn interrupt_when_cancelled(cancel: &CancelToken, canceller: &dyn Canceller, done: &AtomicBool) {
    while !done.load(Ordering::Acquire) {
        if cancel.is_cancelled() {
            canceller.cancel();
        }
        let wait = cancel.deadline().map_or(WATCH_INTERVAL, |deadline| {
            deadline
                .saturating_duration_since(Instant::now())
                .clamp(Duration::from_millis(1), WATCH_INTERVAL)
        });
        thread::sleep(wait);
    }
}

/// A session on one embedded engine database.
///
/// Each [`run_sql_on_record`](SqlRunner::run_sql_on_record) call ingests a
/// batch as a fresh table, runs the statements against it and drops it again.
pub struct SqlRunner {
    config: RunnerConfig,
    db: Option<Box<dyn Database>>,
    conn: Option<Box<dyn Connection>>,
    canceller: Option<Arc<dyn Canceller>>,
    calls: u64,
}

impl SqlRunner {
    /// Open the database named by `config` and one connection to it.
    pub fn new(config: RunnerConfig) -> Result<Self> {
        validate_table_name(&config.table_name).map_err(Error::InvalidArgument)?;

        let mut db = DriverManager::open(&config.database_options()).map_err(|source| {
            Error::Connection {
                context: "failed to create database",
                source,
            }
        })?;
        let (conn, canceller) = match connect(db.as_ref()) {
            Ok(pair) => pair,
            Err(source) => {
                if let Err(e) = db.close() {
                    warn!(error = %e, "failed to close database after connect failure");
                }
                return Err(Error::Connection {
                    context: "failed to open connection to database",
                    source,
                });
            }
        };

        info!(driver = %config.driver, path = %config.path, "sql runner opened");
        Ok(Self {
            config,
            db: Some(db),
            conn: Some(conn),
            canceller: Some(canceller),
            calls: 0,
        })
    }

    /// Runner on a fresh in-memory DuckDB database.
    pub fn in_memory() -> Result<Self> {
        Self::new(RunnerConfig::default())
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    fn next_table_name(&mut self) -> String {
        self.calls += 1;
        if self.config.unique_table_names {
            format!("{}_{}", self.config.table_name, self.calls)
        } else {
            self.config.table_name.clone()
        }
    }

    /// Ingest `record` as a table, run `sqls` against it and return the batches
    /// of the last statement.
    ///
    /// `{{.Table}}` in each statement resolves to the ingested table. Output of
    /// every statement but the last is discarded. The table is dropped before
    /// returning; if that fails the call fails and the results are discarded.
    pub fn run_sql_on_record<S: AsRef<str>>(
        &mut self,
        record: &RecordBatch,
        sqls: &[S],
    ) -> Result<Vec<RecordBatch>> {
        self.run(record, sqls, None)
    }

    /// Like [`run_sql_on_record`](SqlRunner::run_sql_on_record), stopping with
    /// [`Error::Cancelled`] once `cancel` fires. The token is checked before
    /// every step, and ingestion or a statement already running in the engine
    /// is interrupted. Cleanup always runs to completion.
    pub fn run_sql_on_record_with_cancel<S: AsRef<str>>(
        &mut self,
        record: &RecordBatch,
        sqls: &[S],
        cancel: &CancelToken,
    ) -> Result<Vec<RecordBatch>> {
        self.run(record, sqls, Some(cancel))
    }

    fn run<S: AsRef<str>>(
        &mut self,
        record: &RecordBatch,
        sqls: &[S],
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<RecordBatch>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if sqls.is_empty() {
            return Err(Error::InvalidArgument("no SQL statement provided".into()));
        }

        let table = self.next_table_name();
        let statements = sqls
            .iter()
            .enumerate()
            .map(|(index, sql)| {
                template::expand(sql.as_ref(), &table)
                    .map_err(|source| Error::Template { index, source })
            })
            .collect::<Result<Vec<_>>>()?;

        let conn = self.conn.as_deref().ok_or(Error::Closed)?;
        let watch = Watch {
            cancel,
            canceller: self.canceller.as_deref(),
        };

        watch.check(RunStep::Serializing)?;
        debug!(table = %table, step = %RunStep::Serializing, rows = record.num_rows());
        let payload = ipc::serialize_record_batch(record).map_err(Error::Serialization)?;

        debug!(table = %table, step = %RunStep::Importing, bytes = payload.len());
        watch.run(RunStep::Importing, || import_record(conn, payload, &table))?;

        let batches = match run_statements(conn, &statements, &watch) {
            Ok(batches) => batches,
            Err(e) => {
                if let Err(cleanup) = drop_table(conn, &table) {
                    warn!(
                        table = %table,
                        error = %cleanup.source,
                        "failed to drop table after aborted run"
                    );
                }
                return Err(e);
            }
        };

        debug!(table = %table, step = %RunStep::CleaningUp);
        drop_table(conn, &table).map_err(|failure| Error::Cleanup {
            table: table.clone(),
            source: failure.source,
        })?;

        debug!(
            table = %table,
            batches = batches.len(),
            rows = total_rows(&batches),
            "run complete"
        );
        Ok(batches)
    }

    /// Run one statement on the session and return its batches.
    ///
    /// No table is ingested, so a `{{.Table}}` placeholder is rejected with
    /// [`Error::Template`].
    pub fn run_sql(&mut self, sql: &str) -> Result<Vec<RecordBatch>> {
        let conn = self.conn.as_deref().ok_or(Error::Closed)?;
        let sql = template::expand_without_table(sql)
            .map_err(|source| Error::Template { index: 0, source })?;
        execute(conn, &sql, Output::Collect)
            .map(ExecOutcome::into_batches)
            .map_err(|failure| Error::Query {
                index: 0,
                context: failure.context,
                source: failure.source,
            })
    }

    /// Close the connection and the database. Safe to call more than once;
    /// failures are logged.
    pub fn close(&mut self) {
        let had_conn = self.conn.is_some();
        self.canceller = None;
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close() {
                warn!(error = %e, "failed to close connection");
            }
        }
        if let Some(mut db) = self.db.take() {
            if let Err(e) = db.close() {
                warn!(error = %e, "failed to close database");
            }
        }
        if had_conn {
            info!(calls = self.calls, "sql runner closed");
        }
    }
}

impl Drop for SqlRunner {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SqlRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlRunner")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .field("calls", &self.calls)
            .finish()
    }
}

fn connect(
    db: &dyn Database,
) -> std::result::Result<(Box<dyn Connection>, Arc<dyn Canceller>), DriverError> {
    let mut conn = db.connect()?;
    match conn.canceller() {
        Ok(canceller) => Ok((conn, canceller)),
        Err(e) => {
            if let Err(close) = conn.close() {
                warn!(error = %close, "failed to close connection after connect failure");
            }
            Err(e)
        }
    }
}

fn ingestion_error(
    table: &str,
    context: &'static str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> Error {
    Error::Ingestion {
        table: table.to_string(),
        context,
        source: Box::new(source),
    }
}

fn import_record(conn: &dyn Connection, payload: Vec<u8>, table: &str) -> Result<()> {
    let reader = ipc::open_stream_reader(payload)
        .map_err(|e| ingestion_error(table, "failed to create IPC reader", e))?;
    let mut stmt = conn
        .new_statement()
        .map_err(|e| ingestion_error(table, "failed to create new statement", e))?;

    let outcome = bind_and_ingest(stmt.as_mut(), Box::new(reader), table);
    close_statement(stmt.as_mut());
    outcome.map_err(|failure| ingestion_error(table, failure.context, failure.source))
}

fn bind_and_ingest(
    stmt: &mut dyn Statement,
    reader: Box<dyn RecordBatchReader + Send>,
    table: &str,
) -> std::result::Result<(), StepFailure> {
    stmt.set_option(OPTION_INGEST_MODE, INGEST_MODE_CREATE)
        .step("failed to set ingest mode")?;
    stmt.set_option(OPTION_INGEST_TARGET_TABLE, table)
        .step("failed to set ingest target table")?;
    stmt.bind_stream(reader).step("failed to bind stream")?;
    stmt.execute_update().step("failed to execute update")?;
    Ok(())
}

fn run_statements(
    conn: &dyn Connection,
    statements: &[String],
    watch: &Watch<'_>,
) -> Result<Vec<RecordBatch>> {
    let last = statements.len() - 1;
    let mut batches = Vec::new();
    for (index, sql) in statements.iter().enumerate() {
        let step = RunStep::Executing(index);
        let output = if index == last {
            Output::Collect
        } else {
            Output::Ignore
        };
        debug!(step = %step, ?output, sql = %sql);

        let outcome = watch.run(step, || {
            execute(conn, sql, output).map_err(|failure| Error::Query {
                index,
                context: failure.context,
                source: failure.source,
            })
        })?;
        debug!(step = %step, rows = outcome.row_count(), "statement finished");
        if let ExecOutcome::Rows(rows) = outcome {
            batches = rows;
        }
    }
    Ok(batches)
}

/// Run one statement. With [`Output::Ignore`] any result is released here.
fn execute(
    conn: &dyn Connection,
    sql: &str,
    output: Output,
) -> std::result::Result<ExecOutcome, StepFailure> {
    let mut stmt = conn
        .new_statement()
        .step("failed to create new statement")?;
    let outcome = execute_on(stmt.as_mut(), sql, output);
    close_statement(stmt.as_mut());
    outcome
}

fn execute_on(
    stmt: &mut dyn Statement,
    sql: &str,
    output: Output,
) -> std::result::Result<ExecOutcome, StepFailure> {
    stmt.set_sql_query(sql).step("failed to set SQL query")?;
    match output {
        Output::Ignore => {
            stmt.execute_update().step("failed to execute statement")?;
            Ok(ExecOutcome::Empty)
        }
        Output::Collect => {
            let stream = stmt.execute_query().step("failed to execute query")?;
            let batches = stream
                .collect_batches()
                .step("failed to read query results")?;
            Ok(ExecOutcome::Rows(batches))
        }
    }
}

fn drop_table(conn: &dyn Connection, table: &str) -> std::result::Result<(), StepFailure> {
    execute(conn, &format!("DROP TABLE {table}"), Output::Ignore).map(|_| ())
}

fn close_statement(stmt: &mut dyn Statement) {
    if let Err(e) = stmt.close() {
        warn!(error = %e, "failed to close statement");
    }
}

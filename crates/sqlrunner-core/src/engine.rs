//! DuckDB driver for the connectivity layer.
//!
//! Bound streams are loaded through DuckDB's Arrow table function, so any
//! Arrow type the engine can scan is accepted without a local type map. Query
//! results come back as Arrow batches straight from the engine.

use crate::adbc::{
    Canceller, Connection, Database, DatabaseOptions, Driver, DriverError, IngestMode,
    QueryStream, Result, Statement, Status, DUCKDB_DRIVER, IN_MEMORY_PATH, OPTION_INGEST_MODE,
    OPTION_INGEST_TARGET_TABLE,
};
use arrow_array::{RecordBatch, RecordBatchIterator, RecordBatchReader};
use arrow_schema::ArrowError;
use duckdb::vtab::arrow::ArrowVTab;
use duckdb::vtab::arrow_recordbatch_to_query_params;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// The Arrow scan emits each bound batch as a single engine vector.
const INGEST_CHUNK_ROWS: usize = 2048;

const ARROW_SCAN_FUNCTION: &str = "sqlrunner_arrow_scan";

type SharedConnection = Arc<Mutex<Option<duckdb::Connection>>>;
type Interrupt = Arc<dyn Fn() + Send + Sync>;

impl From<duckdb::Error> for DriverError {
    fn from(e: duckdb::Error) -> Self {
        DriverError::new(Status::Internal, e.to_string())
    }
}

fn closed(what: &str) -> DriverError {
    DriverError::invalid_state(format!("{what} is closed"))
}

/// Quote an identifier for DuckDB SQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_exists(conn: &duckdb::Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM information_schema.tables \
         WHERE table_schema = current_schema() AND table_name = ?",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Run `f` inside one engine transaction, rolling back if it fails.
fn in_transaction<T>(conn: &duckdb::Connection, f: impl FnOnce() -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN TRANSACTION")?;
    match f() {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            // A pending interrupt can abort the first attempt.
            if let Err(first) = conn.execute_batch("ROLLBACK") {
                debug!(error = %first, "rollback after failed ingest, retrying");
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %rollback, "rollback after failed ingest");
                }
            }
            Err(e)
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDriver;

impl Driver for DuckDbDriver {
    fn name(&self) -> &'static str {
        DUCKDB_DRIVER
    }

    fn new_database(&self, options: &DatabaseOptions) -> Result<Box<dyn Database>> {
        let path = options.path();
        let root = if path == IN_MEMORY_PATH {
            duckdb::Connection::open_in_memory()?
        } else {
            duckdb::Connection::open(path).map_err(|e| {
                DriverError::new(Status::Io, format!("failed to open '{path}': {e}"))
            })?
        };
        // Table functions live in the system catalog, so every clone sees it.
        root.register_table_function::<ArrowVTab>(ARROW_SCAN_FUNCTION)?;
        Ok(Box::new(DuckDbDatabase {
            root: Mutex::new(Some(root)),
        }))
    }
}

/// One engine instance. Connections are clones of the root connection and
/// share its catalog.
pub struct DuckDbDatabase {
    root: Mutex<Option<duckdb::Connection>>,
}

impl Database for DuckDbDatabase {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let root = self.root.lock();
        let root = root.as_ref().ok_or_else(|| closed("database"))?;
        let conn = root.try_clone()?;
        let handle = conn.interrupt_handle();
        Ok(Box::new(DuckDbConnection {
            interrupt: Arc::new(move || handle.interrupt()),
            interrupted: Arc::new(AtomicBool::new(false)),
            conn: Arc::new(Mutex::new(Some(conn))),
        }))
    }

    fn close(&mut self) -> Result<()> {
        match self.root.lock().take() {
            Some(root) => root.close().map_err(|(_, e)| DriverError::from(e)),
            None => Ok(()),
        }
    }
}

pub struct DuckDbConnection {
    conn: SharedConnection,
    interrupt: Interrupt,
    /// Set by the canceller, read back by the statement it aborted.
    interrupted: Arc<AtomicBool>,
}

impl Connection for DuckDbConnection {
    fn new_statement(&self) -> Result<Box<dyn Statement>> {
        if self.conn.lock().is_none() {
            return Err(closed("connection"));
        }
        Ok(Box::new(DuckDbStatement {
            conn: Arc::clone(&self.conn),
            interrupted: Arc::clone(&self.interrupted),
            sql: None,
            target_table: None,
            mode: IngestMode::default(),
            bound: None,
        }))
    }

    fn canceller(&self) -> Result<Arc<dyn Canceller>> {
        if self.conn.lock().is_none() {
            return Err(closed("connection"));
        }
        Ok(Arc::new(DuckDbCanceller {
            interrupt: Arc::clone(&self.interrupt),
            interrupted: Arc::clone(&self.interrupted),
        }))
    }

    fn close(&mut self) -> Result<()> {
        match self.conn.lock().take() {
            Some(conn) => conn.close().map_err(|(_, e)| DriverError::from(e)),
            None => Ok(()),
        }
    }
}

struct DuckDbCanceller {
    interrupt: Interrupt,
    interrupted: Arc<AtomicBool>,
}

impl Canceller for DuckDbCanceller {
    fn cancel(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        (self.interrupt)();
    }
}

pub struct DuckDbStatement {
    conn: SharedConnection,
    interrupted: Arc<AtomicBool>,
    sql: Option<String>,
    target_table: Option<String>,
    mode: IngestMode,
    bound: Option<Box<dyn RecordBatchReader + Send>>,
}

impl DuckDbStatement {
    fn ingest(
        &self,
        conn: &duckdb::Connection,
        table: &str,
        reader: Box<dyn RecordBatchReader + Send>,
    ) -> Result<i64> {
        let target = quote_identifier(table);
        let create = match (self.mode, table_exists(conn, table)?) {
            (IngestMode::Create, true) => {
                return Err(DriverError::new(
                    Status::AlreadyExists,
                    format!("table '{table}' already exists"),
                ))
            }
            (IngestMode::Append, false) => {
                return Err(DriverError::new(
                    Status::NotFound,
                    format!("table '{table}' does not exist"),
                ))
            }
            (IngestMode::Create | IngestMode::CreateAppend, false) => Some("CREATE TABLE"),
            (IngestMode::Replace, _) => Some("CREATE OR REPLACE TABLE"),
            (IngestMode::Append | IngestMode::CreateAppend, true) => None,
        };

        if let Some(create) = create {
            // An empty batch carries the column types into the new table.
            let empty = RecordBatch::new_empty(reader.schema());
            conn.execute(
                &format!("{create} {target} AS SELECT * FROM {ARROW_SCAN_FUNCTION}(?, ?)"),
                arrow_recordbatch_to_query_params(empty),
            )?;
        }

        let mut insert = conn.prepare(&format!(
            "INSERT INTO {target} SELECT * FROM {ARROW_SCAN_FUNCTION}(?, ?)"
        ))?;
        let mut rows = 0usize;
        for batch in reader {
            for chunk in chunk_batch(&batch?) {
                rows += chunk.num_rows();
                insert.execute(arrow_recordbatch_to_query_params(chunk))?;
            }
        }
        debug!(table, rows, mode = self.mode.as_option_value(), "ingested stream");
        Ok(rows as i64)
    }

    fn query(&self, conn: &duckdb::Connection, sql: &str) -> Result<QueryStream> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_arrow([])?;
        let schema = rows.get_schema();
        let batches: Vec<RecordBatch> = rows.collect();
        // The Arrow iterator stops without an error when a fetch is interrupted.
        if self.interrupted.swap(false, Ordering::SeqCst) {
            return Err(DriverError::new(
                Status::Cancelled,
                "interrupted while reading results",
            ));
        }
        let reader =
            RecordBatchIterator::new(batches.into_iter().map(Ok::<_, ArrowError>), schema);
        Ok(QueryStream::new(Box::new(reader)))
    }

    /// Report a failure caused by the canceller as [`Status::Cancelled`].
    fn interrupted_or(&self, e: DriverError) -> DriverError {
        if self.interrupted.swap(false, Ordering::SeqCst) {
            DriverError::new(Status::Cancelled, format!("interrupted: {}", e.message))
        } else {
            e
        }
    }
}

/// Slices of at most [`INGEST_CHUNK_ROWS`] rows; an empty batch yields none.
fn chunk_batch(batch: &RecordBatch) -> Vec<RecordBatch> {
    let rows = batch.num_rows();
    (0..rows)
        .step_by(INGEST_CHUNK_ROWS)
        .map(|offset| batch.slice(offset, INGEST_CHUNK_ROWS.min(rows - offset)))
        .collect()
}

impl Statement for DuckDbStatement {
    fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            OPTION_INGEST_TARGET_TABLE => {
                if value.is_empty() {
                    return Err(DriverError::invalid_argument("target table cannot be empty"));
                }
                self.target_table = Some(value.to_string());
            }
            OPTION_INGEST_MODE => self.mode = IngestMode::parse(value)?,
            other => {
                return Err(DriverError::new(
                    Status::NotImplemented,
                    format!("unsupported statement option '{other}'"),
                ))
            }
        }
        Ok(())
    }

    fn set_sql_query(&mut self, sql: &str) -> Result<()> {
        self.sql = Some(sql.to_string());
        Ok(())
    }

    fn bind_stream(&mut self, reader: Box<dyn RecordBatchReader + Send>) -> Result<()> {
        self.bound = Some(reader);
        Ok(())
    }

    fn execute_query(&mut self) -> Result<QueryStream> {
        let sql = self
            .sql
            .as_deref()
            .ok_or_else(|| DriverError::invalid_state("no SQL query set"))?;
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or_else(|| closed("connection"))?;

        self.interrupted.store(false, Ordering::SeqCst);
        self.query(conn, sql).map_err(|e| self.interrupted_or(e))
    }

    fn execute_update(&mut self) -> Result<Option<i64>> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or_else(|| closed("connection"))?;
        self.interrupted.store(false, Ordering::SeqCst);

        if let Some(table) = self.target_table.clone() {
            let reader = self
                .bound
                .take()
                .ok_or_else(|| DriverError::invalid_state("no stream bound for ingestion"))?;
            return in_transaction(conn, || self.ingest(conn, &table, reader))
                .map(Some)
                .map_err(|e| self.interrupted_or(e));
        }

        let sql = self
            .sql
            .as_deref()
            .ok_or_else(|| DriverError::invalid_state("no SQL query or ingest target set"))?;
        conn.execute_batch(sql)
            .map_err(|e| self.interrupted_or(e.into()))?;
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        self.bound = None;
        self.sql = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adbc::{
        DriverManager, INGEST_MODE_APPEND, INGEST_MODE_CREATE, INGEST_MODE_CREATE_APPEND,
        INGEST_MODE_REPLACE,
    };
    use crate::config::RunnerConfig;
    use arrow_array::types::Int32Type;
    use arrow_array::{
        Array, Date32Array, Float64Array, Int32Array, Int64Array, ListArray, StringArray,
    };
    use arrow_schema::{DataType, Field, Schema};
    use std::thread;
    use std::time::Duration;

    fn open_connection() -> (Box<dyn Database>, Box<dyn Connection>) {
        let db = DriverManager::open(&RunnerConfig::default().database_options()).unwrap();
        let conn = db.connect().unwrap();
        (db, conn)
    }

    /// `name` is null on every third row.
    fn make_test_batch(ids: Vec<i32>) -> RecordBatch {
        let n = ids.len();
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let names: Vec<Option<String>> = (0..n)
            .map(|i| (i % 3 != 2).then(|| format!("n{i}")))
            .collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(ids)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .unwrap()
    }

    fn ingest(
        conn: &dyn Connection,
        table: &str,
        mode: &str,
        batch: RecordBatch,
    ) -> Result<Option<i64>> {
        let mut stmt = conn.new_statement()?;
        stmt.set_option(OPTION_INGEST_MODE, mode)?;
        stmt.set_option(OPTION_INGEST_TARGET_TABLE, table)?;
        let schema = batch.schema();
        stmt.bind_stream(Box::new(RecordBatchIterator::new(vec![Ok(batch)], schema)))?;
        stmt.execute_update()
    }

    fn query(conn: &dyn Connection, sql: &str) -> Result<Vec<RecordBatch>> {
        let mut stmt = conn.new_statement()?;
        stmt.set_sql_query(sql)?;
        stmt.execute_query()?.collect_batches()
    }

    fn count(conn: &dyn Connection, table: &str) -> i64 {
        let sql = format!("SELECT count(*) FROM {}", quote_identifier(table));
        let batches = query(conn, &sql).unwrap();
        batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .value(0)
    }

    fn strings(batches: &[RecordBatch]) -> Vec<String> {
        batches
            .iter()
            .flat_map(|b| {
                let col = b.column(0).as_any().downcast_ref::<StringArray>().unwrap();
                (0..col.len())
                    .map(|i| col.value(i).to_string())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_identifier("source_table"), "\"source_table\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn chunking_splits_large_batches() {
        let sizes: Vec<usize> = chunk_batch(&make_test_batch((0..5000).collect()))
            .iter()
            .map(|b| b.num_rows())
            .collect();
        assert_eq!(sizes, vec![2048, 2048, 904]);
        assert!(chunk_batch(&make_test_batch(vec![])).is_empty());
    }

    #[test]
    fn ingest_create_then_query() {
        let (_db, conn) = open_connection();
        let rows = ingest(
            conn.as_ref(),
            "t",
            INGEST_MODE_CREATE,
            make_test_batch(vec![3, 1, 2]),
        )
        .unwrap();
        assert_eq!(rows, Some(3));

        let batches = query(conn.as_ref(), "SELECT id, name FROM t ORDER BY id").unwrap();
        assert_eq!(batches[0].num_columns(), 2);
        let ids: Vec<i32> = batches
            .iter()
            .flat_map(|b| {
                b.column(0)
                    .as_any()
                    .downcast_ref::<Int32Array>()
                    .unwrap()
                    .values()
                    .to_vec()
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let nulls = query(conn.as_ref(), "SELECT count(*) FROM t WHERE name IS NULL").unwrap();
        let col = nulls[0].column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(col.value(0), 1);
    }

    #[test]
    fn empty_stream_creates_typed_table() {
        let (_db, conn) = open_connection();
        let rows = ingest(conn.as_ref(), "t", INGEST_MODE_CREATE, make_test_batch(vec![])).unwrap();
        assert_eq!(rows, Some(0));
        assert_eq!(count(conn.as_ref(), "t"), 0);

        let types = query(
            conn.as_ref(),
            "SELECT data_type FROM information_schema.columns \
             WHERE table_name = 't' ORDER BY ordinal_position",
        )
        .unwrap();
        assert_eq!(strings(&types), vec!["INTEGER", "VARCHAR"]);
    }

    #[test]
    fn nested_and_temporal_types_are_ingested() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("day", DataType::Date32, false),
            Field::new(
                "tags",
                DataType::List(Arc::new(Field::new("item", DataType::Int32, true))),
                true,
            ),
        ]));
        let tags = ListArray::from_iter_primitive::<Int32Type, _, _>(vec![
            Some(vec![Some(1), Some(2)]),
            None,
        ]);
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Date32Array::from(vec![19_000, 19_001])),
                Arc::new(tags),
            ],
        )
        .unwrap();

        let (_db, conn) = open_connection();
        ingest(conn.as_ref(), "t", INGEST_MODE_CREATE, batch).unwrap();
        let batches = query(conn.as_ref(), "SELECT len(tags) FROM t ORDER BY day").unwrap();
        let lens = batches[0].column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(lens.value(0), 2);
        assert!(lens.is_null(1));
    }

    #[test]
    fn create_on_existing_table_is_already_exists() {
        let (_db, conn) = open_connection();
        ingest(conn.as_ref(), "t", INGEST_MODE_CREATE, make_test_batch(vec![1])).unwrap();
        let err = ingest(conn.as_ref(), "t", INGEST_MODE_CREATE, make_test_batch(vec![2]))
            .unwrap_err();
        assert_eq!(err.status, Status::AlreadyExists);
        assert_eq!(count(conn.as_ref(), "t"), 1);
    }

    #[test]
    fn append_to_missing_table_is_not_found() {
        let (_db, conn) = open_connection();
        let batch = make_test_batch(vec![1]);
        let err = ingest(conn.as_ref(), "missing", INGEST_MODE_APPEND, batch).unwrap_err();
        assert_eq!(err.status, Status::NotFound);
    }

    #[test]
    fn append_replace_and_create_append_modes() {
        let (_db, conn) = open_connection();
        let mode = INGEST_MODE_CREATE_APPEND;
        ingest(conn.as_ref(), "t", mode, make_test_batch(vec![1, 2])).unwrap();
        ingest(conn.as_ref(), "t", mode, make_test_batch(vec![3])).unwrap();
        assert_eq!(count(conn.as_ref(), "t"), 3);

        ingest(conn.as_ref(), "t", INGEST_MODE_APPEND, make_test_batch(vec![4])).unwrap();
        assert_eq!(count(conn.as_ref(), "t"), 4);

        ingest(conn.as_ref(), "t", INGEST_MODE_REPLACE, make_test_batch(vec![5])).unwrap();
        assert_eq!(count(conn.as_ref(), "t"), 1);
    }

    #[test]
    fn large_stream_is_ingested_in_full() {
        let (_db, conn) = open_connection();
        let batch = make_test_batch((0..5000).collect());
        ingest(conn.as_ref(), "big", INGEST_MODE_CREATE, batch).unwrap();
        assert_eq!(count(conn.as_ref(), "big"), 5000);
    }

    #[test]
    fn update_without_query_or_target_is_invalid_state() {
        let (_db, conn) = open_connection();
        let mut stmt = conn.new_statement().unwrap();
        assert_eq!(stmt.execute_update().unwrap_err().status, Status::InvalidState);
        assert_eq!(stmt.execute_query().unwrap_err().status, Status::InvalidState);
    }

    #[test]
    fn unknown_option_is_not_implemented() {
        let (_db, conn) = open_connection();
        let mut stmt = conn.new_statement().unwrap();
        let err = stmt.set_option("adbc.ingest.temporary", "true").unwrap_err();
        assert_eq!(err.status, Status::NotImplemented);
    }

    #[test]
    fn statements_fail_after_connection_close() {
        let (mut db, mut conn) = open_connection();
        let mut stmt = conn.new_statement().unwrap();
        stmt.set_sql_query("SELECT 1").unwrap();
        conn.close().unwrap();
        conn.close().unwrap();

        assert_eq!(stmt.execute_query().unwrap_err().status, Status::InvalidState);
        assert_eq!(conn.new_statement().err().unwrap().status, Status::InvalidState);
        assert_eq!(conn.canceller().err().unwrap().status, Status::InvalidState);

        db.close().unwrap();
        assert_eq!(db.connect().err().unwrap().status, Status::InvalidState);
    }

    #[test]
    fn connections_share_the_database() {
        let (db, conn) = open_connection();
        let other = db.connect().unwrap();
        let batch = make_test_batch(vec![1, 2]);
        ingest(conn.as_ref(), "shared", INGEST_MODE_CREATE, batch).unwrap();
        assert_eq!(count(other.as_ref(), "shared"), 2);
    }

    #[test]
    fn query_results_keep_nulls() {
        let (_db, conn) = open_connection();
        let batches =
            query(conn.as_ref(), "SELECT 1.5::DOUBLE AS x UNION ALL SELECT NULL").unwrap();
        let values: Vec<Option<f64>> = batches
            .iter()
            .flat_map(|b| {
                let col = b.column(0).as_any().downcast_ref::<Float64Array>().unwrap();
                (0..col.len())
                    .map(|i| col.is_valid(i).then(|| col.value(i)))
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&Some(1.5)));
        assert!(values.contains(&None));
    }

    #[test]
    fn canceller_interrupts_running_query() {
        let (_db, conn) = open_connection();
        let canceller = conn.canceller().unwrap();
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            canceller.cancel();
        });

        let err = query(
            conn.as_ref(),
            "SELECT sum(a.range * b.range) FROM range(1000000) a, range(1000000) b",
        )
        .unwrap_err();
        interrupter.join().unwrap();
        assert_eq!(err.status, Status::Cancelled);

        // The connection stays usable after an interrupt.
        assert_eq!(query(conn.as_ref(), "SELECT 1").unwrap()[0].num_rows(), 1);
    }
}

// ABOUTME: SQLite backend - opens database files and runs bounded queries through rusqlite
// ABOUTME: Table metadata comes from pragma_table_info; result rows stream from a reader thread

use anyhow::{bail, Context, Result};
use chrono::Timelike;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};

use super::{ColumnDescription, Connector, RowSource, SourceConnection, TableDescription};
use crate::config::{properties, SourceConfig};
use crate::error::ExtractorError;
use crate::types::{SqlParam, SqlValue, Statement};

const FILE_EXTENSIONS: [&str; 3] = [".db", ".sqlite", ".sqlite3"];

/// Rows read ahead of the consumer before the reader thread waits.
const ROW_CHANNEL_CAPACITY: usize = 256;

/// Opens connections to one SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: String,
}

impl SqliteConnector {
    /// Whether a normalized connection string names a SQLite database.
    pub fn accepts(normalized: &str) -> bool {
        normalized.starts_with("sqlite:")
            || FILE_EXTENSIONS.iter().any(|ext| normalized.ends_with(ext))
    }

    /// Resolve the database path without opening it.
    pub fn from_config(config: &SourceConfig) -> crate::Result<Self> {
        let path = database_path(&config.connection_string);
        if path.is_empty() {
            return Err(ExtractorError::configuration(
                properties::CONNECTION_STRING,
                "SQLite connection string has no database path",
            ));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Strip an optional `jdbc:` and `sqlite:` / `sqlite://` prefix, keeping the
/// path's own case.
fn database_path(connection_string: &str) -> String {
    let mut rest = connection_string.trim();
    for prefix in ["jdbc:", "sqlite://", "sqlite:"] {
        if rest
            .get(..prefix.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(prefix))
        {
            rest = &rest[prefix.len()..];
        }
    }
    rest.to_string()
}

impl Connector for SqliteConnector {
    fn connect(&self) -> Result<Box<dyn SourceConnection>> {
        tracing::debug!("Opening SQLite database: {}", self.path);
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open SQLite database '{}'", self.path))?;
        Ok(Box::new(SqliteConnection::new(conn)))
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// One SQLite connection. Queries run on a reader thread that holds the
/// connection until its result is exhausted or dropped.
pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConnection {
    /// Wrap an already open connection, e.g. a shared in-memory database.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|e| e.into_inner())
}

fn to_sql_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Int(i),
        Value::Real(f) => SqlValue::Float(f),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Bytes(b),
    }
}

/// SQLite has no timestamp storage class; times are compared as
/// `YYYY-MM-DD HH:MM:SS[.fff]` text.
fn to_bound_value(param: &SqlParam) -> Value {
    match param {
        SqlParam::Int(v) => Value::Integer(*v),
        SqlParam::Timestamp(ts) => {
            let text = if ts.nanosecond() == 0 {
                ts.format("%Y-%m-%d %H:%M:%S").to_string()
            } else {
                ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()
            };
            Value::Text(text)
        }
    }
}

impl SourceConnection for SqliteConnection {
    fn describe_table(
        &mut self,
        _schema: Option<&str>,
        table: &str,
    ) -> Result<Option<TableDescription>> {
        let conn = lock(&self.conn);
        let name: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name = ?1 COLLATE NOCASE",
                [table],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })
            .with_context(|| format!("Failed to look up table '{}'", table))?;
        let Some(name) = name else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare("SELECT name, type, dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid")
            .context("Failed to prepare table_info query")?;
        let rows = stmt
            .query_map([&name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .with_context(|| format!("Failed to read columns of '{}'", name))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to read columns of '{}'", name))?;

        // Only a lone INTEGER PRIMARY KEY aliases the rowid.
        let pk_count = rows.iter().filter(|(_, _, _, pk)| *pk > 0).count();
        let columns = rows
            .into_iter()
            .map(|(column, type_name, default_value, pk)| ColumnDescription {
                auto_increment: Some(
                    pk_count == 1 && pk > 0 && type_name.eq_ignore_ascii_case("INTEGER"),
                ),
                name: column,
                type_name,
                default_value,
            })
            .collect();

        Ok(Some(TableDescription {
            catalog: None,
            schema: None,
            name,
            columns,
        }))
    }

    fn query(&mut self, statement: &Statement) -> Result<Box<dyn RowSource>> {
        tracing::trace!("SQLite query: {}", statement.sql);
        let (columns_tx, columns_rx) = oneshot::channel();
        let (rows_tx, rows_rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let conn = Arc::clone(&self.conn);
        let sql = statement.sql.clone();
        let params: Vec<Value> = statement.params.iter().map(to_bound_value).collect();
        let reader = thread::Builder::new()
            .name("sqlite-reader".to_string())
            .spawn(move || stream_rows(&conn, &sql, params, columns_tx, rows_tx))
            .context("Failed to start SQLite reader thread")?;

        let columns = columns_rx
            .blocking_recv()
            .context("SQLite reader thread stopped before running the query")??;
        Ok(Box::new(SqliteRows {
            columns,
            rows: rows_rx,
            reader: Some(reader),
        }))
    }
}

/// Runs on the reader thread: sends the column names once the statement is
/// prepared, then one message per row. Stops at the first error or once the
/// receiving side is gone.
fn stream_rows(
    conn: &Mutex<Connection>,
    sql: &str,
    params: Vec<Value>,
    columns_tx: oneshot::Sender<Result<Vec<String>>>,
    rows_tx: mpsc::Sender<Result<Vec<SqlValue>>>,
) {
    let conn = lock(conn);
    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => {
            let err = anyhow::Error::new(e).context(format!("Failed to prepare query: {}", sql));
            let _ = columns_tx.send(Err(err));
            return;
        }
    };
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();
    let mut rows = match stmt.query(params_from_iter(params)) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = columns_tx.send(Err(anyhow::Error::new(e).context("Failed to execute query")));
            return;
        }
    };
    if columns_tx.send(Ok(columns)).is_err() {
        return;
    }

    loop {
        let next = match rows.next() {
            Ok(Some(row)) => (0..width)
                .map(|i| row.get::<_, Value>(i).map(to_sql_value))
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read query results"),
            Ok(None) => return,
            Err(e) => Err(anyhow::Error::new(e).context("Failed to read query results")),
        };
        let failed = next.is_err();
        if rows_tx.blocking_send(next).is_err() {
            tracing::trace!("SQLite result dropped before it was exhausted");
            return;
        }
        if failed {
            return;
        }
    }
}

/// Receiving side of a streamed SQLite result. Dropping it stops the reader
/// thread at its next row.
struct SqliteRows {
    columns: Vec<String>,
    rows: mpsc::Receiver<Result<Vec<SqlValue>>>,
    reader: Option<JoinHandle<()>>,
}

impl RowSource for SqliteRows {
    fn column_names(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        match self.rows.blocking_recv() {
            Some(row) => row.map(Some),
            None => {
                // A panicking reader hangs up like a finished one.
                if let Some(reader) = self.reader.take() {
                    if reader.join().is_err() {
                        bail!("SQLite reader thread panicked");
                    }
                }
                Ok(None)
            }
        }
    }
}

// ABOUTME: Database connection seam - connections, row sources and connectors
// ABOUTME: Backends implement these traits; the engine never talks to a driver directly

pub mod pool;
pub mod postgres;
pub mod sqlite;

use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::{properties, SourceConfig};
use crate::error::ExtractorError;
use crate::types::{SqlValue, Statement};
use crate::utils::normalize_connection_string;

pub use pool::{ConnectionPool, PoolConfig, PooledConnection};

/// Catalog facts about one column, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    /// Vendor type name, e.g. `timestamp without time zone` or `VARCHAR2(40)`.
    pub type_name: String,
    /// Column default expression, used by dialects that detect sequences from it.
    pub default_value: Option<String>,
    /// Driver-reported auto-increment flag, when the backend knows it.
    pub auto_increment: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<ColumnDescription>,
}

/// A forward-only stream of rows produced by one query.
///
/// Row sources do not borrow their connection; the owner keeps the connection
/// alive for as long as the rows are being read.
pub trait RowSource: Send {
    fn column_names(&self) -> &[String];

    /// Advance to the next row. `Ok(None)` once the result is exhausted.
    fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>>;
}

/// One live database connection.
pub trait SourceConnection: Send {
    /// Look up a table by name. `Ok(None)` when it does not exist.
    fn describe_table(&mut self, schema: Option<&str>, table: &str)
        -> Result<Option<TableDescription>>;

    fn query(&mut self, statement: &Statement) -> Result<Box<dyn RowSource>>;

    /// Run a statement and return the first column of its first row, or
    /// `SqlValue::Null` when it returns no rows.
    fn query_value(&mut self, statement: &Statement) -> Result<SqlValue> {
        let mut rows = self.query(statement)?;
        Ok(rows
            .next_row()?
            .and_then(|row| row.into_iter().next())
            .unwrap_or(SqlValue::Null))
    }
}

/// Opens new connections for a pool.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn SourceConnection>>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Rows already held in memory.
#[derive(Debug, Clone, Default)]
pub struct BufferedRows {
    columns: Vec<String>,
    rows: VecDeque<Vec<SqlValue>>,
}

impl BufferedRows {
    pub fn new(columns: Vec<String>, rows: impl IntoIterator<Item = Vec<SqlValue>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl RowSource for BufferedRows {
    fn column_names(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        Ok(self.rows.pop_front())
    }
}

/// Pick the backend able to open `config`'s connection string.
pub fn connector_for(config: &SourceConfig) -> crate::Result<Arc<dyn Connector>> {
    let normalized = normalize_connection_string(&config.connection_string);
    if sqlite::SqliteConnector::accepts(&normalized) {
        return Ok(Arc::new(sqlite::SqliteConnector::from_config(config)?));
    }
    if postgres::PostgresConnector::accepts(&normalized) {
        return Ok(Arc::new(postgres::PostgresConnector::from_config(config)?));
    }
    Err(ExtractorError::configuration(
        properties::CONNECTION_STRING,
        format!(
            "No suitable driver found for '{}'",
            crate::utils::sanitize_url(&config.connection_string)
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_rows_yield_in_order() {
        let mut rows = BufferedRows::new(
            vec!["id".to_string()],
            vec![vec![SqlValue::Int(1)], vec![SqlValue::Int(2)]],
        );
        assert_eq!(rows.column_names(), ["id".to_string()]);
        assert_eq!(rows.next_row().unwrap(), Some(vec![SqlValue::Int(1)]));
        assert_eq!(rows.remaining(), 1);
        assert_eq!(rows.next_row().unwrap(), Some(vec![SqlValue::Int(2)]));
        assert_eq!(rows.next_row().unwrap(), None);
    }

    #[test]
    fn test_connector_for_rejects_unknown_scheme() {
        let config = SourceConfig::new("jdbc:wrong://host", "orders");
        let err = connector_for(&config).err().unwrap();
        assert_eq!(
            err.property_errors()[0].property,
            properties::CONNECTION_STRING
        );
    }

    #[test]
    fn test_connector_for_picks_backend() {
        let config = SourceConfig::new("sqlite::memory:", "orders");
        assert_eq!(connector_for(&config).unwrap().name(), "sqlite");

        let config = SourceConfig::new("postgresql://user@localhost/db", "orders");
        assert_eq!(connector_for(&config).unwrap().name(), "postgres");
    }
}

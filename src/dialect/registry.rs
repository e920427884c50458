// ABOUTME: Dialect registry - picks the dialect for a connection string
// ABOUTME: First registered match wins; unknown strings fall back to the generic dialect

use std::sync::Arc;

use super::generic::GenericDialect;
use super::mysql::MySqlDialect;
use super::oracle::OracleDialect;
use super::postgres::{PostgresDialect, RedshiftDialect};
use super::snowflake::SnowflakeDialect;
use super::sqlite::SqliteDialect;
use super::sqlserver::SqlServerDialect;
use super::QueryDialect;
use crate::utils::normalize_connection_string;

#[derive(Debug, Clone)]
pub struct DialectRegistry {
    dialects: Vec<Arc<dyn QueryDialect>>,
    fallback: Arc<dyn QueryDialect>,
}

impl Default for DialectRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl DialectRegistry {
    /// An empty registry that resolves everything to the generic dialect.
    pub fn empty() -> Self {
        Self {
            dialects: Vec::new(),
            fallback: Arc::new(GenericDialect),
        }
    }

    /// Every built-in vendor dialect.
    pub fn standard() -> Self {
        Self::empty()
            .register(SqlServerDialect)
            .register(OracleDialect)
            .register(RedshiftDialect)
            .register(PostgresDialect)
            .register(SnowflakeDialect)
            .register(MySqlDialect)
            .register(SqliteDialect)
    }

    /// Add a dialect. Registered dialects are consulted in order.
    pub fn register(mut self, dialect: impl QueryDialect + 'static) -> Self {
        self.dialects.push(Arc::new(dialect));
        self
    }

    pub fn for_connection(&self, connection_string: &str) -> Arc<dyn QueryDialect> {
        let normalized = normalize_connection_string(connection_string);
        let dialect = self
            .dialects
            .iter()
            .find(|d| d.accepts(&normalized))
            .unwrap_or(&self.fallback);
        tracing::debug!("Using {} dialect", dialect.name());
        Arc::clone(dialect)
    }
}

// ABOUTME: SQLite dialect
// ABOUTME: julianday based UTC offset and DATETIME declared types treated as timestamps

use chrono::{DateTime, Utc};

use super::{queries, QueryDialect};
use crate::catalog::TableMetadata;
use crate::error::Result;
use crate::types::{SqlType, Statement};
use crate::watermark::Watermark;

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl QueryDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn accepts(&self, normalized_connection_string: &str) -> bool {
        crate::connection::sqlite::SqliteConnector::accepts(normalized_connection_string)
    }

    fn utc_offset_query(&self) -> &'static str {
        "SELECT CAST(ROUND((julianday('now', 'localtime') - julianday('now')) * 86400) AS INTEGER)"
    }

    fn current_time_query(&self) -> &'static str {
        "SELECT datetime('now', 'localtime')"
    }

    fn is_time_type(&self, sql_type: &SqlType) -> bool {
        sql_type.is_standard_time_type()
            || matches!(sql_type, SqlType::Vendor(name) if name == "DATETIME")
    }

    fn query_by_inc(
        &self,
        table: &TableMetadata,
        watermark: &Watermark,
        limit: Option<u64>,
    ) -> Result<Statement> {
        queries::query_by_inc(self, table, watermark, limit)
    }

    fn query_by_time(
        &self,
        table: &TableMetadata,
        watermark: &Watermark,
        limit: Option<u64>,
    ) -> Result<Statement> {
        queries::query_by_time(self, table, watermark, limit)
    }

    fn query_by_inc_and_time(
        &self,
        table: &TableMetadata,
        watermark: &Watermark,
        limit: Option<u64>,
    ) -> Result<Statement> {
        queries::query_by_inc_and_time(self, table, watermark, limit)
    }

    fn query_full_table(
        &self,
        table: &TableMetadata,
        _watermark: &Watermark,
        limit: Option<u64>,
    ) -> Result<Statement> {
        queries::query_full_table(self, table, limit)
    }

    fn task_info_by_inc(&self, table: &TableMetadata, previous: &Watermark) -> Result<Statement> {
        queries::task_info_by_inc(self, table, previous)
    }

    fn task_info_by_time(
        &self,
        table: &TableMetadata,
        previous: &Watermark,
        max_time: DateTime<Utc>,
    ) -> Result<Statement> {
        queries::task_info_by_time(self, table, previous, max_time)
    }

    fn task_info_by_inc_and_time(
        &self,
        table: &TableMetadata,
        previous: &Watermark,
        max_time: DateTime<Utc>,
    ) -> Result<Statement> {
        queries::task_info_by_inc_and_time(self, table, previous, max_time)
    }

    fn query_min_time(&self, table: &TableMetadata) -> Result<Statement> {
        queries::query_min_time(self, table)
    }
}

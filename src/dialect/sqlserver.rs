// ABOUTME: Microsoft SQL Server dialect
// ABOUTME: TOP n limits, DATEDIFF based UTC offset and the DATETIME family of time types

use chrono::{DateTime, Utc};

use super::{queries, LimitStyle, QueryDialect};
use crate::catalog::TableMetadata;
use crate::error::Result;
use crate::types::{SqlType, Statement};
use crate::watermark::Watermark;

#[derive(Debug, Default, Clone, Copy)]
pub struct SqlServerDialect;

const TIME_TYPES: [&str; 4] = ["DATETIME", "DATETIME2", "SMALLDATETIME", "DATETIMEOFFSET"];

impl QueryDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn accepts(&self, normalized_connection_string: &str) -> bool {
        normalized_connection_string.starts_with("sqlserver:")
    }

    /// Seconds local time is ahead of UTC.
    fn utc_offset_query(&self) -> &'static str {
        "SELECT DATEDIFF(second, GETUTCDATE(), GETDATE())"
    }

    fn is_time_type(&self, sql_type: &SqlType) -> bool {
        sql_type.is_standard_time_type()
            || matches!(sql_type, SqlType::Vendor(name) if TIME_TYPES.contains(&name.as_str()))
    }

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::Top
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

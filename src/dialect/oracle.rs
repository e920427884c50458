// ABOUTME: Oracle dialect
// ABOUTME: ROWNUM limits, uppercase identifiers, identity sequences and hex-encoded BLOBs

use chrono::{DateTime, Utc};

use super::{default_value_getter, queries, LimitStyle, QueryDialect};
use crate::catalog::TableMetadata;
use crate::connection::ColumnDescription;
use crate::error::Result;
use crate::types::{SqlType, SqlTypeCategory, Statement, ValueGetter};
use crate::watermark::Watermark;

#[derive(Debug, Default, Clone, Copy)]
pub struct OracleDialect;

impl QueryDialect for OracleDialect {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn accepts(&self, normalized_connection_string: &str) -> bool {
        normalized_connection_string.starts_with("oracle:")
    }

    fn utc_offset_query(&self) -> &'static str {
        "SELECT EXTRACT(DAY FROM (SYSTIMESTAMP - SYS_EXTRACT_UTC(SYSTIMESTAMP)) * 24 * 60 * 60) FROM DUAL"
    }

    fn current_time_query(&self) -> &'static str {
        "SELECT CURRENT_TIMESTAMP FROM DUAL"
    }

    /// Identity columns default to `"SCHEMA"."ISEQ$$_12345".nextval`.
    fn is_auto_increment_column(&self, column: &ColumnDescription) -> bool {
        column.auto_increment.unwrap_or(false)
            || column.default_value.as_deref().is_some_and(|d| {
                let d = d.trim().to_uppercase();
                d.contains("ISEQ$$") && d.ends_with(".NEXTVAL")
            })
    }

    fn requires_uppercase_names(&self) -> bool {
        true
    }

    fn is_time_type(&self, sql_type: &SqlType) -> bool {
        sql_type.is_standard_time_type()
            || matches!(sql_type, SqlType::Vendor(name) if name == "TIMESTAMP WITH LOCAL TIME ZONE")
    }

    fn value_getter(&self, category: SqlTypeCategory, keep_types: bool) -> ValueGetter {
        match category {
            SqlTypeCategory::Binary if keep_types => ValueGetter::Hex,
            _ => default_value_getter(category, keep_types),
        }
    }

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::Rownum
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

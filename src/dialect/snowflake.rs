// ABOUTME: Snowflake dialect
// ABOUTME: Uppercase identifiers and the TIMESTAMP_NTZ/LTZ/TZ time types

use chrono::{DateTime, Utc};

use super::{queries, QueryDialect};
use crate::catalog::TableMetadata;
use crate::error::Result;
use crate::types::{SqlType, Statement};
use crate::watermark::Watermark;

#[derive(Debug, Default, Clone, Copy)]
pub struct SnowflakeDialect;

const TIME_TYPES: [&str; 4] = ["TIMESTAMP_NTZ", "TIMESTAMP_LTZ", "TIMESTAMP_TZ", "DATETIME"];

impl QueryDialect for SnowflakeDialect {
    fn name(&self) -> &'static str {
        "snowflake"
    }

    fn accepts(&self, normalized_connection_string: &str) -> bool {
        normalized_connection_string.starts_with("snowflake:")
    }

    fn utc_offset_query(&self) -> &'static str {
        "SELECT DATE_PART(TIMEZONE_HOUR, CURRENT_TIMESTAMP()) * 3600 + DATE_PART(TIMEZONE_MINUTE, CURRENT_TIMESTAMP()) * 60"
    }

    fn requires_uppercase_names(&self) -> bool {
        true
    }

    fn is_time_type(&self, sql_type: &SqlType) -> bool {
        sql_type.is_standard_time_type()
            || matches!(sql_type, SqlType::Vendor(name) if TIME_TYPES.contains(&name.as_str()))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facts() {
        assert_eq!(SnowflakeDialect.to_upper_case_if_required("events"), "EVENTS");
        assert!(SnowflakeDialect.is_time_type(&SnowflakeDialect.classify_type("TIMESTAMP_NTZ(9)")));
        assert!(SnowflakeDialect.accepts("snowflake://acct.snowflakecomputing.com"));
    }
}

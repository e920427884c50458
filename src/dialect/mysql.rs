// ABOUTME: MySQL and MariaDB dialect
// ABOUTME: TIMEDIFF based UTC offset, DATETIME as a time type and TIME values kept as text

use chrono::{DateTime, Utc};

use super::{default_value_getter, queries, QueryDialect};
use crate::catalog::TableMetadata;
use crate::error::Result;
use crate::types::{SqlType, SqlTypeCategory, Statement, ValueGetter};
use crate::watermark::Watermark;

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

impl QueryDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn accepts(&self, normalized_connection_string: &str) -> bool {
        normalized_connection_string.starts_with("mysql:")
            || normalized_connection_string.starts_with("mariadb:")
    }

    fn is_time_type(&self, sql_type: &SqlType) -> bool {
        sql_type.is_standard_time_type()
            || matches!(sql_type, SqlType::Vendor(name) if name == "DATETIME")
    }

    /// MySQL TIME spans more than a day, so it never becomes epoch millis.
    fn value_getter(&self, category: SqlTypeCategory, keep_types: bool) -> ValueGetter {
        match category {
            SqlTypeCategory::Time => ValueGetter::Text,
            _ => default_value_getter(category, keep_types),
        }
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
    fn test_time_is_always_text() {
        let dialect = MySqlDialect;
        assert_eq!(dialect.value_getter(SqlTypeCategory::Time, true), ValueGetter::Text);
        assert_eq!(
            dialect.value_getter(SqlTypeCategory::Timestamp, true),
            ValueGetter::EpochMillis
        );
    }

    #[test]
    fn test_datetime_is_a_timestamp() {
        let dialect = MySqlDialect;
        let datetime = dialect.classify_type("datetime(3)");
        assert!(dialect.is_time_type(&datetime));
        assert_eq!(dialect.type_category(&datetime), SqlTypeCategory::Timestamp);
        assert!(dialect.accepts("mysql://localhost/shop"));
    }
}

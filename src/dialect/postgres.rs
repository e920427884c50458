// ABOUTME: PostgreSQL and Redshift dialects
// ABOUTME: Numbered placeholders, sequence-default detection and timezone-name offsets

use anyhow::bail;
use chrono::{DateTime, Utc};

use super::{default_value_getter, parse_offset_value, queries, QueryDialect};
use crate::catalog::TableMetadata;
use crate::connection::ColumnDescription;
use crate::error::Result;
use crate::types::{SqlTypeCategory, SqlValue, Statement, ValueGetter};
use crate::watermark::Watermark;

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl QueryDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn accepts(&self, normalized_connection_string: &str) -> bool {
        normalized_connection_string.starts_with("postgresql:")
            || normalized_connection_string.starts_with("postgres:")
    }

    fn utc_offset_query(&self) -> &'static str {
        "SELECT EXTRACT(TIMEZONE FROM CURRENT_TIMESTAMP)"
    }

    /// Serial columns default to `nextval(...)`; identity columns are flagged
    /// by the catalog directly.
    fn is_auto_increment_column(&self, column: &ColumnDescription) -> bool {
        column.auto_increment.unwrap_or(false)
            || column
                .default_value
                .as_deref()
                .is_some_and(|d| d.trim_start().starts_with("nextval("))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn integer_placeholder(&self, index: usize) -> String {
        format!("CAST(${} AS BIGINT)", index)
    }

    fn timestamp_placeholder(&self, index: usize) -> String {
        format!("CAST(${} AS TIMESTAMP)", index)
    }

    fn value_getter(&self, category: SqlTypeCategory, keep_types: bool) -> ValueGetter {
        match category {
            SqlTypeCategory::Structured if keep_types => ValueGetter::Text,
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

#[derive(Debug, Default, Clone, Copy)]
pub struct RedshiftDialect;

impl QueryDialect for RedshiftDialect {
    fn name(&self) -> &'static str {
        "redshift"
    }

    fn accepts(&self, normalized_connection_string: &str) -> bool {
        normalized_connection_string.starts_with("redshift:")
    }

    fn utc_offset_query(&self) -> &'static str {
        "SELECT current_setting('timezone')"
    }

    fn parse_utc_offset(&self, value: &SqlValue) -> anyhow::Result<i64> {
        match value {
            SqlValue::Text(zone) => Ok(parse_timezone_setting(zone)),
            other => parse_offset_value(other),
        }
    }

    fn is_auto_increment_column(&self, column: &ColumnDescription) -> bool {
        column.auto_increment.unwrap_or(false)
            || column
                .default_value
                .as_deref()
                .is_some_and(|d| d.trim_start().starts_with("\"identity\"("))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn integer_placeholder(&self, index: usize) -> String {
        format!("CAST(${} AS BIGINT)", index)
    }

    fn timestamp_placeholder(&self, index: usize) -> String {
        format!("CAST(${} AS TIMESTAMP)", index)
    }

    fn value_getter(&self, category: SqlTypeCategory, keep_types: bool) -> ValueGetter {
        PostgresDialect.value_getter(category, keep_types)
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

/// Offset of a Redshift `timezone` setting. Named regions other than UTC are
/// not resolvable without a zone database and count as UTC.
fn parse_timezone_setting(zone: &str) -> i64 {
    let zone = zone.trim();
    let upper = zone.to_uppercase();
    if matches!(upper.as_str(), "UTC" | "GMT" | "Z" | "ETC/UTC" | "ETC/GMT") {
        return 0;
    }
    // POSIX style: Etc/GMT+3 is three hours behind UTC.
    if let Some(rest) = upper.strip_prefix("ETC/GMT") {
        if let Ok(hours) = rest.parse::<i64>() {
            return -hours * 3600;
        }
    }
    match parse_signed_offset(zone) {
        Ok(seconds) => seconds,
        Err(_) => {
            tracing::warn!(
                "Unable to resolve Redshift timezone '{}', assuming UTC",
                zone
            );
            0
        }
    }
}

fn parse_signed_offset(zone: &str) -> anyhow::Result<i64> {
    let body = zone
        .strip_prefix("UTC")
        .or_else(|| zone.strip_prefix("GMT"))
        .unwrap_or(zone);
    if !body.starts_with('+') && !body.starts_with('-') {
        bail!("not an offset: {}", zone);
    }
    if body[1..].contains(':') {
        return super::parse_offset_text(body);
    }
    let hours: i64 = body.parse()?;
    Ok(hours * 3600)
}

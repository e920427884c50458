// ABOUTME: Vendor SQL dialects - query shapes, task-info discovery and vendor facts
// ABOUTME: One QueryDialect implementation per vendor, selected through the registry

pub mod generic;
pub mod mysql;
pub mod oracle;
pub mod postgres;
pub mod queries;
pub mod registry;
pub mod snowflake;
pub mod sqlite;
pub mod sqlserver;

use anyhow::{bail, Context};
use chrono::{DateTime, Timelike, Utc};
use std::fmt;

use crate::catalog::TableMetadata;
use crate::connection::{ColumnDescription, SourceConnection};
use crate::error::Result;
use crate::types::{SqlType, SqlTypeCategory, SqlValue, Statement, ValueGetter};
use crate::watermark::Watermark;

pub use registry::DialectRegistry;

/// Where a row limit goes in a SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStyle {
    /// `... LIMIT n`
    Trailing,
    /// `SELECT TOP n ...`
    Top,
    /// `SELECT * FROM (...) WHERE ROWNUM <= n`
    Rownum,
}

/// Vendor-specific SQL text and value semantics.
///
/// Every query builder takes watermark times already shifted into the
/// database's local time, and returns a fresh [`Statement`]; dialects hold no
/// mutable state, so the same inputs always produce the same statement.
///
/// The builders have no default bodies. Each vendor composes them from the
/// functions in [`queries`], which take their placeholders, limit placement
/// and table naming from the dialect passed in.
pub trait QueryDialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Whether this dialect handles a connection string, already normalized by
    /// [`crate::utils::normalize_connection_string`].
    fn accepts(&self, normalized_connection_string: &str) -> bool;

    /// Query returning the server's offset from UTC as one value.
    fn utc_offset_query(&self) -> &'static str {
        "SELECT TIMEDIFF(NOW(), UTC_TIMESTAMP())"
    }

    fn parse_utc_offset(&self, value: &SqlValue) -> anyhow::Result<i64> {
        parse_offset_value(value)
    }

    /// Seconds the database's local clock is ahead of UTC.
    fn utc_offset_seconds(&self, conn: &mut dyn SourceConnection) -> anyhow::Result<i64> {
        let value = conn
            .query_value(&Statement {
                sql: self.utc_offset_query().to_string(),
                params: Vec::new(),
            })
            .with_context(|| format!("Failed to query {} UTC offset", self.name()))?;
        let offset = self.parse_utc_offset(&value)?;
        tracing::debug!("{} database UTC offset is {} seconds", self.name(), offset);
        Ok(offset)
    }

    fn current_time_query(&self) -> &'static str {
        "SELECT CURRENT_TIMESTAMP"
    }

    fn is_auto_increment_column(&self, column: &ColumnDescription) -> bool {
        column.auto_increment.unwrap_or(false)
    }

    /// Whether unquoted identifiers are stored uppercased.
    fn requires_uppercase_names(&self) -> bool {
        false
    }

    fn to_upper_case_if_required(&self, identifier: &str) -> String {
        if self.requires_uppercase_names() {
            identifier.to_uppercase()
        } else {
            identifier.to_string()
        }
    }

    fn classify_type(&self, type_name: &str) -> SqlType {
        SqlType::from_type_name(type_name)
    }

    fn is_time_type(&self, sql_type: &SqlType) -> bool {
        sql_type.is_standard_time_type()
    }

    /// Category used to pick a value getter. Vendor time types count as timestamps.
    fn type_category(&self, sql_type: &SqlType) -> SqlTypeCategory {
        match sql_type.category() {
            SqlTypeCategory::Plain if self.is_time_type(sql_type) => SqlTypeCategory::Timestamp,
            category => category,
        }
    }

    fn value_getter(&self, category: SqlTypeCategory, keep_types: bool) -> ValueGetter {
        default_value_getter(category, keep_types)
    }

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::Trailing
    }

    /// Placeholder for the 1-based parameter `index`.
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn integer_placeholder(&self, index: usize) -> String {
        self.placeholder(index)
    }

    fn timestamp_placeholder(&self, index: usize) -> String {
        self.placeholder(index)
    }

    fn full_table_name(&self, table: &TableMetadata) -> String {
        table.qualified_name()
    }

    /// Rows with increment value in `[inclusive_start, exclusive_end)`.
    fn query_by_inc(
        &self,
        table: &TableMetadata,
        watermark: &Watermark,
        limit: Option<u64>,
    ) -> Result<Statement>;

    /// Rows whose coalesced timestamp is in `[start_time, end_time)`.
    fn query_by_time(
        &self,
        table: &TableMetadata,
        watermark: &Watermark,
        limit: Option<u64>,
    ) -> Result<Statement>;

    /// Rows before `end_time`, starting at `start_time` where rows sharing that
    /// exact timestamp are cut by the increment key.
    fn query_by_inc_and_time(
        &self,
        table: &TableMetadata,
        watermark: &Watermark,
        limit: Option<u64>,
    ) -> Result<Statement>;

    fn query_full_table(
        &self,
        table: &TableMetadata,
        watermark: &Watermark,
        limit: Option<u64>,
    ) -> Result<Statement>;

    fn task_info_by_inc(&self, table: &TableMetadata, previous: &Watermark) -> Result<Statement>;

    fn task_info_by_time(
        &self,
        table: &TableMetadata,
        previous: &Watermark,
        max_time: DateTime<Utc>,
    ) -> Result<Statement>;

    fn task_info_by_inc_and_time(
        &self,
        table: &TableMetadata,
        previous: &Watermark,
        max_time: DateTime<Utc>,
    ) -> Result<Statement>;

    fn query_min_time(&self, table: &TableMetadata) -> Result<Statement>;
}

/// Text when types are not kept; epoch milliseconds for date and time values
/// otherwise.
pub fn default_value_getter(category: SqlTypeCategory, keep_types: bool) -> ValueGetter {
    if !keep_types {
        return ValueGetter::Text;
    }
    match category {
        SqlTypeCategory::Date | SqlTypeCategory::Time | SqlTypeCategory::Timestamp => {
            ValueGetter::EpochMillis
        }
        _ => ValueGetter::Native,
    }
}

/// Interpret a UTC offset returned by the database: seconds as a number, a
/// `[-]HH:MM[:SS]` interval, or a time of day.
pub fn parse_offset_value(value: &SqlValue) -> anyhow::Result<i64> {
    match value {
        SqlValue::Int(seconds) => Ok(*seconds),
        SqlValue::Float(seconds) => Ok(seconds.round() as i64),
        SqlValue::Time(t) => Ok(i64::from(t.num_seconds_from_midnight())),
        SqlValue::Text(text) => parse_offset_text(text),
        SqlValue::Null => bail!("Database returned no UTC offset"),
        other => bail!("Unexpected UTC offset value {:?}", other),
    }
}

pub fn parse_offset_text(text: &str) -> anyhow::Result<i64> {
    let trimmed = text.trim();
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return Ok(seconds);
    }
    if let Ok(seconds) = trimmed.parse::<f64>() {
        return Ok(seconds.round() as i64);
    }

    let (sign, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let rest = rest.split('.').next().unwrap_or(rest);
    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        bail!("Unrecognized UTC offset '{}'", trimmed);
    }
    let mut seconds = 0i64;
    for (part, unit) in parts.iter().zip([3600i64, 60, 1]) {
        let value: i64 = part
            .parse()
            .with_context(|| format!("Unrecognized UTC offset '{}'", trimmed))?;
        seconds += value * unit;
    }
    Ok(sign * seconds)
}

// ABOUTME: Row values, bound parameters and SQL type classification
// ABOUTME: Closed enums for type categories and the per-column value getters built from them

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::Serialize;
use std::fmt::Write as _;

/// A single column value as read from the database cursor.
///
/// `Timestamp` carries a database-local wall clock time; `TimestampTz` an
/// absolute instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

const TEXT_TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer view used for increment column values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Bool(v) => Some(i64::from(*v)),
            SqlValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// The absolute instant this value denotes, treating database-local values
    /// as `utc_offset_seconds` ahead of UTC.
    ///
    /// Text values are parsed the way SQLite and loosely typed drivers hand
    /// timestamps back: RFC 3339 first, then common `YYYY-MM-DD hh:mm:ss` shapes
    /// read as database-local.
    pub fn to_utc(&self, utc_offset_seconds: i64) -> Option<DateTime<Utc>> {
        let local = match self {
            SqlValue::TimestampTz(ts) => return Some(*ts),
            SqlValue::Timestamp(ts) => *ts,
            SqlValue::Date(d) => d.and_time(NaiveTime::MIN),
            SqlValue::Text(s) => {
                let s = s.trim();
                if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                    return Some(ts.with_timezone(&Utc));
                }
                parse_naive_timestamp(s)?
            }
            _ => return None,
        };
        Some(crate::watermark::shift_saturating(
            local.and_utc(),
            -utc_offset_seconds,
        ))
    }

    /// Textual rendering used when values are not kept in their native type.
    pub fn render(&self) -> Option<String> {
        let text = match self {
            SqlValue::Null => return None,
            SqlValue::Bool(v) => v.to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Float(v) => v.to_string(),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Bytes(bytes) => to_hex(bytes),
            SqlValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            SqlValue::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            SqlValue::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            SqlValue::TimestampTz(ts) => ts.to_rfc3339(),
        };
        Some(text)
    }
}

fn parse_naive_timestamp(s: &str) -> Option<NaiveDateTime> {
    TEXT_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// A value bound to a statement placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Int(i64),
    /// Database-local wall clock time.
    Timestamp(NaiveDateTime),
}

/// A parameterized statement ready to run: SQL text plus its bound values in
/// placeholder order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Column type, normalized from the vendor type name reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlType {
    Bit,
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Float,
    Double,
    Decimal,
    Numeric,
    Char,
    Varchar,
    LongVarchar,
    Clob,
    Binary,
    Varbinary,
    Blob,
    Date,
    Time,
    TimeWithTimezone,
    Timestamp,
    TimestampWithTimezone,
    Array,
    Struct,
    Other,
    /// A vendor type with no portable equivalent, by its uppercased name.
    Vendor(String),
}

impl SqlType {
    /// Map a catalog type name such as `varchar(255)` or
    /// `TIMESTAMP(6) WITH TIME ZONE` onto a type tag.
    pub fn from_type_name(type_name: &str) -> SqlType {
        let normalized = normalize_type_name(type_name);
        if normalized.ends_with("[]") || normalized.starts_with('_') {
            return SqlType::Array;
        }
        match normalized.as_str() {
            "BIT" => SqlType::Bit,
            "BOOL" | "BOOLEAN" => SqlType::Boolean,
            "TINYINT" => SqlType::TinyInt,
            "SMALLINT" | "INT2" | "SMALLSERIAL" => SqlType::SmallInt,
            "INT" | "INTEGER" | "INT4" | "MEDIUMINT" | "SERIAL" => SqlType::Integer,
            "BIGINT" | "INT8" | "BIGSERIAL" => SqlType::BigInt,
            "REAL" | "FLOAT4" => SqlType::Real,
            "FLOAT" => SqlType::Float,
            "DOUBLE" | "DOUBLE PRECISION" | "FLOAT8" => SqlType::Double,
            "DECIMAL" => SqlType::Decimal,
            "NUMERIC" | "NUMBER" => SqlType::Numeric,
            "CHAR" | "CHARACTER" | "BPCHAR" | "NCHAR" => SqlType::Char,
            "VARCHAR" | "CHARACTER VARYING" | "NVARCHAR" | "VARCHAR2" | "NVARCHAR2" => {
                SqlType::Varchar
            }
            "TEXT" | "MEDIUMTEXT" | "LONGTEXT" | "NTEXT" => SqlType::LongVarchar,
            "CLOB" | "NCLOB" => SqlType::Clob,
            "BINARY" => SqlType::Binary,
            "VARBINARY" | "BYTEA" | "RAW" => SqlType::Varbinary,
            "BLOB" | "LONGBLOB" | "MEDIUMBLOB" | "IMAGE" => SqlType::Blob,
            "DATE" => SqlType::Date,
            "TIME" | "TIME WITHOUT TIME ZONE" => SqlType::Time,
            "TIMETZ" | "TIME WITH TIME ZONE" => SqlType::TimeWithTimezone,
            "TIMESTAMP" | "TIMESTAMP WITHOUT TIME ZONE" => SqlType::Timestamp,
            "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => SqlType::TimestampWithTimezone,
            "ARRAY" => SqlType::Array,
            "STRUCT" | "RECORD" => SqlType::Struct,
            "JSON" | "JSONB" | "UUID" | "XML" | "OTHER" => SqlType::Other,
            _ => SqlType::Vendor(normalized),
        }
    }

    pub fn category(&self) -> SqlTypeCategory {
        match self {
            SqlType::Date => SqlTypeCategory::Date,
            SqlType::Time | SqlType::TimeWithTimezone => SqlTypeCategory::Time,
            SqlType::Timestamp | SqlType::TimestampWithTimezone => SqlTypeCategory::Timestamp,
            SqlType::Binary | SqlType::Varbinary | SqlType::Blob => SqlTypeCategory::Binary,
            SqlType::Array | SqlType::Struct | SqlType::Other => SqlTypeCategory::Structured,
            _ => SqlTypeCategory::Plain,
        }
    }

    /// The portable date and time types. Dialects add their vendor types on top.
    pub fn is_standard_time_type(&self) -> bool {
        matches!(
            self,
            SqlType::Date
                | SqlType::Time
                | SqlType::TimeWithTimezone
                | SqlType::Timestamp
                | SqlType::TimestampWithTimezone
        )
    }
}

fn normalize_type_name(type_name: &str) -> String {
    let mut without_args = String::with_capacity(type_name.len());
    let mut depth = 0usize;
    for ch in type_name.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => without_args.push(ch),
            _ => {}
        }
    }
    without_args
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlTypeCategory {
    Date,
    Time,
    Timestamp,
    Binary,
    Structured,
    Plain,
}

/// How a column value is materialized for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueGetter {
    /// The value as the driver returned it.
    Native,
    /// Rendered as a string.
    Text,
    /// Date and time values as milliseconds since the epoch.
    EpochMillis,
    /// Binary values as a lowercase hex string.
    Hex,
}

impl ValueGetter {
    pub fn apply(self, value: SqlValue) -> SqlValue {
        if value.is_null() {
            return value;
        }
        match self {
            ValueGetter::Native => value,
            ValueGetter::Text => value.render().map_or(SqlValue::Null, SqlValue::Text),
            ValueGetter::EpochMillis => match epoch_millis(&value) {
                Some(millis) => SqlValue::Int(millis),
                None => value,
            },
            ValueGetter::Hex => match value {
                SqlValue::Bytes(bytes) => SqlValue::Text(to_hex(&bytes)),
                other => other,
            },
        }
    }
}

fn epoch_millis(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::Time(t) => Some(
            i64::from(t.num_seconds_from_midnight()) * 1000
                + i64::from(t.nanosecond() / 1_000_000),
        ),
        SqlValue::Date(_) | SqlValue::Timestamp(_) | SqlValue::Text(_) => {
            value.to_utc(0).map(|ts| ts.timestamp_millis())
        }
        SqlValue::TimestampTz(ts) => Some(ts.timestamp_millis()),
        _ => None,
    }
}

/// Per-column getters for one table, built once when the table is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowMaterializer {
    getters: Vec<ValueGetter>,
}

impl RowMaterializer {
    pub fn new(getters: Vec<ValueGetter>) -> Self {
        Self { getters }
    }

    pub fn getters(&self) -> &[ValueGetter] {
        &self.getters
    }

    /// Apply each column's getter. Columns beyond the known set pass through.
    pub fn materialize(&self, row: Vec<SqlValue>) -> Vec<SqlValue> {
        row.into_iter()
            .enumerate()
            .map(|(i, value)| {
                self.getters
                    .get(i)
                    .copied()
                    .unwrap_or(ValueGetter::Native)
                    .apply(value)
            })
            .collect()
    }
}

// ABOUTME: Query and task-info statement builders shared by the vendor dialects
// ABOUTME: Each dialect composes these explicitly; placeholders and limits come from the dialect

use chrono::{DateTime, Utc};

use super::{LimitStyle, QueryDialect};
use crate::catalog::TableMetadata;
use crate::error::{ExtractorError, Result};
use crate::types::{SqlParam, Statement};
use crate::watermark::Watermark;

/// Rows with increment value in `[inclusive_start, exclusive_end)`.
pub fn query_by_inc<D: QueryDialect + ?Sized>(
    dialect: &D,
    table: &TableMetadata,
    watermark: &Watermark,
    limit: Option<u64>,
) -> Result<Statement> {
    let inc = require_increment(table)?;
    Ok(select_rows(dialect, table, limit, Some(format!("{} ASC", inc)), |b| {
        b.push(" WHERE ")
            .push(inc)
            .push(" >= ")
            .bind_int(watermark.inclusive_start())
            .push(" AND ")
            .push(inc)
            .push(" < ")
            .bind_int(watermark.exclusive_end());
    }))
}

/// Rows whose coalesced timestamp is in `[start_time, end_time)`.
pub fn query_by_time<D: QueryDialect + ?Sized>(
    dialect: &D,
    table: &TableMetadata,
    watermark: &Watermark,
    limit: Option<u64>,
) -> Result<Statement> {
    let time = require_time(table)?;
    Ok(select_rows(dialect, table, limit, Some(format!("{} ASC", time)), |b| {
        b.push(" WHERE ")
            .push(&time)
            .push(" >= ")
            .bind_time(watermark.start_time())
            .push(" AND ")
            .push(&time)
            .push(" < ")
            .bind_time(watermark.end_time());
    }))
}

/// Rows before `end_time`, starting at `start_time` where rows sharing that
/// exact timestamp are cut by the increment key.
pub fn query_by_inc_and_time<D: QueryDialect + ?Sized>(
    dialect: &D,
    table: &TableMetadata,
    watermark: &Watermark,
    limit: Option<u64>,
) -> Result<Statement> {
    let inc = require_increment(table)?;
    let time = require_time(table)?;
    let order = format!("{}, {} ASC", time, inc);
    Ok(select_rows(dialect, table, limit, Some(order), |b| {
        b.push(" WHERE ")
            .push(&time)
            .push(" < ")
            .bind_time(watermark.end_time())
            .push(" AND ((")
            .push(&time)
            .push(" = ")
            .bind_time(watermark.start_time())
            .push(" AND ")
            .push(inc)
            .push(" >= ")
            .bind_int(watermark.inclusive_start())
            .push(") OR (")
            .push(&time)
            .push(" > ")
            .bind_time(watermark.start_time())
            .push("))");
    }))
}

/// Every row, ordered by whatever bounding columns the table has.
pub fn query_full_table<D: QueryDialect + ?Sized>(
    dialect: &D,
    table: &TableMetadata,
    limit: Option<u64>,
) -> Result<Statement> {
    Ok(select_rows(dialect, table, limit, order_by_for(table), |_| {}))
}

/// `MIN`/`MAX` of the increment column from `previous.exclusive_end()` on.
pub fn task_info_by_inc<D: QueryDialect + ?Sized>(
    dialect: &D,
    table: &TableMetadata,
    previous: &Watermark,
) -> Result<Statement> {
    let inc = require_increment(table)?;
    let mut b = StatementBuilder::new(dialect);
    b.push("SELECT MIN(")
        .push(inc)
        .push(") AS min_inc, MAX(")
        .push(inc)
        .push(") AS max_inc FROM ")
        .push(&dialect.full_table_name(table))
        .push(" WHERE ")
        .push(inc)
        .push(" >= ")
        .bind_int(previous.exclusive_end());
    Ok(b.build())
}

/// Latest coalesced timestamp in `[previous.end_time(), max_time)`. The
/// previous end is exclusive of what was read, so rows on it are new.
pub fn task_info_by_time<D: QueryDialect + ?Sized>(
    dialect: &D,
    table: &TableMetadata,
    previous: &Watermark,
    max_time: DateTime<Utc>,
) -> Result<Statement> {
    let time = require_time(table)?;
    let mut b = StatementBuilder::new(dialect);
    b.push("SELECT MAX(")
        .push(&time)
        .push(") AS last_time FROM ")
        .push(&dialect.full_table_name(table))
        .push(" WHERE ")
        .push(&time)
        .push(" < ")
        .bind_time(max_time)
        .push(" AND ")
        .push(&time)
        .push(" >= ")
        .bind_time(previous.end_time());
    Ok(b.build())
}

/// Increment bounds and latest timestamp of the rows not yet consumed by
/// `previous`, using the same tie-break as [`query_by_inc_and_time`].
pub fn task_info_by_inc_and_time<D: QueryDialect + ?Sized>(
    dialect: &D,
    table: &TableMetadata,
    previous: &Watermark,
    max_time: DateTime<Utc>,
) -> Result<Statement> {
    let inc = require_increment(table)?;
    let time = require_time(table)?;
    let mut b = StatementBuilder::new(dialect);
    b.push("SELECT MIN(")
        .push(inc)
        .push(") AS min_inc, MAX(")
        .push(inc)
        .push(") AS max_inc, MAX(")
        .push(&time)
        .push(") AS last_time FROM ")
        .push(&dialect.full_table_name(table))
        .push(" WHERE ")
        .push(&time)
        .push(" < ")
        .bind_time(max_time)
        .push(" AND ((")
        .push(&time)
        .push(" = ")
        .bind_time(previous.end_time())
        .push(" AND ")
        .push(inc)
        .push(" >= ")
        .bind_int(previous.exclusive_end())
        .push(") OR (")
        .push(&time)
        .push(" > ")
        .bind_time(previous.end_time())
        .push("))");
    Ok(b.build())
}

/// Earliest coalesced timestamp in the table.
pub fn query_min_time<D: QueryDialect + ?Sized>(dialect: &D, table: &TableMetadata) -> Result<Statement> {
    let time = require_time(table)?;
    let mut b = StatementBuilder::new(dialect);
    b.push("SELECT MIN(")
        .push(&time)
        .push(") AS min_time FROM ")
        .push(&dialect.full_table_name(table));
    Ok(b.build())
}

/// Accumulates SQL text and numbers placeholders as values are bound.
pub struct StatementBuilder<'d, D: QueryDialect + ?Sized> {
    dialect: &'d D,
    sql: String,
    params: Vec<SqlParam>,
}

impl<'d, D: QueryDialect + ?Sized> StatementBuilder<'d, D> {
    pub fn new(dialect: &'d D) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn bind_int(&mut self, value: i64) -> &mut Self {
        self.params.push(SqlParam::Int(value));
        let placeholder = self.dialect.integer_placeholder(self.params.len());
        self.sql.push_str(&placeholder);
        self
    }

    /// Bind a database-local time. The UTC type only carries the wall clock.
    pub fn bind_time(&mut self, value: DateTime<Utc>) -> &mut Self {
        self.params.push(SqlParam::Timestamp(value.naive_utc()));
        let placeholder = self.dialect.timestamp_placeholder(self.params.len());
        self.sql.push_str(&placeholder);
        self
    }

    pub fn build(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
        }
    }
}

fn select_rows<D, F>(
    dialect: &D,
    table: &TableMetadata,
    limit: Option<u64>,
    order_by: Option<String>,
    filter: F,
) -> Statement
where
    D: QueryDialect + ?Sized,
    F: FnOnce(&mut StatementBuilder<'_, D>),
{
    let style = dialect.limit_style();
    let mut b = StatementBuilder::new(dialect);
    if style == LimitStyle::Rownum && limit.is_some() {
        b.push("SELECT * FROM (");
    }
    b.push("SELECT ");
    if let (LimitStyle::Top, Some(n)) = (style, limit) {
        b.push(&format!("TOP {} ", n));
    }
    b.push("* FROM ").push(&dialect.full_table_name(table));
    filter(&mut b);
    if let Some(order) = order_by {
        b.push(" ORDER BY ").push(&order);
    }
    match (style, limit) {
        (LimitStyle::Trailing, Some(n)) => {
            b.push(&format!(" LIMIT {}", n));
        }
        (LimitStyle::Rownum, Some(n)) => {
            b.push(&format!(") WHERE ROWNUM <= {}", n));
        }
        _ => {}
    }
    b.build()
}

/// The coalesced timestamp expression; a bare column when there is only one.
pub fn time_expression(table: &TableMetadata) -> Option<String> {
    match table.time_columns() {
        [] => None,
        [single] => Some(single.clone()),
        many => Some(format!("COALESCE({})", many.join(", "))),
    }
}

fn order_by_for(table: &TableMetadata) -> Option<String> {
    match (time_expression(table), table.increment_column()) {
        (Some(time), Some(inc)) => Some(format!("{}, {} ASC", time, inc)),
        (Some(time), None) => Some(format!("{} ASC", time)),
        (None, Some(inc)) => Some(format!("{} ASC", inc)),
        (None, None) => None,
    }
}

fn require_increment(table: &TableMetadata) -> Result<&str> {
    table.increment_column().ok_or_else(|| {
        ExtractorError::InvalidState(format!(
            "table {} has no increment column",
            table.qualified_name()
        ))
    })
}

fn require_time(table: &TableMetadata) -> Result<String> {
    time_expression(table).ok_or_else(|| {
        ExtractorError::InvalidState(format!(
            "table {} has no timestamp columns",
            table.qualified_name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnInfo;
    use crate::dialect::generic::GenericDialect;
    use crate::types::SqlType;
    use chrono::TimeZone;

    fn table(inc: Option<&str>, times: &[&str]) -> TableMetadata {
        let mut builder = TableMetadata::builder("events")
            .schema(Some("app".to_string()))
            .column(ColumnInfo::new("id", SqlType::BigInt).increment_candidate())
            .column(ColumnInfo::new("updated_at", SqlType::Timestamp))
            .column(ColumnInfo::new("created_at", SqlType::Timestamp))
            .time_columns(times.iter().copied());
        if let Some(inc) = inc {
            builder = builder.increment_column(inc);
        }
        builder.full_load(inc.is_none() && times.is_empty()).build().unwrap()
    }

    fn watermark() -> Watermark {
        Watermark::new(
            3,
            10,
            Utc.with_ymd_and_hms(2020, 9, 29, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 9, 29, 9, 5, 0).unwrap(),
        )
    }

    #[test]
    fn test_time_expression_coalesces_multiple_columns() {
        assert_eq!(time_expression(&table(Some("id"), &[])), None);
        assert_eq!(
            time_expression(&table(None, &["updated_at"])).as_deref(),
            Some("updated_at")
        );
        assert_eq!(
            time_expression(&table(None, &["updated_at", "created_at"])).as_deref(),
            Some("COALESCE(updated_at, created_at)")
        );
    }

    #[test]
    fn test_query_by_inc_and_time_shape() {
        let table = table(Some("id"), &["updated_at"]);
        let statement = query_by_inc_and_time(&GenericDialect, &table, &watermark(), None).unwrap();
        assert_eq!(
            statement.sql,
            "SELECT * FROM app.events WHERE updated_at < ? AND ((updated_at = ? AND id >= ?) \
             OR (updated_at > ?)) ORDER BY updated_at, id ASC"
        );
        let start = watermark().start_time().naive_utc();
        let end = watermark().end_time().naive_utc();
        assert_eq!(
            statement.params,
            vec![
                SqlParam::Timestamp(end),
                SqlParam::Timestamp(start),
                SqlParam::Int(3),
                SqlParam::Timestamp(start),
            ]
        );
    }

    #[test]
    fn test_query_by_inc_half_open() {
        let statement =
            query_by_inc(&GenericDialect, &table(Some("id"), &[]), &watermark(), Some(50)).unwrap();
        assert_eq!(
            statement.sql,
            "SELECT * FROM app.events WHERE id >= ? AND id < ? ORDER BY id ASC LIMIT 50"
        );
        assert_eq!(statement.params, vec![SqlParam::Int(3), SqlParam::Int(10)]);
    }

    #[test]
    fn test_builders_require_columns() {
        let by_inc = query_by_inc(&GenericDialect, &table(None, &["updated_at"]), &watermark(), None);
        assert!(matches!(by_inc, Err(ExtractorError::InvalidState(_))));
        assert!(query_by_time(&GenericDialect, &table(Some("id"), &[]), &watermark(), None).is_err());
        assert!(query_min_time(&GenericDialect, &table(Some("id"), &[])).is_err());
    }

    #[test]
    fn test_full_table_orders_by_available_columns() {
        let statement = query_full_table(&GenericDialect, &table(None, &[]), None).unwrap();
        assert_eq!(statement.sql, "SELECT * FROM app.events");
        assert!(statement.params.is_empty());

        let table = table(Some("id"), &["updated_at"]);
        let statement = query_full_table(&GenericDialect, &table, Some(1)).unwrap();
        assert_eq!(
            statement.sql,
            "SELECT * FROM app.events ORDER BY updated_at, id ASC LIMIT 1"
        );
    }
}

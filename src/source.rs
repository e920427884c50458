// ABOUTME: Extractor - configures a table source and hands out bounded per-window loaders
// ABOUTME: Ties catalog, dialect, planner and cursor together behind the scheduler-facing operations

use chrono::{DateTime, Duration, DurationRound, Utc};
use std::sync::Arc;

use crate::catalog::{ScanMode, TableCatalog, TableMetadata};
use crate::config::{properties, SourceConfig};
use crate::connection::{connector_for, ConnectionPool, Connector};
use crate::cursor::{BoundedCursor, RowLimit, WindowReader};
use crate::dialect::{DialectRegistry, QueryDialect};
use crate::error::{DatabaseContext, ExtractorError, PropertyError, Result};
use crate::planner::{PlannedTask, TaskPlanner};
use crate::types::{SqlValue, Statement};
use crate::watermark::{epoch, shift_saturating, TimeRange, Watermark};

/// Rows returned by [`Extractor::sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

/// A configured incremental source for one table.
pub struct Extractor {
    config: SourceConfig,
    dialect: Arc<dyn QueryDialect>,
    pool: Arc<ConnectionPool>,
    table: TableMetadata,
    planner: TaskPlanner,
    utc_offset_secs: i64,
}

impl Extractor {
    /// Connect with the backend matching the connection string and the
    /// built-in dialects.
    pub fn configure(config: SourceConfig) -> Result<Self> {
        let connector = connector_for(&config)?;
        Self::configure_with(config, connector, &DialectRegistry::standard())
    }

    /// Load table metadata and the database UTC offset through `connector`.
    pub fn configure_with(
        config: SourceConfig,
        connector: Arc<dyn Connector>,
        registry: &DialectRegistry,
    ) -> Result<Self> {
        let errors = config.field_errors();
        if !errors.is_empty() {
            return Err(ExtractorError::Configuration(errors));
        }

        let dialect = registry.for_connection(&config.connection_string);
        let pool = ConnectionPool::new(connector, config.pool_config());
        let (table, utc_offset_secs) = {
            let mut conn = pool.get().during("connecting to the source database")?;
            let table = TableCatalog::new(dialect.as_ref()).load(&mut *conn, &config)?;
            let offset = dialect
                .utc_offset_seconds(&mut *conn)
                .during("computing the database UTC offset")?;
            (table, offset)
        };
        let planner = TaskPlanner::new(
            table.scan_mode(),
            config.read_delay_secs,
            config.full_load_interval(),
        );

        tracing::info!(
            "Configured {} source {} for {} ({:?}, UTC offset {}s, read delay {}s)",
            dialect.name(),
            config.display_connection_string(),
            table.qualified_name(),
            table.scan_mode(),
            utc_offset_secs,
            config.read_delay_secs
        );

        Ok(Self {
            config,
            dialect,
            pool,
            table,
            planner,
            utc_offset_secs,
        })
    }

    /// Check a configuration against the live database.
    ///
    /// Connection problems are reported as property errors, not failures.
    pub fn validate(config: &SourceConfig) -> Result<Vec<PropertyError>> {
        match connector_for(config) {
            Ok(connector) => {
                Self::validate_with(config, connector.as_ref(), &DialectRegistry::standard())
            }
            Err(ExtractorError::Configuration(mut errors)) => {
                errors.extend(config.field_errors());
                Ok(errors)
            }
            Err(e) => Err(e),
        }
    }

    pub fn validate_with(
        config: &SourceConfig,
        connector: &dyn Connector,
        registry: &DialectRegistry,
    ) -> Result<Vec<PropertyError>> {
        let mut errors = config.field_errors();
        let dialect = registry.for_connection(&config.connection_string);
        let mut conn = match connector.connect() {
            Ok(conn) => conn,
            Err(e) => {
                errors.push(PropertyError::new(
                    properties::CONNECTION_STRING,
                    format!("Could not connect to database: {:#}", e),
                ));
                return Ok(errors);
            }
        };
        errors.extend(TableCatalog::new(dialect.as_ref()).validate(conn.as_mut(), config)?);
        if !errors.is_empty() {
            tracing::info!("Configuration has {} problem(s)", errors.len());
        }
        Ok(errors)
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn table(&self) -> &TableMetadata {
        &self.table
    }

    pub fn dialect(&self) -> &dyn QueryDialect {
        self.dialect.as_ref()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn utc_offset_secs(&self) -> i64 {
        self.utc_offset_secs
    }

    /// Only a single shard reads a table.
    pub fn max_shards(&self) -> usize {
        1
    }

    /// Starting watermark after the shard layout changed.
    pub fn reshard(&self, previous: &[Watermark]) -> Watermark {
        TaskPlanner::reshard(previous)
    }

    /// Where a full load schedule starts: one interval ago. `None` when not
    /// in full-load mode.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.config
            .full_load_interval()
            .map(|interval| Utc::now() - interval)
    }

    fn query_first_row(&self, statement: &Statement, operation: &str) -> Result<Vec<SqlValue>> {
        let mut conn = self.pool.get().during("connecting to the source database")?;
        let mut rows = conn.query(statement).during(operation)?;
        let row = rows.next_row().during(operation)?;
        drop(rows);
        conn.release();
        Ok(row.unwrap_or_default())
    }

    /// The database clock, in UTC.
    pub fn current_time(&self) -> Result<DateTime<Utc>> {
        let statement = Statement {
            sql: self.dialect.current_time_query().to_string(),
            params: Vec::new(),
        };
        let row = self.query_first_row(&statement, "reading the database clock")?;
        row.first()
            .and_then(|value| value.to_utc(self.utc_offset_secs))
            .ok_or_else(|| {
                ExtractorError::InvalidState(format!(
                    "database clock returned {:?}",
                    row.first()
                ))
            })
    }

    /// Earliest timestamp in the table, truncated to the minute. `None` when
    /// the table is empty or has no timestamp columns.
    pub fn earliest_row_time(&self) -> Result<Option<DateTime<Utc>>> {
        if !self.table.has_time_columns() {
            return Ok(None);
        }
        let statement = self.dialect.query_min_time(&self.table)?;
        let row = self.query_first_row(&statement, "reading the earliest row time")?;
        let earliest = row
            .first()
            .and_then(|value| value.to_utc(self.utc_offset_secs));
        Ok(earliest.map(|time| time.duration_trunc(Duration::minutes(1)).unwrap_or(time)))
    }

    /// Discover the range of rows that arrived after `previous`, bounded by
    /// the end of `range` minus the read delay.
    pub fn task_info(&self, previous: &Watermark, range: &TimeRange) -> Result<Watermark> {
        let mode = self.table.scan_mode();
        if mode == ScanMode::FullLoad {
            return Ok(Watermark::new(
                previous.inclusive_start(),
                previous.exclusive_end(),
                previous.end_time(),
                previous.end_time(),
            ));
        }

        let previous_local = previous.adjust_with_delay(self.utc_offset_secs);
        let max_time_local = shift_saturating(
            range.exclusive_end_time,
            self.utc_offset_secs.saturating_sub(self.config.read_delay_secs),
        );
        let statement = match mode {
            ScanMode::IncrementOnly => self.dialect.task_info_by_inc(&self.table, &previous_local)?,
            ScanMode::TimeOnly => {
                self.dialect
                    .task_info_by_time(&self.table, &previous_local, max_time_local)?
            }
            _ => self.dialect.task_info_by_inc_and_time(
                &self.table,
                &previous_local,
                max_time_local,
            )?,
        };
        let row = self.query_first_row(&statement, "discovering new rows")?;

        let nothing_new = Watermark::new(
            previous.exclusive_end(),
            previous.exclusive_end(),
            previous.end_time(),
            previous.end_time(),
        );
        let found = match mode {
            ScanMode::TimeOnly => match row.first() {
                Some(value) if !value.is_null() => Some(Watermark::new(
                    0,
                    0,
                    previous.end_time(),
                    range.exclusive_end_time,
                )),
                _ => None,
            },
            _ => match (
                row.first().and_then(SqlValue::as_i64),
                row.get(1).and_then(SqlValue::as_i64),
            ) {
                (Some(min), Some(max)) => Some(Watermark::new(
                    min,
                    max.saturating_add(1),
                    previous.end_time(),
                    range.exclusive_end_time,
                )),
                _ => None,
            },
        };
        let info = match found {
            Some(found) => found.limit_by_previous(previous),
            None if mode == ScanMode::TimeOnly => {
                Watermark::new(0, 0, previous.end_time(), previous.end_time())
            }
            None => nothing_new,
        };
        tracing::debug!("Task info for {}: {:?}", self.table.qualified_name(), info);
        Ok(info)
    }

    /// Plan `wanted` and open one cursor spanning all of their scanned windows.
    pub fn data_loaders(
        &self,
        task_info: &Watermark,
        completed_count: usize,
        wanted: &[TimeRange],
    ) -> Result<ScanRun> {
        let tasks = self.planner.plan(task_info, completed_count, wanted);
        let mut positions = Vec::with_capacity(tasks.len());
        let mut windows = Vec::new();
        for task in &tasks {
            if task.is_scan() {
                positions.push(Some(windows.len()));
                windows.push(task.watermark);
            } else {
                positions.push(None);
            }
        }

        let (Some(first), Some(last)) = (windows.first(), windows.last()) else {
            return Ok(ScanRun {
                tasks,
                positions,
                cursor: None,
                next: 0,
            });
        };
        let span = Watermark::new(
            first.inclusive_start(),
            last.exclusive_end(),
            first.start_time(),
            last.end_time(),
        );
        let statement = self.scan_statement(&span, None)?;
        let conn = self.pool.get().during("connecting to the source database")?;
        let cursor = BoundedCursor::open(
            conn,
            &statement,
            &self.table,
            windows,
            self.utc_offset_secs,
            RowLimit::unlimited(),
        )?;
        Ok(ScanRun {
            tasks,
            positions,
            cursor: Some(cursor),
            next: 0,
        })
    }

    /// Statement reading `span` (in UTC) for the table's scan mode.
    fn scan_statement(&self, span: &Watermark, limit: Option<u64>) -> Result<Statement> {
        let local = span.adjust_with_delay(self.utc_offset_secs);
        match self.table.scan_mode() {
            ScanMode::IncrementOnly => self.dialect.query_by_inc(&self.table, &local, limit),
            ScanMode::TimeOnly => self.dialect.query_by_time(&self.table, &local, limit),
            ScanMode::IncrementAndTime => {
                self.dialect.query_by_inc_and_time(&self.table, &local, limit)
            }
            ScanMode::FullLoad => self.dialect.query_full_table(&self.table, &local, limit),
        }
    }

    /// Up to `limit` rows from the start of the table up to now.
    pub fn sample(&self, limit: u64) -> Result<Sample> {
        let window = Watermark::new(0, i64::MAX, epoch(), Utc::now());
        let statement = self.scan_statement(&window, Some(limit))?;
        let conn = self.pool.get().during("connecting to the source database")?;
        let mut cursor = BoundedCursor::open(
            conn,
            &statement,
            &self.table,
            vec![window],
            self.utc_offset_secs,
            RowLimit::at_most(limit),
        )?;
        let columns = cursor.column_names().to_vec();
        let mut rows = Vec::new();
        {
            let mut reader = cursor.window(0)?;
            while let Some(row) = reader.next_row()? {
                rows.push(row);
            }
        }
        cursor.close();
        Ok(Sample { columns, rows })
    }

    /// Close idle pooled connections and refuse new checkouts.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// The loaders of one scheduler batch.
///
/// Loaders are handed out in planned order and share one cursor, so each must
/// be finished with before the next is requested.
pub struct ScanRun {
    tasks: Vec<PlannedTask>,
    positions: Vec<Option<usize>>,
    cursor: Option<BoundedCursor>,
    next: usize,
}

impl ScanRun {
    pub fn tasks(&self) -> &[PlannedTask] {
        &self.tasks
    }

    pub fn column_names(&self) -> &[String] {
        self.cursor
            .as_ref()
            .map(BoundedCursor::column_names)
            .unwrap_or_default()
    }

    /// The next loader in planned order, or `None` after the last one.
    pub fn next_loader(&mut self) -> Result<Option<DataLoader<'_>>> {
        let Some(task) = self.tasks.get(self.next).copied() else {
            return Ok(None);
        };
        let position = self.positions[self.next];
        self.next += 1;
        let reader = match (position, self.cursor.as_mut()) {
            (Some(window), Some(cursor)) => Some(cursor.window(window)?),
            _ => None,
        };
        Ok(Some(DataLoader { task, reader }))
    }

    /// Return the connection to the pool. Idempotent.
    pub fn close(&mut self) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.close();
        }
    }
}

/// Rows and progress of one planned window.
pub struct DataLoader<'r> {
    task: PlannedTask,
    reader: Option<WindowReader<'r>>,
}

impl DataLoader<'_> {
    pub fn task(&self) -> &PlannedTask {
        &self.task
    }

    pub fn column_names(&self) -> &[String] {
        self.reader
            .as_ref()
            .map(WindowReader::column_names)
            .unwrap_or_default()
    }

    pub fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        match self.reader.as_mut() {
            Some(reader) => reader.next_row(),
            None => Ok(None),
        }
    }

    pub fn rows_read(&self) -> u64 {
        self.reader.as_ref().map_or(0, WindowReader::rows_read)
    }

    /// Watermark to persist once every row of this loader was handled.
    pub fn completed_watermark(&self) -> Watermark {
        self.reader
            .as_ref()
            .map_or(self.task.watermark, WindowReader::completed_watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extractor(configure: impl FnOnce(SourceConfig) -> SourceConfig) -> (TempDir, Extractor) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, note TEXT);
             INSERT INTO orders (note) VALUES ('a'), ('b'), ('c'), ('d'), ('e');",
        )
        .unwrap();
        drop(conn);
        let config = configure(SourceConfig::new(
            format!("sqlite:{}", path.display()),
            "orders",
        ));
        (dir, Extractor::configure(config).unwrap())
    }

    #[test]
    fn test_increment_only_task_info_and_loaders() {
        let (_dir, extractor) = extractor(|c| c);
        assert_eq!(extractor.table().scan_mode(), ScanMode::IncrementOnly);
        assert_eq!(extractor.max_shards(), 1);

        let range = TimeRange::new(epoch(), Utc::now());
        let info = extractor.task_info(&Watermark::default(), &range).unwrap();
        assert_eq!((info.inclusive_start(), info.exclusive_end()), (1, 6));

        let wanted = vec![range, range];
        let mut run = extractor.data_loaders(&info, 0, &wanted).unwrap();
        let mut ids = Vec::new();
        let mut completed = Vec::new();
        while let Some(mut loader) = run.next_loader().unwrap() {
            let mut window = Vec::new();
            while let Some(row) = loader.next_row().unwrap() {
                window.push(row[0].as_i64().unwrap());
            }
            ids.push(window);
            completed.push(loader.completed_watermark());
        }
        assert_eq!(ids, vec![vec![1, 2], vec![3, 4, 5]]);
        assert_eq!(completed[1].exclusive_end(), 6);
        run.close();

        let next = extractor.task_info(&completed[1], &range).unwrap();
        assert_eq!((next.inclusive_start(), next.exclusive_end()), (6, 6));
        let mut run = extractor.data_loaders(&next, 0, &[range]).unwrap();
        let mut loader = run.next_loader().unwrap().unwrap();
        assert!(loader.next_row().unwrap().is_none());
        assert_eq!(loader.completed_watermark(), next);
    }

    #[test]
    fn test_sample_caps_rows() {
        let (_dir, extractor) = extractor(|c| c);
        let sample = extractor.sample(2).unwrap();
        assert_eq!(sample.columns, vec!["id".to_string(), "note".to_string()]);
        assert_eq!(sample.rows.len(), 2);
        assert_eq!(sample.rows[0][1], SqlValue::Text("a".to_string()));
        assert_eq!(extractor.pool().idle(), 1);
    }

    #[test]
    fn test_full_load_start_time_and_task_info() {
        let (_dir, extractor) = extractor(|c| c.with_full_load_interval_minutes(5));
        assert_eq!(extractor.table().scan_mode(), ScanMode::FullLoad);
        let start = extractor.start_time().unwrap();
        assert!(start < Utc::now());

        let previous = Watermark::new(1, 2, epoch(), epoch());
        let range = TimeRange::new(epoch(), Utc::now());
        let info = extractor.task_info(&previous, &range).unwrap();
        assert_eq!(info, Watermark::new(1, 2, epoch(), epoch()));
    }

    #[test]
    fn test_start_time_is_none_outside_full_load() {
        let (_dir, extractor) = extractor(|c| c);
        assert!(extractor.start_time().is_none());
        assert_eq!(extractor.earliest_row_time().unwrap(), None);
    }

    #[test]
    fn test_configure_rejects_bad_fields() {
        let config = SourceConfig::new("sqlite::memory:", "orders").with_read_delay_secs(-5);
        let err = Extractor::configure(config).err().unwrap();
        assert_eq!(err.property_errors()[0].property, properties::READ_DELAY);
    }
}

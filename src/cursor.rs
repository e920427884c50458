// ABOUTME: Bounded cursor - one forward-only result shared by consecutive planned windows
// ABOUTME: Single-row lookahead hands the first row past a window's bound to the next window

use chrono::{DateTime, Utc};

use crate::catalog::{ScanMode, TableMetadata};
use crate::connection::{PooledConnection, RowSource};
use crate::error::{DatabaseContext, ExtractorError, Result};
use crate::types::{RowMaterializer, SqlValue, Statement};
use crate::watermark::{just_after, Watermark};

/// Optional cap on the rows a cursor yields across all of its windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowLimit(Option<u64>);

impl RowLimit {
    pub fn unlimited() -> Self {
        RowLimit(None)
    }

    pub fn at_most(rows: u64) -> Self {
        RowLimit(Some(rows))
    }

    pub fn max_rows(&self) -> Option<u64> {
        self.0
    }

    fn reached(&self, yielded: u64) -> bool {
        self.0.is_some_and(|max| yielded >= max)
    }
}

/// Lookahead state of the shared result.
#[derive(Debug, Default)]
pub struct CursorState {
    /// A fetched row that belongs to a later window.
    pub buffered: Option<Vec<SqlValue>>,
    /// The result is exhausted.
    pub done: bool,
}

enum Placement {
    Yield { inc: Option<i64>, time: Option<DateTime<Utc>> },
    Reject,
    Skip,
}

/// Where the bounding columns sit in the result rows.
#[derive(Debug, Clone)]
struct BoundColumns {
    increment: Option<usize>,
    time: Vec<usize>,
}

impl BoundColumns {
    fn locate(table: &TableMetadata, columns: &[String]) -> Result<Self> {
        let index_of = |name: &str| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    ExtractorError::InvalidState(format!(
                        "column {} is missing from the result of {}",
                        name,
                        table.qualified_name()
                    ))
                })
        };
        let increment = table.increment_column().map(index_of).transpose()?;
        let time = table
            .time_columns()
            .iter()
            .map(|c| index_of(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { increment, time })
    }
}

/// Reads one query whose rows span several planned windows.
///
/// Windows are consumed strictly in order through [`BoundedCursor::window`].
/// The connection goes back to its pool on [`BoundedCursor::close`], on the
/// first read error, or when the cursor is dropped.
pub struct BoundedCursor {
    conn: Option<PooledConnection>,
    rows: Option<Box<dyn RowSource>>,
    columns: Vec<String>,
    scan_mode: ScanMode,
    bounds: BoundColumns,
    materializer: RowMaterializer,
    utc_offset_secs: i64,
    windows: Vec<Watermark>,
    next_window: usize,
    state: CursorState,
    limit: RowLimit,
    yielded: u64,
}

impl BoundedCursor {
    /// Run `statement` on `conn` and prepare to split its rows across `windows`.
    ///
    /// # Arguments
    ///
    /// * `conn` - Connection the cursor owns until closed
    /// * `statement` - Query covering every window, ordered by the bounding columns
    /// * `table` - Metadata of the scanned table
    /// * `windows` - Planned watermarks, in UTC, in scan order
    /// * `utc_offset_secs` - How far the database clock is ahead of UTC
    /// * `limit` - Cap on rows yielded across all windows
    pub fn open(
        mut conn: PooledConnection,
        statement: &Statement,
        table: &TableMetadata,
        windows: Vec<Watermark>,
        utc_offset_secs: i64,
        limit: RowLimit,
    ) -> Result<Self> {
        tracing::debug!(
            "Opening cursor over {} window(s): {}",
            windows.len(),
            statement.sql
        );
        let rows = match conn.query(statement).during("querying table rows") {
            Ok(rows) => rows,
            Err(e) => {
                conn.release();
                return Err(e);
            }
        };
        let columns = rows.column_names().to_vec();
        let bounds = match BoundColumns::locate(table, &columns) {
            Ok(bounds) => bounds,
            Err(e) => {
                conn.release();
                return Err(e);
            }
        };
        Ok(Self {
            conn: Some(conn),
            rows: Some(rows),
            columns,
            scan_mode: table.scan_mode(),
            bounds,
            materializer: table.materializer().clone(),
            utc_offset_secs,
            windows,
            next_window: 0,
            state: CursorState::default(),
            limit,
            yielded: 0,
        })
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn state(&self) -> &CursorState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Reader for window `index`. Windows must be requested in order.
    pub fn window(&mut self, index: usize) -> Result<WindowReader<'_>> {
        if index != self.next_window {
            return Err(ExtractorError::InvalidState(format!(
                "window {} requested but window {} is next",
                index, self.next_window
            )));
        }
        let watermark = *self.windows.get(index).ok_or_else(|| {
            ExtractorError::InvalidState(format!(
                "window {} requested but the cursor only has {}",
                index,
                self.windows.len()
            ))
        })?;
        self.next_window += 1;
        Ok(WindowReader {
            cursor: self,
            watermark,
            last_inc: None,
            last_time: None,
            rows_read: 0,
        })
    }

    /// Release the result and return the connection to its pool. Idempotent.
    pub fn close(&mut self) {
        self.shut_down(true);
    }

    fn shut_down(&mut self, reusable: bool) {
        self.rows = None;
        self.state.buffered = None;
        self.state.done = true;
        if let Some(mut conn) = self.conn.take() {
            if reusable {
                conn.release();
                tracing::debug!("Cursor closed after {} row(s)", self.yielded);
            } else {
                conn.discard();
                tracing::warn!(
                    "Cursor discarded its connection after a read error ({} row(s) read)",
                    self.yielded
                );
            }
        }
    }

    fn fetch(&mut self) -> Result<Option<Vec<SqlValue>>> {
        if let Some(row) = self.state.buffered.take() {
            return Ok(Some(row));
        }
        if self.state.done {
            return Ok(None);
        }
        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };
        match rows.next_row() {
            Ok(Some(row)) => Ok(Some(row)),
            Ok(None) => {
                self.state.done = true;
                Ok(None)
            }
            Err(e) => {
                // The driver may be mid-result; never hand that connection out again.
                self.shut_down(false);
                Err(ExtractorError::database("reading table rows", e))
            }
        }
    }

    fn increment_of(&self, row: &[SqlValue]) -> Result<Option<i64>> {
        let Some(idx) = self.bounds.increment else {
            return Ok(None);
        };
        match row.get(idx).and_then(SqlValue::as_i64) {
            Some(value) => Ok(Some(value)),
            None => Err(ExtractorError::BoundaryViolation(format!(
                "row has no integer value in increment column {}",
                self.columns.get(idx).map(String::as_str).unwrap_or("?")
            ))),
        }
    }

    /// First non-null timestamp column, in UTC.
    fn time_of(&self, row: &[SqlValue]) -> Result<DateTime<Utc>> {
        let value = self
            .bounds
            .time
            .iter()
            .filter_map(|&idx| row.get(idx))
            .find(|value| !value.is_null());
        match value {
            Some(value) => value.to_utc(self.utc_offset_secs).ok_or_else(|| {
                ExtractorError::BoundaryViolation(format!(
                    "timestamp value {:?} cannot be read as a time",
                    value
                ))
            }),
            None => Err(ExtractorError::BoundaryViolation(
                "row has no value in any timestamp column".to_string(),
            )),
        }
    }

    fn place(&self, row: &[SqlValue], window: &Watermark) -> Result<Placement> {
        match self.scan_mode {
            ScanMode::FullLoad => Ok(Placement::Yield {
                inc: None,
                time: None,
            }),
            ScanMode::IncrementOnly => {
                let inc = self.increment_of(row)?;
                Ok(match inc {
                    Some(v) if v >= window.exclusive_end() => Placement::Reject,
                    Some(v) if v < window.inclusive_start() => Placement::Skip,
                    _ => Placement::Yield { inc, time: None },
                })
            }
            ScanMode::TimeOnly | ScanMode::IncrementAndTime => {
                let time = self.time_of(row)?;
                if time >= window.end_time() {
                    return Ok(Placement::Reject);
                }
                if time < window.start_time() {
                    return Ok(Placement::Skip);
                }
                let inc = self.increment_of(row)?;
                Ok(Placement::Yield {
                    inc,
                    time: Some(time),
                })
            }
        }
    }
}

impl Drop for BoundedCursor {
    fn drop(&mut self) {
        self.close();
    }
}

/// The rows of one planned window.
pub struct WindowReader<'c> {
    cursor: &'c mut BoundedCursor,
    watermark: Watermark,
    last_inc: Option<i64>,
    last_time: Option<DateTime<Utc>>,
    rows_read: u64,
}

impl<'c> WindowReader<'c> {
    /// The planned watermark of this window.
    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    pub fn column_names(&self) -> &[String] {
        self.cursor.column_names()
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Next row of this window with its values materialized, or `None` once
    /// the window's bound is reached.
    pub fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        loop {
            if self.cursor.limit.reached(self.cursor.yielded) {
                return Ok(None);
            }
            let Some(row) = self.cursor.fetch()? else {
                return Ok(None);
            };
            let placement = match self.cursor.place(&row, &self.watermark) {
                Ok(placement) => placement,
                Err(e) => {
                    self.cursor.close();
                    return Err(e);
                }
            };
            match placement {
                Placement::Reject => {
                    self.cursor.state.buffered = Some(row);
                    return Ok(None);
                }
                Placement::Skip => {
                    tracing::trace!("Skipping row before window start");
                }
                Placement::Yield { inc, time } => {
                    if inc.is_some() {
                        self.last_inc = inc;
                    }
                    if time.is_some() {
                        self.last_time = time;
                    }
                    self.rows_read += 1;
                    self.cursor.yielded += 1;
                    return Ok(Some(self.cursor.materializer.materialize(row)));
                }
            }
        }
    }

    /// Progress made by this window.
    ///
    /// Once a row was read in increment-and-time mode, the end time becomes
    /// the last row's timestamp and the exclusive end its key plus one. In
    /// time-only mode the end time lands one microsecond past the last row.
    /// Otherwise the planned watermark.
    pub fn completed_watermark(&self) -> Watermark {
        let planned = self.watermark;
        match (self.cursor.scan_mode, self.last_time) {
            (ScanMode::IncrementAndTime, Some(last_time)) => {
                let exclusive_end = self
                    .last_inc
                    .map_or(planned.exclusive_end(), |inc| inc.saturating_add(1));
                Watermark::new(
                    planned.inclusive_start().min(exclusive_end),
                    exclusive_end,
                    planned.start_time(),
                    last_time,
                )
            }
            // Without a key to break ties the end stays exclusive: the next
            // window starts just after the last row read.
            (ScanMode::TimeOnly, Some(last_time)) => planned.with_times(
                planned.start_time(),
                just_after(last_time).min(planned.end_time()),
            ),
            _ => planned,
        }
    }
}

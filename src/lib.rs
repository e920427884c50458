// ABOUTME: Library root for table-window-extractor
// ABOUTME: Incremental, window-bounded table extraction over increment and timestamp watermarks

pub mod catalog;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod dialect;
pub mod error;
pub mod planner;
pub mod source;
pub mod state;
pub mod types;
pub mod utils;
pub mod watermark;

pub use catalog::{ColumnInfo, ScanMode, TableCatalog, TableMetadata};
pub use config::{PoolSettings, SourceConfig};
pub use connection::{
    ConnectionPool, Connector, PoolConfig, PooledConnection, RowSource, SourceConnection,
};
pub use cursor::{BoundedCursor, CursorState, RowLimit, WindowReader};
pub use dialect::{DialectRegistry, QueryDialect};
pub use error::{ExtractorError, PropertyError, Result};
pub use planner::{PlannedTask, TaskKind, TaskPlanner};
pub use source::{DataLoader, Extractor, Sample, ScanRun};
pub use state::{TableWatermark, WatermarkStore};
pub use types::{SqlParam, SqlType, SqlValue, Statement};
pub use watermark::{TimeRange, Watermark};

// ABOUTME: Fallback dialect for databases without a dedicated implementation
// ABOUTME: ANSI query shapes, trailing LIMIT and a MySQL-style UTC offset query

use chrono::{DateTime, Utc};

use super::{queries, QueryDialect};
use crate::catalog::TableMetadata;
use crate::error::Result;
use crate::types::Statement;
use crate::watermark::Watermark;

#[derive(Debug, Default, Clone, Copy)]
pub struct GenericDialect;

impl QueryDialect for GenericDialect {
    fn name(&self) -> &'static str {
        "default"
    }

    /// Only ever chosen as the registry fallback.
    fn accepts(&self, _normalized_connection_string: &str) -> bool {
        false
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

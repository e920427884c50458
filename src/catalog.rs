// ABOUTME: Table catalog - loads column metadata and resolves increment and timestamp columns
// ABOUTME: Decides the scan mode once and validates user overrides into property errors

use crate::config::{properties, SourceConfig};
use crate::connection::{ColumnDescription, SourceConnection, TableDescription};
use crate::dialect::QueryDialect;
use crate::error::{DatabaseContext, ExtractorError, PropertyError, Result};
use crate::types::{RowMaterializer, SqlType, ValueGetter};
use crate::utils::{sanitize_identifier, validate_identifier};

/// How rows are bounded and ordered for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanMode {
    /// Key range only, split proportionally across tasks.
    IncrementOnly,
    /// Coalesced timestamp only.
    TimeOnly,
    /// Timestamp windows with the increment key breaking ties.
    IncrementAndTime,
    /// The whole table on every interval boundary.
    FullLoad,
}

impl ScanMode {
    /// `None` when there is nothing to bound the scan with.
    pub fn resolve(has_increment: bool, has_time: bool, full_load: bool) -> Option<ScanMode> {
        match (full_load, has_increment, has_time) {
            (true, _, _) => Some(ScanMode::FullLoad),
            (false, true, true) => Some(ScanMode::IncrementAndTime),
            (false, false, true) => Some(ScanMode::TimeOnly),
            (false, true, false) => Some(ScanMode::IncrementOnly),
            (false, false, false) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: SqlType,
    pub is_increment_candidate: bool,
    pub is_time_type: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        let is_time_type = sql_type.is_standard_time_type();
        Self {
            name: name.into(),
            sql_type,
            is_increment_candidate: false,
            is_time_type,
        }
    }

    pub fn increment_candidate(mut self) -> Self {
        self.is_increment_candidate = true;
        self
    }

    pub fn time_type(mut self, is_time_type: bool) -> Self {
        self.is_time_type = is_time_type;
        self
    }
}

/// Resolved metadata of the scanned table. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    catalog: Option<String>,
    schema: Option<String>,
    name: String,
    columns: Vec<ColumnInfo>,
    increment_column: Option<String>,
    time_columns: Vec<String>,
    scan_mode: ScanMode,
    materializer: RowMaterializer,
}

impl TableMetadata {
    pub fn builder(name: impl Into<String>) -> TableMetadataBuilder {
        TableMetadataBuilder {
            catalog: None,
            schema: None,
            name: name.into(),
            columns: Vec::new(),
            increment_column: None,
            time_columns: Vec::new(),
            full_load: false,
            materializer: None,
        }
    }

    pub fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn increment_column(&self) -> Option<&str> {
        self.increment_column.as_deref()
    }

    /// Ordered timestamp columns; empty when the table is not scanned by time.
    pub fn time_columns(&self) -> &[String] {
        &self.time_columns
    }

    pub fn has_time_columns(&self) -> bool {
        !self.time_columns.is_empty()
    }

    pub fn scan_mode(&self) -> ScanMode {
        self.scan_mode
    }

    pub fn materializer(&self) -> &RowMaterializer {
        &self.materializer
    }

    /// `schema.table`, or just the table when there is no schema.
    pub fn qualified_name(&self) -> String {
        match self.schema.as_deref() {
            Some(schema) if !schema.is_empty() => format!("{}.{}", schema, self.name),
            _ => self.name.clone(),
        }
    }
}

pub struct TableMetadataBuilder {
    catalog: Option<String>,
    schema: Option<String>,
    name: String,
    columns: Vec<ColumnInfo>,
    increment_column: Option<String>,
    time_columns: Vec<String>,
    full_load: bool,
    materializer: Option<RowMaterializer>,
}

impl TableMetadataBuilder {
    pub fn catalog(mut self, catalog: Option<String>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn schema(mut self, schema: Option<String>) -> Self {
        self.schema = schema;
        self
    }

    pub fn column(mut self, column: ColumnInfo) -> Self {
        self.columns.push(column);
        self
    }

    pub fn columns(mut self, columns: impl IntoIterator<Item = ColumnInfo>) -> Self {
        self.columns.extend(columns);
        self
    }

    pub fn increment_column(mut self, column: impl Into<String>) -> Self {
        self.increment_column = Some(column.into());
        self
    }

    pub fn time_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.time_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn full_load(mut self, full_load: bool) -> Self {
        self.full_load = full_load;
        self
    }

    pub fn materializer(mut self, materializer: RowMaterializer) -> Self {
        self.materializer = Some(materializer);
        self
    }

    pub fn build(self) -> Result<TableMetadata> {
        let scan_mode = ScanMode::resolve(
            self.increment_column.is_some(),
            !self.time_columns.is_empty(),
            self.full_load,
        )
        .ok_or_else(|| {
            ExtractorError::configuration(
                properties::TIMESTAMP_COLUMNS,
                "The table has no auto-incrementing column, you must provide update time columns to use",
            )
        })?;
        let materializer = self.materializer.unwrap_or_else(|| {
            RowMaterializer::new(vec![ValueGetter::Native; self.columns.len()])
        });
        Ok(TableMetadata {
            catalog: self.catalog,
            schema: self.schema,
            name: self.name,
            columns: self.columns,
            increment_column: self.increment_column,
            time_columns: self.time_columns,
            scan_mode,
            materializer,
        })
    }
}

/// Loads table metadata through a live connection using one dialect's rules.
pub struct TableCatalog<'a> {
    dialect: &'a dyn QueryDialect,
}

impl<'a> TableCatalog<'a> {
    pub fn new(dialect: &'a dyn QueryDialect) -> Self {
        Self { dialect }
    }

    fn describe(
        &self,
        conn: &mut dyn SourceConnection,
        config: &SourceConfig,
    ) -> Result<TableDescription> {
        let table = config.table.trim();
        if let Err(e) = validate_identifier(table) {
            return Err(ExtractorError::configuration(
                properties::TABLE_NAME,
                format!("Invalid table name: {}", e),
            ));
        }
        if let Some(schema) = config.schema.as_deref() {
            if let Err(e) = validate_identifier(schema) {
                return Err(ExtractorError::configuration(
                    properties::SCHEMA,
                    format!("Invalid schema name: {}", e),
                ));
            }
        }

        let schema = config
            .schema
            .as_deref()
            .map(|s| self.dialect.to_upper_case_if_required(s.trim()));
        let table = self.dialect.to_upper_case_if_required(table);
        conn.describe_table(schema.as_deref(), &table)
            .during("loading table metadata")?
            .ok_or_else(|| {
                ExtractorError::configuration(
                    properties::TABLE_NAME,
                    format!(
                        "Could not find table with name: '{}'",
                        sanitize_identifier(&config.table)
                    ),
                )
            })
    }

    fn column_info(&self, description: &ColumnDescription) -> ColumnInfo {
        let sql_type = self.dialect.classify_type(&description.type_name);
        let is_time_type = self.dialect.is_time_type(&sql_type);
        ColumnInfo {
            name: description.name.clone(),
            sql_type,
            is_increment_candidate: self.dialect.is_auto_increment_column(description),
            is_time_type,
        }
    }

    /// Load the configured table and resolve the columns that bound the scan.
    ///
    /// The increment column is the explicit override when given, otherwise the
    /// first auto-increment column. Timestamp columns are the configured ones
    /// that exist and have a time type, in configuration order.
    pub fn load(
        &self,
        conn: &mut dyn SourceConnection,
        config: &SourceConfig,
    ) -> Result<TableMetadata> {
        let description = self.describe(conn, config)?;
        let columns: Vec<ColumnInfo> = description
            .columns
            .iter()
            .map(|c| self.column_info(c))
            .collect();

        let find = |name: &str| {
            columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
        };

        let increment_column = match config.incrementing_column.as_deref() {
            Some(requested) => match find(requested) {
                Some(column) => Some(column.name.clone()),
                None => {
                    return Err(ExtractorError::configuration(
                        properties::INCREMENTING_COLUMN,
                        format!(
                            "Could not find increment column {}",
                            sanitize_identifier(requested)
                        ),
                    ))
                }
            },
            None => columns
                .iter()
                .find(|c| c.is_increment_candidate && !c.is_time_type)
                .map(|c| c.name.clone()),
        };

        let mut time_columns = Vec::new();
        for requested in &config.timestamp_columns {
            match find(requested) {
                Some(column) if column.is_time_type => time_columns.push(column.name.clone()),
                Some(_) => tracing::warn!(
                    "Ignoring timestamp column '{}': not a time type",
                    sanitize_identifier(requested)
                ),
                None => tracing::warn!(
                    "Ignoring timestamp column '{}': not found in {}",
                    sanitize_identifier(requested),
                    description.name
                ),
            }
        }

        let materializer = RowMaterializer::new(
            columns
                .iter()
                .map(|c| {
                    self.dialect
                        .value_getter(self.dialect.type_category(&c.sql_type), config.keep_types)
                })
                .collect(),
        );

        let mut builder = TableMetadata::builder(description.name.clone())
            .catalog(description.catalog.clone())
            .schema(description.schema.clone())
            .columns(columns.iter().cloned())
            .time_columns(time_columns)
            .full_load(config.full_load_interval().is_some())
            .materializer(materializer);
        if let Some(column) = increment_column {
            builder = builder.increment_column(column);
        }
        let table = builder.build()?;

        tracing::info!(
            "Loaded table {} ({} columns), scan mode {:?}, increment column {:?}, timestamp columns {:?}",
            table.qualified_name(),
            table.columns().len(),
            table.scan_mode(),
            table.increment_column(),
            table.time_columns()
        );
        Ok(table)
    }

    /// Check the configured table and column overrides without building metadata.
    ///
    /// # Returns
    ///
    /// Every problem found, keyed by property. Empty when the configuration is usable.
    pub fn validate(
        &self,
        conn: &mut dyn SourceConnection,
        config: &SourceConfig,
    ) -> Result<Vec<PropertyError>> {
        let description = match self.describe(conn, config) {
            Ok(description) => description,
            Err(ExtractorError::Configuration(errors)) => return Ok(errors),
            Err(e) => return Err(e),
        };
        let columns: Vec<ColumnInfo> = description
            .columns
            .iter()
            .map(|c| self.column_info(c))
            .collect();
        let find = |name: &str| {
            columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
        };

        let mut errors = Vec::new();
        if let Some(requested) = config.incrementing_column.as_deref() {
            match find(requested) {
                None => errors.push(PropertyError::new(
                    properties::INCREMENTING_COLUMN,
                    format!("Could not find increment column {}", sanitize_identifier(requested)),
                )),
                Some(column) if !column.is_increment_candidate => errors.push(PropertyError::new(
                    properties::INCREMENTING_COLUMN,
                    format!("Column {} is not an auto-increment column", column.name),
                )),
                Some(_) => {}
            }
        }

        let mut found_time_column = false;
        for requested in &config.timestamp_columns {
            if let Some(column) = find(requested) {
                if column.is_time_type {
                    found_time_column = true;
                } else {
                    errors.push(PropertyError::new(
                        properties::TIMESTAMP_COLUMNS,
                        format!("Column '{}' is not a timestamp column", column.name),
                    ));
                }
            }
        }
        if !config.timestamp_columns.is_empty() && !found_time_column {
            errors.push(PropertyError::new(
                properties::TIMESTAMP_COLUMNS,
                "None of the provided timestamp columns exist in the table",
            ));
        }
        if config.timestamp_columns.is_empty()
            && config.full_load_interval().is_none()
            && !columns.iter().any(|c| c.is_increment_candidate)
        {
            errors.push(PropertyError::new(
                properties::TIMESTAMP_COLUMNS,
                "The table has no auto-incrementing column, you must provide update time columns to use",
            ));
        }
        Ok(errors)
    }
}

// ABOUTME: WatermarkStore - persists completed watermarks per table between runs
// ABOUTME: JSON file keyed by schema.table with the sanitized source URL and bookkeeping

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::sanitize_url;
use crate::watermark::Watermark;

/// Progress of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableWatermark {
    pub schema: Option<String>,
    pub table: String,
    /// Last completed watermark; where the next run resumes
    pub watermark: Watermark,
    pub updated_at: DateTime<Utc>,
    /// Rows read by the run that produced `watermark`
    pub last_row_count: u64,
}

impl TableWatermark {
    pub fn new(schema: Option<&str>, table: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            table: table.to_string(),
            watermark: Watermark::default(),
            updated_at: Utc::now(),
            last_row_count: 0,
        }
    }

    pub fn update(&mut self, watermark: Watermark, row_count: u64) {
        self.watermark = watermark;
        self.updated_at = Utc::now();
        self.last_row_count = row_count;
    }

    pub fn qualified_name(&self) -> String {
        state_key(self.schema.as_deref(), &self.table)
    }
}

fn state_key(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) if !schema.is_empty() => format!("{}.{}", schema, table),
        _ => table.to_string(),
    }
}

/// Watermarks of every table read from one source database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkStore {
    /// Source database URL (sanitized - no password)
    pub source_url: String,
    /// Keyed by "schema.table", or the bare table name without a schema
    pub tables: HashMap<String, TableWatermark>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WatermarkStore {
    pub fn new(source_url: &str) -> Self {
        let now = Utc::now();
        Self {
            source_url: sanitize_url(source_url),
            tables: HashMap::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn get(&self, schema: Option<&str>, table: &str) -> Option<&TableWatermark> {
        self.tables.get(&state_key(schema, table))
    }

    /// Where to resume `table`: its last completed watermark, or the zero
    /// watermark for a table never read.
    pub fn resume_from(&self, schema: Option<&str>, table: &str) -> Watermark {
        self.get(schema, table)
            .map(|state| state.watermark)
            .unwrap_or_default()
    }

    /// Record a completed watermark after its rows were handled.
    pub fn record(
        &mut self,
        schema: Option<&str>,
        table: &str,
        watermark: Watermark,
        row_count: u64,
    ) {
        self.tables
            .entry(state_key(schema, table))
            .or_insert_with(|| TableWatermark::new(schema, table))
            .update(watermark, row_count);
        self.updated_at = Utc::now();
    }

    pub fn remove(&mut self, schema: Option<&str>, table: &str) -> Option<TableWatermark> {
        let removed = self.tables.remove(&state_key(schema, table));
        if removed.is_some() {
            self.updated_at = Utc::now();
        }
        removed
    }

    pub fn tracked_tables(&self) -> Vec<&str> {
        self.tables.keys().map(|s| s.as_str()).collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read watermark state from {:?}", path))?;
        let store: WatermarkStore = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse watermark state from {:?}", path))?;
        Ok(store)
    }

    /// Load `path`, or start empty when it does not exist yet.
    pub fn load_or_new(path: &Path, source_url: &str) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No watermark state at {:?}, starting from scratch", path);
            Ok(Self::new(source_url))
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize watermark state")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write watermark state to {:?}", path))?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(".table-window-extractor/watermarks.json")
    }
}

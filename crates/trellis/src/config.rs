//! Container configuration
//!
//! A data container is described by one JSON document: where the records live,
//! how verbose logging is, how sort keys are spaced and which tables exist.
//!
//! ```json
//! {
//!   "db_path": "trellis.db",
//!   "log_filter": "info,trellis_core=debug",
//!   "sorting": { "step": 128 },
//!   "messages": { "copy_of": "%s (Kopie)" },
//!   "tables": [{ "name": "tl_page", "fields": [{ "name": "pid", "value_type": "integer" }] }]
//! }
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use trellis_api::{SchemaRegistry, TableSchema};
use trellis_core::{MAX_SORTING, Messages, SORTING_STEP, SortKeyAllocator};

/// Overrides `db_path`.
pub const ENV_DB_PATH: &str = "TRELLIS_DB_PATH";
/// Overrides `log_filter`; also read directly by `telemetry::init_tracing`.
pub const ENV_LOG: &str = "TRELLIS_LOG";

pub const IN_MEMORY: &str = ":memory:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortingConfig {
    pub step: i64,
    pub max: i64,
}

impl Default for SortingConfig {
    fn default() -> Self {
        Self {
            step: SORTING_STEP,
            max: MAX_SORTING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    /// SQLite database file, or `:memory:`.
    pub db_path: String,
    /// `tracing_subscriber::EnvFilter` directive used when `TRELLIS_LOG` is unset.
    pub log_filter: String,
    pub sorting: SortingConfig,
    pub messages: Messages,
    pub tables: Vec<TableSchema>,
}

impl Default for TrellisConfig {
    fn default() -> Self {
        Self {
            db_path: IN_MEMORY.to_string(),
            log_filter: "info".to_string(),
            sorting: SortingConfig::default(),
            messages: Messages::default(),
            tables: Vec::new(),
        }
    }
}

impl TrellisConfig {
    /// Load a configuration file and apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?
            .with_env_overrides();
        config.validate()?;
        tracing::info!(
            "[TrellisConfig] loaded {} tables from {}",
            config.tables.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(db_path) = lookup(ENV_DB_PATH).filter(|v| !v.is_empty()) {
            tracing::debug!("[TrellisConfig] {} overrides db_path: {}", ENV_DB_PATH, db_path);
            self.db_path = db_path;
        }
        if let Some(filter) = lookup(ENV_LOG).filter(|v| !v.is_empty()) {
            self.log_filter = filter;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.sorting.step < 2 {
            bail!("sorting.step must be at least 2, got {}", self.sorting.step);
        }
        if self.sorting.max <= self.sorting.step {
            bail!(
                "sorting.max ({}) must exceed sorting.step ({})",
                self.sorting.max,
                self.sorting.step
            );
        }
        if !self.messages.copy_of.contains("%s") {
            bail!("messages.copy_of needs a %s placeholder");
        }

        let mut names = HashSet::new();
        for table in &self.tables {
            if !names.insert(table.name.as_str()) {
                bail!("table {} is declared twice", table.name);
            }
        }
        for table in &self.tables {
            for ctable in &table.ctables {
                if !names.contains(ctable.as_str()) {
                    bail!("table {} lists unknown child table {}", table.name, ctable);
                }
            }
            for field in table.mark_as_copy.iter().chain(&table.version_field) {
                if !table.has_field(field) {
                    bail!("table {} references undeclared field {}", table.name, field);
                }
            }
        }
        Ok(())
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path == IN_MEMORY
    }

    pub fn schema_registry(&self) -> SchemaRegistry {
        self.tables.iter().cloned().collect()
    }

    pub fn allocator(&self) -> SortKeyAllocator {
        SortKeyAllocator::new(self.sorting.step, self.sorting.max)
    }
}

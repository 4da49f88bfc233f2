use std::path::Path;

use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;

#[derive(Deserialize, Debug, PartialEq, Clone)]
pub struct PlatformConfig {
    pub catalog: Catalog,
    #[serde(default)]
    pub runtime: Runtime,
    /// Closed set of per-(dataset, table) behavioral overrides. Consulted
    /// once at synthesis time; tables not listed here get
    /// `TableBehavior::default()`.
    #[serde(default)]
    pub behaviors: Vec<TableBehavior>,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Catalog {
    #[cfg(feature = "catalog-postgres")]
    Postgres(Postgres),
    Sqlite(Sqlite),
}

#[cfg(feature = "catalog-postgres")]
#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Postgres {
    pub dsn: String,
    #[serde(default = "default_schema")]
    pub schema: String,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Sqlite {
    pub dsn: String,
}

#[cfg(feature = "catalog-postgres")]
fn default_schema() -> String {
    "public".to_string()
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Runtime {
    /// Capacity of the synthesized-table registry. Entries past this bound
    /// get evicted LRU-style instead of accumulating for the process
    /// lifetime.
    pub type_cache_capacity: u64,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            type_cache_capacity: 1024,
        }
    }
}

/// Behavioral override for one logical table, keyed by (dataset slug, table
/// name). This replaces per-dataset special-casing in code: the overridable
/// set is enumerated in configuration, not discovered at runtime.
#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TableBehavior {
    #[serde(default)]
    pub dataset: String,
    #[serde(default)]
    pub table: String,
    /// Full-text search language configuration. `simple` works without any
    /// installed dictionaries.
    #[serde(default = "default_search_language")]
    pub search_language: String,
    /// Force exact row counts for this table, opting out of the
    /// planner-statistics approximation on unfiltered listings.
    #[serde(default)]
    pub exact_count: bool,
}

impl Default for TableBehavior {
    fn default() -> Self {
        Self {
            dataset: String::new(),
            table: String::new(),
            search_language: default_search_language(),
            exact_count: false,
        }
    }
}

fn default_search_language() -> String {
    "simple".to_string()
}

pub fn build_config(source: File<config::FileSourceString, FileFormat>) -> Result<PlatformConfig, ConfigError> {
    Config::builder()
        .add_source(source)
        .build()?
        .try_deserialize()
}

pub fn load_config(path: &Path) -> Result<PlatformConfig, ConfigError> {
    let config_str = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::NotFound(format!("Error loading {}: {}", path.to_string_lossy(), e))
    })?;
    load_config_from_string(&config_str)
}

pub fn load_config_from_string(config_str: &str) -> Result<PlatformConfig, ConfigError> {
    build_config(File::from_str(config_str, FileFormat::Toml))
}

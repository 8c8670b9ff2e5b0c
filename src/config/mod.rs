// ABOUTME: Pipeline configuration loaded from TOML with ${VAR} environment interpolation
// ABOUTME: Describes the target warehouse, the tracking table, and every source with its tables

pub mod table;

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::source::Dialect;
use crate::sql::template::TemplateValue;

pub use table::{IndexSpec, ManualSql, PrimaryKeyConfig, Strategy, TableConfig, TableSpec};

/// Errors that prevent the configuration file from being used at all.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Undefined environment variable(s) referenced in config: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How `${VAR}` references without a value are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingEnv {
    /// Fail the load.
    Error,
    /// Leave the reference in place and log a warning (validate / print-sql).
    Allow,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// PostgreSQL-protocol URL of the warehouse.
    pub url: Option<String>,
    /// Environment variable holding the URL when `url` is absent.
    #[serde(default = "default_target_url_env")]
    pub url_env: String,
}

fn default_target_url_env() -> String {
    "TARGET_DATABASE_URL".to_string()
}

impl TargetConfig {
    pub fn resolve_url(&self) -> anyhow::Result<String> {
        resolve_url(self.url.as_deref(), &self.url_env, "target")
    }
}

/// Location of the watermark tracking table on the warehouse.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    #[serde(default = "default_index_schema")]
    pub schema: String,
    #[serde(default = "default_index_table")]
    pub table: String,
}

fn default_index_schema() -> String {
    "public".to_string()
}

fn default_index_table() -> String {
    "pipeline_table_index".to_string()
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            schema: default_index_schema(),
            table: default_index_table(),
        }
    }
}

/// One source database (`[[sources]]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Unique name of this source; part of every watermark key.
    pub alias: String,
    pub dialect: Dialect,
    pub url: Option<String>,
    /// Defaults to `<ALIAS>_DATABASE_URL`.
    pub url_env: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Values exposed to templates as `db.<key>`.
    #[serde(default)]
    pub data: BTreeMap<String, TemplateValue>,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn url_env_name(&self) -> String {
        self.url_env
            .clone()
            .unwrap_or_else(|| format!("{}_DATABASE_URL", self.alias.to_uppercase()))
    }

    /// Connection URL from `url` or the environment.
    pub fn resolve_url(&self) -> anyhow::Result<String> {
        resolve_url(self.url.as_deref(), &self.url_env_name(), &self.alias)
    }
}

fn resolve_url(url: Option<&str>, env_name: &str, what: &str) -> anyhow::Result<String> {
    if let Some(url) = url {
        return Ok(url.to_string());
    }
    std::env::var(env_name).map_err(|_| {
        anyhow::anyhow!(
            "No URL configured for {} and environment variable {} is not set",
            what,
            env_name
        )
    })
}

/// The whole pipeline file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub target: TargetConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl PipelineConfig {
    /// Read, interpolate, parse and check a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P, missing_env: MissingEnv) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content, missing_env)
    }

    pub fn from_toml_str(content: &str, missing_env: MissingEnv) -> Result<Self, ConfigError> {
        let mut value: toml::Value = toml::from_str(content)?;

        let mut missing = Vec::new();
        interpolate_value(&mut value, &mut |name: &str| std::env::var(name).ok(), &mut missing);
        missing.sort();
        missing.dedup();
        if !missing.is_empty() {
            match missing_env {
                MissingEnv::Error => return Err(ConfigError::MissingVariables(missing)),
                MissingEnv::Allow => tracing::warn!(
                    "Undefined environment variable(s) left unexpanded: {}",
                    missing.join(", ")
                ),
            }
        }

        let config: PipelineConfig = value.try_into()?;
        config.check()?;
        Ok(config)
    }

    /// File-level checks. Table-level invariants are reported by [`PipelineConfig::table_errors`].
    fn check(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            crate::utils::validate_identifier(&source.alias).map_err(|e| {
                ConfigError::Invalid(format!("source alias '{}': {}", source.alias, e))
            })?;
            if !seen.insert(source.alias.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source alias '{}'",
                    source.alias
                )));
            }

            let mut table_ids = std::collections::HashSet::new();
            for table in &source.tables {
                if !table_ids.insert(table.table_id()) {
                    return Err(ConfigError::Invalid(format!(
                        "source '{}' lists table '{}' more than once",
                        source.alias,
                        table.table_id()
                    )));
                }
            }
        }
        crate::utils::validate_identifier(&self.index.schema)
            .and_then(|_| crate::utils::validate_identifier(&self.index.table))
            .map_err(|e| ConfigError::Invalid(format!("index table: {}", e)))?;
        Ok(())
    }

    pub fn source(&self, alias: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.alias == alias)
    }

    /// Every table that fails validation, as (source alias, error).
    pub fn table_errors(&self) -> Vec<(String, crate::error::SyncError)> {
        self.sources
            .iter()
            .flat_map(|source| {
                source
                    .tables
                    .iter()
                    .filter_map(|table| table.validate(&source.alias).err())
                    .map(|err| (source.alias.clone(), err))
            })
            .collect()
    }
}

/// Replace `${NAME}` in every string of a TOML document.
fn interpolate_value(
    value: &mut toml::Value,
    lookup: &mut dyn FnMut(&str) -> Option<String>,
    missing: &mut Vec<String>,
) {
    match value {
        toml::Value::String(s) => *s = interpolate(s, lookup, missing),
        toml::Value::Array(items) => {
            for item in items {
                interpolate_value(item, lookup, missing);
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                interpolate_value(item, lookup, missing);
            }
        }
        _ => {}
    }
}

/// Expand `${NAME}` references in one string. Unknown names are left as-is and recorded.
pub fn interpolate(
    input: &str,
    lookup: &mut dyn FnMut(&str) -> Option<String>,
    missing: &mut Vec<String>,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        missing.push(name.to_string());
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

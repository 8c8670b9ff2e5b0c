// ABOUTME: Per-table configuration and its validated form
// ABOUTME: TableConfig is what the file says; TableSpec is what the engine may run

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::SyncError;
use crate::sql::template::TemplateValue;

/// Primary key given either as a single column name or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKeyConfig {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKeyConfig {
    pub fn columns(&self) -> Vec<String> {
        match self {
            PrimaryKeyConfig::Single(column) => vec![column.clone()],
            PrimaryKeyConfig::Composite(columns) => columns.clone(),
        }
    }
}

/// One `[[sources.tables]]` entry as written in the configuration file.
///
/// Validation is deferred to [`TableConfig::validate`] so that one invalid table does not
/// prevent its siblings from loading.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub source_table_name: Option<String>,
    pub destination_schema_name: Option<String>,
    pub destination_table_name: Option<String>,
    pub index_column: Option<String>,
    /// Templated query returning a single `index_value` column.
    pub index_sql: Option<String>,
    #[serde(default)]
    pub append_only: bool,
    #[serde(default)]
    pub full_refresh: bool,
    pub primary_key: Option<PrimaryKeyConfig>,
    /// Destination type per column name.
    #[serde(default)]
    pub type_overrides: BTreeMap<String, String>,
    /// Destination type per source type name.
    #[serde(default)]
    pub type_map: BTreeMap<String, String>,
    #[serde(default)]
    pub columns_to_drop: Vec<String>,
    #[serde(alias = "extract_query")]
    pub query: Option<String>,
    pub create_statement: Option<String>,
    pub truncate_statement: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, TemplateValue>,
    pub enabled: Option<bool>,
}

impl TableConfig {
    /// Identifier used for state tracking and reporting.
    pub fn table_id(&self) -> &str {
        self.source_table_name
            .as_deref()
            .or(self.destination_table_name.as_deref())
            .unwrap_or("<unnamed>")
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Check every invariant and produce the [`TableSpec`] the engine runs.
    ///
    /// `source_alias` is the default destination schema.
    pub fn validate(&self, source_alias: &str) -> Result<TableSpec, SyncError> {
        let table_id = self.table_id();
        let invalid = |message: &str| SyncError::configuration(table_id, message);

        let source_table = match self.source_table_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(invalid("source_table_name is required")),
        };

        let index = match (&self.index_column, &self.index_sql) {
            (Some(_), Some(_)) => {
                return Err(invalid("index_column and index_sql are mutually exclusive"))
            }
            (Some(column), None) => Some(IndexSpec::Column(column.clone())),
            (None, Some(sql)) => Some(IndexSpec::Expression(sql.clone())),
            (None, None) => None,
        };

        let strategy = if self.full_refresh {
            if self.append_only {
                return Err(invalid("full_refresh and append_only are mutually exclusive"));
            }
            if index.is_some() {
                return Err(invalid("full_refresh cannot be combined with an index"));
            }
            Strategy::FullRefresh
        } else if self.append_only {
            match index {
                Some(index) => Strategy::AppendOnly { index },
                None => return Err(invalid("append_only requires index_column or index_sql")),
            }
        } else {
            match index {
                Some(index) => Strategy::Indexed { index },
                None => {
                    return Err(invalid(
                        "incremental tables need index_column or index_sql (or set full_refresh)",
                    ))
                }
            }
        };

        let manual = match &self.query {
            Some(query) => Some(ManualSql {
                extract_query: query.clone(),
                create_statement: self.create_statement.clone(),
                truncate_statement: self.truncate_statement.clone(),
            }),
            None => {
                if self.create_statement.is_some() || self.truncate_statement.is_some() {
                    return Err(invalid(
                        "create_statement and truncate_statement require a query",
                    ));
                }
                None
            }
        };

        if manual.is_none() && matches!(strategy.index(), Some(IndexSpec::Expression(_))) {
            return Err(invalid("index_sql requires a manual query"));
        }

        let primary_key = self
            .primary_key
            .as_ref()
            .map(PrimaryKeyConfig::columns)
            .unwrap_or_default();

        if manual.is_some() && matches!(strategy, Strategy::Indexed { .. }) && primary_key.is_empty()
        {
            return Err(invalid("indexed tables with a manual query require a primary_key"));
        }

        if let Some(column) = primary_key
            .iter()
            .find(|pk| self.columns_to_drop.iter().any(|d| d.eq_ignore_ascii_case(pk)))
        {
            return Err(invalid(&format!(
                "primary key column '{}' is listed in columns_to_drop",
                column
            )));
        }

        let destination_schema = self
            .destination_schema_name
            .clone()
            .unwrap_or_else(|| source_alias.to_string());
        let destination_table = self.destination_table_name.clone().unwrap_or_else(|| {
            source_table
                .rsplit('.')
                .next()
                .unwrap_or(&source_table)
                .to_string()
        });
        for identifier in [&destination_schema, &destination_table] {
            crate::utils::validate_identifier(identifier)
                .map_err(|e| invalid(&format!("invalid destination name: {}", e)))?;
        }

        Ok(TableSpec {
            source_table,
            destination_schema,
            destination_table,
            strategy,
            primary_key,
            type_overrides: self.type_overrides.clone(),
            type_map: self.type_map.clone(),
            columns_to_drop: self.columns_to_drop.clone(),
            manual,
            data: self.data.clone(),
        })
    }
}

/// How the incremental index is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSpec {
    /// A source column; its `MAX()` bounds the window.
    Column(String),
    /// A templated query returning `index_value`.
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    FullRefresh,
    AppendOnly { index: IndexSpec },
    Indexed { index: IndexSpec },
}

impl Strategy {
    pub fn index(&self) -> Option<&IndexSpec> {
        match self {
            Strategy::FullRefresh => None,
            Strategy::AppendOnly { index } | Strategy::Indexed { index } => Some(index),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::FullRefresh => "full_refresh",
            Strategy::AppendOnly { .. } => "append_only",
            Strategy::Indexed { .. } => "indexed",
        }
    }
}

/// SQL supplied verbatim by the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualSql {
    pub extract_query: String,
    pub create_statement: Option<String>,
    pub truncate_statement: Option<String>,
}

/// A validated table configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    /// Source table, also the state key.
    pub source_table: String,
    pub destination_schema: String,
    pub destination_table: String,
    pub strategy: Strategy,
    pub primary_key: Vec<String>,
    pub type_overrides: BTreeMap<String, String>,
    pub type_map: BTreeMap<String, String>,
    pub columns_to_drop: Vec<String>,
    pub manual: Option<ManualSql>,
    pub data: BTreeMap<String, TemplateValue>,
}

impl TableSpec {
    pub fn index_column(&self) -> Option<&str> {
        match self.strategy.index() {
            Some(IndexSpec::Column(column)) => Some(column),
            _ => None,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.manual.is_some()
    }
}

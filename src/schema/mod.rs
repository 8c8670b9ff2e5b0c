// ABOUTME: Schema inspector - reads source column metadata and builds warehouse column schemas
// ABOUTME: Applies columns-to-drop, per-column overrides, source-type maps, then inferred types

pub mod types;

use anyhow::Result;

use crate::config::TableSpec;
use crate::error::SyncError;
use crate::source::{Dialect, SourceColumn, SourceConnection};

pub use types::map_type;

/// One column of a warehouse table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumn {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
}

/// Ordered warehouse columns for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnSchema {
    pub columns: Vec<TargetColumn>,
}

impl ColumnSchema {
    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Columns of a source table from its catalog.
pub async fn inspect_table(source: &dyn SourceConnection, table: &str) -> Result<Vec<SourceColumn>> {
    let columns = source.table_columns(table).await?;
    if columns.is_empty() {
        anyhow::bail!("Source table '{}' not found or has no columns", table);
    }
    tracing::debug!("Inspected {} column(s) of {}", columns.len(), table);
    Ok(columns)
}

/// Result-set columns of a query via a zero-row query; no data is fetched.
pub async fn inspect_query(source: &dyn SourceConnection, query: &str) -> Result<Vec<SourceColumn>> {
    let columns = source.describe_query(query).await?;
    if columns.is_empty() {
        anyhow::bail!("Query returns no columns");
    }
    Ok(columns)
}

fn lookup_ci<'a>(map: &'a std::collections::BTreeMap<String, String>, key: &str) -> Option<&'a String> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

/// Build the warehouse schema for `columns`.
///
/// Precedence per column: `type_overrides[column]`, then `type_map[source type]` (full type
/// name first, then its base name), then [`map_type`]. A column none of these can type is
/// an [`SyncError::UnsupportedType`].
pub fn build_column_schema(
    spec: &TableSpec,
    dialect: Dialect,
    columns: &[SourceColumn],
) -> Result<ColumnSchema, SyncError> {
    let mut schema = ColumnSchema::default();

    for column in columns {
        if spec
            .columns_to_drop
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&column.name))
        {
            tracing::debug!("Dropping column {} of {}", column.name, spec.source_table);
            continue;
        }

        let type_name = match lookup_ci(&spec.type_overrides, &column.name) {
            Some(overridden) => overridden.clone(),
            None => {
                let source_type = column.type_name.as_deref().unwrap_or_default();
                let base = source_type.split('(').next().unwrap_or_default().trim();
                lookup_ci(&spec.type_map, source_type.trim())
                    .or_else(|| lookup_ci(&spec.type_map, base))
                    .cloned()
                    .or_else(|| map_type(dialect, source_type, column.precision, column.scale))
                    .ok_or_else(|| SyncError::UnsupportedType {
                        table: spec.source_table.clone(),
                        column: column.name.clone(),
                        type_name: column
                            .type_name
                            .clone()
                            .unwrap_or_else(|| "<undeclared>".to_string()),
                    })?
            }
        };

        schema.columns.push(TargetColumn {
            name: column.name.clone(),
            type_name,
            nullable: column.nullable,
        });
    }

    if schema.is_empty() {
        return Err(SyncError::configuration(
            &spec.source_table,
            "every source column is dropped",
        ));
    }

    Ok(schema)
}

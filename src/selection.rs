// ABOUTME: Source and table selection from CLI flags
// ABOUTME: Explicitly selected sources and tables run even when disabled in the config

use anyhow::{bail, Result};

use crate::config::{PipelineConfig, SourceConfig, TableConfig};

/// Which sources and tables a run covers.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    database: Option<String>,
    tables: Option<Vec<String>>,
}

impl Selection {
    /// Selection from `--database` and `--tables`.
    pub fn new(database: Option<String>, tables: Option<Vec<String>>) -> Result<Self> {
        if tables.is_some() && database.is_none() {
            bail!("--tables requires --database");
        }
        if let Some(ref tables) = tables {
            if tables.iter().any(|t| t.trim().is_empty()) {
                bail!("--tables contains an empty table name");
            }
        }
        Ok(Self {
            database,
            tables: tables.map(|t| t.into_iter().map(|s| s.trim().to_string()).collect()),
        })
    }

    /// Every enabled source and table.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_explicit(&self) -> bool {
        self.database.is_some()
    }

    pub fn has_tables(&self) -> bool {
        self.tables.is_some()
    }

    pub fn includes_source(&self, source: &SourceConfig) -> bool {
        match &self.database {
            Some(database) => source.alias == *database,
            None => source.enabled,
        }
    }

    /// Matches on either the source or the destination table name.
    pub fn includes_table(&self, table: &TableConfig) -> bool {
        match &self.tables {
            Some(tables) => tables.iter().any(|t| {
                table.source_table_name.as_deref() == Some(t.as_str())
                    || table.destination_table_name.as_deref() == Some(t.as_str())
            }),
            None => table.is_enabled(),
        }
    }

    /// Fail if the selection names a source or table the configuration does not have.
    pub fn validate_against(&self, config: &PipelineConfig) -> Result<()> {
        let Some(database) = &self.database else {
            return Ok(());
        };
        let Some(source) = config.source(database) else {
            bail!(
                "Database '{}' is not configured (known: {})",
                database,
                config
                    .sources
                    .iter()
                    .map(|s| s.alias.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        };
        if let Some(tables) = &self.tables {
            for name in tables {
                let known = source.tables.iter().any(|t| {
                    t.source_table_name.as_deref() == Some(name.as_str())
                        || t.destination_table_name.as_deref() == Some(name.as_str())
                });
                if !known {
                    bail!("Table '{}' is not configured for database '{}'", name, database);
                }
            }
        }
        Ok(())
    }

    /// Selected sources of `config`, each with its selected tables.
    pub fn apply<'a>(&self, config: &'a PipelineConfig) -> Vec<(&'a SourceConfig, Vec<&'a TableConfig>)> {
        config
            .sources
            .iter()
            .filter(|source| self.includes_source(source))
            .map(|source| {
                let tables = source
                    .tables
                    .iter()
                    .filter(|table| self.includes_table(table))
                    .collect::<Vec<_>>();
                (source, tables)
            })
            .filter(|(_, tables)| !tables.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MissingEnv;

    const CONFIG: &str = r#"
[target]
url = "postgresql://u@h/warehouse"

[[sources]]
alias = "shop"
dialect = "postgres"

[[sources.tables]]
source_table_name = "public.orders"
destination_table_name = "orders"
full_refresh = true

[[sources.tables]]
source_table_name = "audit_log"
enabled = false
full_refresh = true

[[sources]]
alias = "legacy"
dialect = "sqlite"
enabled = false

[[sources.tables]]
source_table_name = "events"
full_refresh = true
"#;

    fn config() -> PipelineConfig {
        PipelineConfig::from_toml_str(CONFIG, MissingEnv::Error).unwrap()
    }

    #[test]
    fn test_tables_require_database() {
        assert!(Selection::new(None, Some(vec!["orders".into()])).is_err());
        assert!(Selection::new(Some("shop".into()), Some(vec!["".into()])).is_err());
    }

    #[test]
    fn test_default_selection_skips_disabled() {
        let config = config();
        let selected = Selection::all().apply(&config);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0.alias, "shop");
        assert_eq!(selected[0].1.len(), 1);
    }

    #[test]
    fn test_explicit_selection_overrides_enabled() {
        let config = config();

        let legacy = Selection::new(Some("legacy".into()), None).unwrap();
        let selected = legacy.apply(&config);
        assert_eq!(selected[0].0.alias, "legacy");

        let audit = Selection::new(Some("shop".into()), Some(vec!["audit_log".into()])).unwrap();
        let selected = audit.apply(&config);
        assert_eq!(selected[0].1[0].table_id(), "audit_log");

        // Destination names select too
        let by_dest = Selection::new(Some("shop".into()), Some(vec!["orders".into()])).unwrap();
        assert_eq!(by_dest.apply(&config)[0].1[0].table_id(), "public.orders");
    }

    #[test]
    fn test_validate_against_unknown_names() {
        let config = config();
        assert!(Selection::new(Some("crm".into()), None)
            .unwrap()
            .validate_against(&config)
            .is_err());
        assert!(Selection::new(Some("shop".into()), Some(vec!["nope".into()]))
            .unwrap()
            .validate_against(&config)
            .is_err());
        assert!(Selection::new(Some("shop".into()), Some(vec!["orders".into()]))
            .unwrap()
            .validate_against(&config)
            .is_ok());
    }
}

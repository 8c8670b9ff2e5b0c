// ABOUTME: In-memory warehouse used by tests and the engine's failure-injection scenarios
// ABOUTME: Emulates table DDL, staging, and transactional delete-then-insert loads

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    CreateTable, DeleteStrategy, LoadOutcome, LoadPlan, StagedLocation, StagingProvider, TableRef,
    TargetCatalog,
};
use crate::source::{ResultSet, SqlValue};

pub type MemoryRow = HashMap<String, SqlValue>;

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<MemoryRow>,
    grants: Vec<String>,
}

impl MemoryTable {
    fn column(&self, name: &str) -> Option<&String> {
        self.columns.iter().find(|c| c.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<TableRef, MemoryTable>,
    staged: HashMap<String, ResultSet>,
    next_stage: u64,
    fail_next_load: bool,
    statements: Vec<String>,
}

/// A warehouse held entirely in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<State>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("Memory warehouse mutex poisoned"))
    }

    /// Create a table directly, bypassing the engine.
    pub fn insert_table(&self, target: &TableRef, columns: &[&str], rows: Vec<Vec<SqlValue>>) -> Result<()> {
        let columns = columns.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        let rows = rows
            .into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect())
            .collect();
        self.lock()?.tables.insert(
            target.clone(),
            MemoryTable {
                columns,
                rows,
                grants: Vec::new(),
            },
        );
        Ok(())
    }

    /// Rows of a table, or `None` if it does not exist.
    pub fn rows(&self, target: &TableRef) -> Option<Vec<MemoryRow>> {
        self.lock()
            .ok()?
            .tables
            .get(target)
            .map(|t| t.rows.clone())
    }

    pub fn row_count(&self, target: &TableRef) -> Option<usize> {
        self.lock().ok()?.tables.get(target).map(|t| t.rows.len())
    }

    /// Record a privilege grant on a table; carried over by rebuilds.
    pub fn grant(&self, target: &TableRef, grant: &str) -> Result<()> {
        let mut state = self.lock()?;
        let table = state
            .tables
            .get_mut(target)
            .ok_or_else(|| anyhow!("Table {} does not exist", target))?;
        table.grants.push(grant.to_string());
        Ok(())
    }

    pub fn grants(&self, target: &TableRef) -> Vec<String> {
        self.lock()
            .ok()
            .and_then(|s| s.tables.get(target).map(|t| t.grants.clone()))
            .unwrap_or_default()
    }

    /// Make the next `bulk_load` fail without touching any table.
    pub fn fail_next_load(&self) {
        if let Ok(mut state) = self.lock() {
            state.fail_next_load = true;
        }
    }

    /// DDL and load statements seen so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.lock().map(|s| s.statements.clone()).unwrap_or_default()
    }
}

fn key_of(row: &MemoryRow, table: &MemoryTable, keys: &[String]) -> Vec<Option<String>> {
    keys.iter()
        .map(|k| {
            table
                .column(k)
                .and_then(|c| row.get(c))
                .and_then(SqlValue::to_text)
        })
        .collect()
}

#[async_trait]
impl TargetCatalog for MemoryWarehouse {
    async fn table_exists(&self, target: &TableRef) -> Result<bool> {
        Ok(self.lock()?.tables.contains_key(target))
    }

    async fn table_columns(&self, target: &TableRef) -> Result<Vec<String>> {
        let state = self.lock()?;
        let table = state
            .tables
            .get(target)
            .ok_or_else(|| anyhow!("Table {} does not exist", target))?;
        Ok(table.columns.clone())
    }

    async fn create_table(&self, create: &CreateTable) -> Result<()> {
        let mut state = self.lock()?;
        if state.tables.contains_key(&create.target) {
            bail!("relation {} already exists", create.target);
        }
        state.statements.push(create.sql.clone());
        state.tables.insert(
            create.target.clone(),
            MemoryTable {
                columns: create.columns.clone(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn rebuild_table(&self, create: &CreateTable) -> Result<()> {
        let mut state = self.lock()?;
        let grants = match state.tables.get(&create.target) {
            Some(old) => old.grants.clone(),
            None => bail!("Cannot rebuild {}: table does not exist", create.target),
        };
        state.statements.push(create.sql.clone());
        state.tables.insert(
            create.target.clone(),
            MemoryTable {
                columns: create.columns.clone(),
                rows: Vec::new(),
                grants,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl StagingProvider for MemoryWarehouse {
    async fn stage(&self, name: &str, rows: &ResultSet) -> Result<StagedLocation> {
        let mut state = self.lock()?;
        state.next_stage += 1;
        let uri = format!("memory://{}/{}", name, state.next_stage);
        state.staged.insert(uri.clone(), rows.clone());
        Ok(StagedLocation {
            uri,
            row_count: rows.len() as u64,
            columns: rows.columns.clone(),
        })
    }

    async fn bulk_load(&self, location: &StagedLocation, plan: &LoadPlan) -> Result<LoadOutcome> {
        let mut state = self.lock()?;
        if state.fail_next_load {
            state.fail_next_load = false;
            bail!("Injected load failure for {}", plan.target);
        }

        let staged = state
            .staged
            .remove(&location.uri)
            .ok_or_else(|| anyhow!("Nothing staged at {}", location.uri))?;
        if staged.len() as u64 != location.row_count {
            bail!(
                "Partial load: staged {} row(s) but found {}",
                location.row_count,
                staged.len()
            );
        }
        let staged = staged.project(&plan.columns)?;

        // Work on a copy so a failure leaves the table untouched
        let mut table = state
            .tables
            .get(&plan.target)
            .cloned()
            .ok_or_else(|| anyhow!("Table {} does not exist", plan.target))?;

        let before = table.rows.len();
        match &plan.delete {
            DeleteStrategy::None => {}
            DeleteStrategy::All | DeleteStrategy::Custom(_) => table.rows.clear(),
            DeleteStrategy::MatchingKeys(keys) => {
                let key_table = table.clone();
                let staged_keys = staged
                    .rows
                    .iter()
                    .map(|values| {
                        let row: MemoryRow =
                            plan.columns.iter().cloned().zip(values.iter().cloned()).collect();
                        key_of(&row, &key_table, keys)
                    })
                    .collect::<HashSet<_>>();
                table
                    .rows
                    .retain(|row| !staged_keys.contains(&key_of(row, &key_table, keys)));
            }
        }
        let rows_deleted = (before - table.rows.len()) as u64;

        for values in &staged.rows {
            let mut row = MemoryRow::new();
            for (column, value) in plan.columns.iter().zip(values) {
                let Some(name) = table.column(column) else {
                    bail!("column \"{}\" of relation {} does not exist", column, plan.target);
                };
                row.insert(name.clone(), value.clone());
            }
            table.rows.push(row);
        }

        if let Some(sql) = &plan.delete_sql {
            state.statements.push(sql.clone());
        }
        state.statements.push(plan.insert_sql.clone());
        state.tables.insert(plan.target.clone(), table);

        Ok(LoadOutcome {
            rows_inserted: staged.len() as u64,
            rows_deleted,
        })
    }
}

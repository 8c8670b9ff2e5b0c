// ABOUTME: Target warehouse collaborator traits: catalog/DDL and staging/bulk load
// ABOUTME: Implemented for PostgreSQL-protocol warehouses and for an in-memory test double

pub mod memory;
pub mod postgres;
pub mod staging;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

use crate::source::ResultSet;

pub use memory::MemoryWarehouse;
pub use postgres::PostgresWarehouse;

/// A schema-qualified warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    pub fn quoted(&self) -> String {
        crate::utils::quote_qualified(&self.schema, &self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// DDL for a new target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTable {
    pub target: TableRef,
    /// Complete CREATE TABLE statement.
    pub sql: String,
    /// Column names the statement creates, in order.
    pub columns: Vec<String>,
}

/// Rows written to the staging area, ready for bulk load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedLocation {
    pub uri: String,
    pub row_count: u64,
    pub columns: Vec<String>,
}

/// What to remove from the target before inserting staged rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteStrategy {
    /// Append only.
    None,
    /// Delete target rows whose key appears in the staged rows (upsert).
    MatchingKeys(Vec<String>),
    /// Delete every target row (full refresh).
    All,
    /// A user-supplied truncate statement replaces the generated delete.
    Custom(String),
}

/// Everything a staging provider needs to load one table in a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    pub target: TableRef,
    /// Transaction-local staging table the staged rows are copied into.
    pub staging_table: String,
    pub columns: Vec<String>,
    pub delete: DeleteStrategy,
    /// SQL form of `delete`, run after the staging copy and before the insert.
    pub delete_sql: Option<String>,
    pub insert_sql: String,
}

/// Row counts reported by a committed load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows_inserted: u64,
    pub rows_deleted: u64,
}

/// Catalog access and DDL on the target warehouse.
#[async_trait]
pub trait TargetCatalog: Send + Sync {
    async fn table_exists(&self, target: &TableRef) -> Result<bool>;

    /// Column names of an existing table, in ordinal order.
    async fn table_columns(&self, target: &TableRef) -> Result<Vec<String>>;

    /// Create a table (and its schema if needed) in one transaction.
    async fn create_table(&self, create: &CreateTable) -> Result<()>;

    /// Replace an existing table with a freshly created one in one transaction.
    ///
    /// Privileges granted on the old table are re-granted on the new one on a best-effort
    /// basis: grant options and grants the current role cannot make are dropped with a
    /// warning. Ownership is not transferred. This copy is lossy by contract.
    async fn rebuild_table(&self, create: &CreateTable) -> Result<()>;
}

/// Staging and transactional bulk load.
#[async_trait]
pub trait StagingProvider: Send + Sync {
    /// Write `rows` to the staging area under `name`.
    async fn stage(&self, name: &str, rows: &ResultSet) -> Result<StagedLocation>;

    /// Load staged rows per `plan`. The delete and the insert commit together or not at all;
    /// a copy that does not account for every staged row is an error.
    async fn bulk_load(&self, location: &StagedLocation, plan: &LoadPlan) -> Result<LoadOutcome>;
}

/// A complete target warehouse.
pub trait Warehouse: TargetCatalog + StagingProvider {}

impl<T: TargetCatalog + StagingProvider> Warehouse for T {}

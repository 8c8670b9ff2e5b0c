// ABOUTME: Source connection abstraction shared by all supported source dialects
// ABOUTME: Defines the value model, result sets, and the SourceConnection trait

pub mod mssql;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;

pub use self::mssql::MssqlSource;
pub use self::mysql::MysqlSource;
pub use self::postgres::PostgresSource;
pub use self::sqlite::SqliteSource;

/// SQL dialect of a source database.
///
/// The dialect drives identifier quoting and the source-to-warehouse type mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[serde(alias = "postgresql")]
    Postgres,
    Mysql,
    #[serde(alias = "sqlserver")]
    Mssql,
    Sqlite,
}

impl Dialect {
    /// Quote a single identifier the way this dialect expects.
    pub fn quote_ident(&self, identifier: &str) -> String {
        match self {
            Dialect::Mysql => crate::utils::quote_mysql_ident(identifier),
            Dialect::Mssql => format!("[{}]", identifier.replace(']', "]]")),
            Dialect::Postgres | Dialect::Sqlite => crate::utils::quote_ident(identifier),
        }
    }

    /// Quote a possibly schema-qualified table name (`schema.table`).
    pub fn quote_table(&self, table: &str) -> String {
        table
            .split('.')
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::Postgres => "postgres",
            Dialect::Mysql => "mysql",
            Dialect::Mssql => "mssql",
            Dialect::Sqlite => "sqlite",
        };
        f.write_str(name)
    }
}

/// A single value read from a source database.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(chrono::NaiveDate),
    Timestamp(chrono::NaiveDateTime),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text form accepted by the warehouse's text input functions.
    ///
    /// Returns `None` for NULL. Bytes use the `\x` hex form understood by `bytea`
    /// and stored verbatim by character columns.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
            SqlValue::Int(i) => Some(i.to_string()),
            SqlValue::UInt(u) => Some(u.to_string()),
            SqlValue::Float(f) => Some(f.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Bytes(b) => {
                let mut out = String::with_capacity(2 + b.len() * 2);
                out.push_str("\\x");
                for byte in b {
                    out.push_str(&format!("{:02x}", byte));
                }
                Some(out)
            }
            SqlValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            SqlValue::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        }
    }
}

/// Rows returned by a source query, with column names in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// First row's value for `column`, or `None` if there are no rows.
    pub fn first_value(&self, column: &str) -> Result<Option<&SqlValue>> {
        let Some(idx) = self.column_index(column) else {
            bail!(
                "Query result has no column named '{}' (columns: {})",
                column,
                self.columns.join(", ")
            );
        };
        Ok(self.rows.first().map(|row| &row[idx]))
    }

    /// Keep only `columns`, in the given order.
    pub fn project(&self, columns: &[String]) -> Result<ResultSet> {
        let mut indexes = Vec::with_capacity(columns.len());
        for column in columns {
            match self.column_index(column) {
                Some(idx) => indexes.push(idx),
                None => bail!("Column '{}' missing from extracted rows", column),
            }
        }
        Ok(ResultSet {
            columns: columns.to_vec(),
            rows: self
                .rows
                .iter()
                .map(|row| indexes.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        })
    }
}

/// Column metadata as reported by a source catalog or a described query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceColumn {
    pub name: String,
    /// Dialect-native type name, e.g. `int4`, `varchar`, `bigint(20) unsigned`.
    pub type_name: Option<String>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub nullable: bool,
}

impl SourceColumn {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: Some(type_name.to_string()),
            precision: None,
            scale: None,
            nullable: true,
        }
    }
}

/// Read access to one source database.
///
/// Implementations own their connection. Every call runs to completion; timeouts are the
/// driver's business and surface as ordinary errors.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Name of the connected database, exposed to templates as `run.db_name`.
    fn database_name(&self) -> &str;

    /// Run a query and return all rows.
    async fn query(&self, sql: &str) -> Result<ResultSet>;

    /// Columns of a table in ordinal order, from the source catalog.
    async fn table_columns(&self, table: &str) -> Result<Vec<SourceColumn>>;

    /// Result-set columns of an arbitrary query, without fetching any rows.
    async fn describe_query(&self, sql: &str) -> Result<Vec<SourceColumn>>;

    /// Primary key columns of a table in key order (empty if none).
    async fn primary_key(&self, table: &str) -> Result<Vec<String>>;
}

/// Wrap a query so it is guaranteed to return zero rows.
pub fn zero_row_query(sql: &str) -> String {
    format!(
        "SELECT * FROM ({}) AS _described WHERE 1 = 0",
        sql.trim().trim_end_matches(';').trim_end()
    )
}

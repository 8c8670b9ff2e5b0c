// ABOUTME: SQLite source connection built on rusqlite
// ABOUTME: Reads rows and declared column types from a local SQLite database file

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{zero_row_query, Dialect, ResultSet, SourceColumn, SourceConnection, SqlValue};

/// A SQLite source database.
///
/// rusqlite calls block, so every call runs on tokio's blocking pool with the connection
/// behind a shared mutex.
pub struct SqliteSource {
    conn: Arc<Mutex<Connection>>,
    database: String,
}

impl SqliteSource {
    /// Open a database file read-only.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open SQLite database '{}'", path))?;

        let database = Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("main")
            .to_string();

        Ok(Self::from_connection(conn, &database))
    }

    /// Wrap an already-open connection.
    pub fn from_connection(conn: Connection, database: &str) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            database: database.to_string(),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| anyhow!("SQLite connection mutex poisoned"))?;
            f(&conn)
        })
        .await
        .context("SQLite task failed")?
    }
}

/// One row of `pragma_table_info`.
struct ColumnInfo {
    name: String,
    declared: String,
    not_null: bool,
    pk_position: i64,
}

/// Column metadata for `table`, which may be qualified as `schema.table`.
fn table_info(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let (schema, name) = match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    };
    let sql = match schema {
        Some(_) => "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1, ?2) ORDER BY cid",
        None => "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
    };
    let mut stmt = conn
        .prepare(sql)
        .with_context(|| format!("Failed to read columns of '{}'", table))?;

    let read = |row: &rusqlite::Row<'_>| {
        Ok(ColumnInfo {
            name: row.get(0)?,
            declared: row.get(1)?,
            not_null: row.get::<_, i64>(2)? != 0,
            pk_position: row.get(3)?,
        })
    };
    let rows = match schema {
        Some(schema) => stmt.query_map(params![name, schema], read),
        None => stmt.query_map(params![name], read),
    }
    .context("Failed to query table_info")?
    .collect::<rusqlite::Result<Vec<_>>>()
    .context("Failed to collect column info")?;
    Ok(rows)
}

/// Strip an optional `sqlite:` URL scheme, leaving a filesystem path.
pub fn sqlite_path(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

fn sqlite_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Int(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Bytes(bytes.to_vec()),
    }
}

#[async_trait]
impl SourceConnection for SqliteSource {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    async fn query(&self, sql: &str) -> Result<ResultSet> {
        tracing::debug!("Running source query: {}", sql);
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .with_context(|| format!("Failed to prepare source query: {}", sql))?;

            let columns = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>();
            let width = columns.len();

            let rows = stmt
                .query_map([], |row| {
                    (0..width)
                        .map(|idx| row.get_ref(idx).map(sqlite_value))
                        .collect::<rusqlite::Result<Vec<_>>>()
                })
                .context("Failed to run source query")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read source rows")?;

            Ok(ResultSet { columns, rows })
        })
        .await
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<SourceColumn>> {
        let table = table.to_string();
        let info = self.with_conn(move |conn| table_info(conn, &table)).await?;

        Ok(info
            .into_iter()
            .map(|column| SourceColumn {
                name: column.name,
                // Columns declared without a type have an empty decltype
                type_name: if column.declared.trim().is_empty() {
                    None
                } else {
                    Some(column.declared)
                },
                precision: None,
                scale: None,
                nullable: !column.not_null,
            })
            .collect())
    }

    async fn describe_query(&self, sql: &str) -> Result<Vec<SourceColumn>> {
        let described = zero_row_query(sql);
        tracing::debug!("Describing query schema: {}", described);
        self.with_conn(move |conn| {
            let stmt = conn
                .prepare(&described)
                .context("Failed to describe query schema")?;

            Ok(stmt
                .columns()
                .iter()
                .map(|c| SourceColumn {
                    name: c.name().to_string(),
                    type_name: c.decl_type().map(String::from),
                    precision: None,
                    scale: None,
                    nullable: true,
                })
                .collect())
        })
        .await
    }

    async fn primary_key(&self, table: &str) -> Result<Vec<String>> {
        let table = table.to_string();
        let mut keyed = self
            .with_conn(move |conn| table_info(conn, &table))
            .await?
            .into_iter()
            .filter(|column| column.pk_position > 0)
            .collect::<Vec<_>>();
        keyed.sort_by_key(|column| column.pk_position);

        Ok(keyed.into_iter().map(|column| column.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> SqliteSource {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE events (
                 tenant INTEGER NOT NULL,
                 id INTEGER NOT NULL,
                 payload TEXT,
                 raw BLOB,
                 untyped,
                 PRIMARY KEY (tenant, id)
             );
             INSERT INTO events VALUES (1, 10, 'hello', x'cafe', NULL);
             INSERT INTO events VALUES (1, 11, NULL, NULL, 3.5);",
        )
        .unwrap();
        SqliteSource::from_connection(conn, "fixture")
    }

    #[test]
    fn test_sqlite_path_strips_scheme() {
        assert_eq!(sqlite_path("sqlite:///tmp/a.db"), "/tmp/a.db");
        assert_eq!(sqlite_path("sqlite:data.db"), "data.db");
        assert_eq!(sqlite_path("/tmp/b.db"), "/tmp/b.db");
    }

    #[tokio::test]
    async fn test_query_reads_typed_values() {
        let source = fixture();
        let rs = source
            .query("SELECT id, payload, raw, untyped FROM events ORDER BY id")
            .await
            .unwrap();

        assert_eq!(rs.columns, vec!["id", "payload", "raw", "untyped"]);
        assert_eq!(
            rs.rows[0],
            vec![
                SqlValue::Int(10),
                SqlValue::Text("hello".into()),
                SqlValue::Bytes(vec![0xca, 0xfe]),
                SqlValue::Null,
            ]
        );
        assert_eq!(rs.rows[1][3], SqlValue::Float(3.5));
    }

    #[tokio::test]
    async fn test_table_columns_and_primary_key() {
        let source = fixture();
        let columns = source.table_columns("events").await.unwrap();
        let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["tenant", "id", "payload", "raw", "untyped"]);
        assert_eq!(columns[0].type_name.as_deref(), Some("INTEGER"));
        assert!(!columns[0].nullable);
        assert_eq!(columns[4].type_name, None);

        assert_eq!(source.primary_key("events").await.unwrap(), vec!["tenant", "id"]);
    }

    #[tokio::test]
    async fn test_schema_qualified_table_names() {
        let source = fixture();
        let columns = source.table_columns("main.events").await.unwrap();
        assert_eq!(columns.len(), 5);
        assert_eq!(
            source.primary_key("main.events").await.unwrap(),
            vec!["tenant", "id"]
        );

        // A dotted name is a schema and a table, never one quoted identifier
        assert!(source.table_columns("main.missing").await.unwrap().is_empty());
        assert!(source.primary_key("main.missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_described_query_reports_declared_types() {
        let source = fixture();
        let described = source
            .describe_query("SELECT id, payload, count(*) AS n FROM events GROUP BY id, payload")
            .await
            .unwrap();
        assert_eq!(described[0].type_name.as_deref(), Some("INTEGER"));
        assert_eq!(described[1].type_name.as_deref(), Some("TEXT"));
        // Expressions carry no declared type
        assert_eq!(described[2].type_name, None);
    }
}

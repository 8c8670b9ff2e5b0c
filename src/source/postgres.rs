// ABOUTME: PostgreSQL source connection built on tokio-postgres
// ABOUTME: Reads rows in text form and introspects columns via information_schema and prepare

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::{Client, SimpleQueryMessage};

use super::{zero_row_query, Dialect, ResultSet, SourceColumn, SourceConnection, SqlValue};

/// A PostgreSQL source database.
///
/// Rows are fetched with the simple query protocol so every value arrives in PostgreSQL's
/// canonical text form, which is exactly what the warehouse's `COPY ... CSV` expects.
pub struct PostgresSource {
    client: Client,
    database: String,
}

impl PostgresSource {
    pub fn new(client: Client, database: &str) -> Self {
        Self {
            client,
            database: database.to_string(),
        }
    }

    /// Connect to a source database URL, retrying transient failures.
    pub async fn connect(url: &str) -> Result<Self> {
        let database = crate::utils::postgres_dbname(url)?.unwrap_or_else(|| "postgres".to_string());
        let client = crate::postgres::connect_with_retry(url)
            .await
            .context("Failed to connect to PostgreSQL source")?;
        Ok(Self::new(client, &database))
    }
}

/// Split `schema.table` into an optional schema and the table name.
fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

#[async_trait]
impl SourceConnection for PostgresSource {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    async fn query(&self, sql: &str) -> Result<ResultSet> {
        tracing::debug!("Running source query: {}", sql);

        // Prepare first so column names are known even when no rows come back
        let statement = self
            .client
            .prepare(sql)
            .await
            .with_context(|| format!("Failed to prepare source query: {}", sql))?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect::<Vec<_>>();

        let messages = self
            .client
            .simple_query(sql)
            .await
            .context("Failed to run source query")?;

        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let values = (0..row.len())
                    .map(|idx| match row.get(idx) {
                        Some(text) => SqlValue::Text(text.to_string()),
                        None => SqlValue::Null,
                    })
                    .collect();
                rows.push(values);
            }
        }

        Ok(ResultSet { columns, rows })
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<SourceColumn>> {
        let (schema, name) = split_table(table);
        let rows = self
            .client
            .query(
                "SELECT column_name::text,
                        udt_name::text,
                        character_maximum_length::int4,
                        numeric_precision::int4,
                        numeric_scale::int4,
                        is_nullable::text
                 FROM information_schema.columns
                 WHERE table_schema = COALESCE($1::text, current_schema())
                   AND table_name = $2
                 ORDER BY ordinal_position",
                &[&schema, &name],
            )
            .await
            .with_context(|| format!("Failed to get columns for {}", table))?;

        Ok(rows
            .iter()
            .map(|row| {
                let udt: String = row.get(1);
                let char_len: Option<i32> = row.get(2);
                let numeric_precision: Option<i32> = row.get(3);
                let numeric_scale: Option<i32> = row.get(4);
                let is_numeric = udt == "numeric";
                SourceColumn {
                    name: row.get(0),
                    precision: if is_numeric {
                        numeric_precision.map(|p| p as u32)
                    } else {
                        char_len.map(|l| l as u32)
                    },
                    scale: if is_numeric {
                        numeric_scale.map(|s| s as u32)
                    } else {
                        None
                    },
                    type_name: Some(udt),
                    nullable: row.get::<_, String>(5) == "YES",
                }
            })
            .collect())
    }

    async fn describe_query(&self, sql: &str) -> Result<Vec<SourceColumn>> {
        let described = zero_row_query(sql);
        tracing::debug!("Describing query schema: {}", described);
        let statement = self
            .client
            .prepare(&described)
            .await
            .context("Failed to describe query schema")?;

        Ok(statement
            .columns()
            .iter()
            .map(|c| SourceColumn::new(c.name(), c.type_().name()))
            .collect())
    }

    async fn primary_key(&self, table: &str) -> Result<Vec<String>> {
        let (schema, name) = split_table(table);
        let rows = self
            .client
            .query(
                "SELECT a.attname::text
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = COALESCE($1::text, current_schema())
                   AND c.relname = $2
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&schema, &name],
            )
            .await
            .with_context(|| format!("Failed to get primary key for {}", table))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_table() {
        assert_eq!(split_table("public.users"), (Some("public"), "users"));
        assert_eq!(split_table("users"), (None, "users"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_source_reads_rows() {
        let url = std::env::var("TEST_SOURCE_URL").unwrap();
        let source = PostgresSource::connect(&url).await.unwrap();

        let rs = source.query("SELECT 1 AS one, NULL::text AS nothing").await.unwrap();
        assert_eq!(rs.columns, vec!["one", "nothing"]);
        assert_eq!(rs.rows, vec![vec![SqlValue::Text("1".into()), SqlValue::Null]]);

        let described = source.describe_query("SELECT 1::int8 AS big").await.unwrap();
        assert_eq!(described[0].type_name.as_deref(), Some("int8"));
    }
}

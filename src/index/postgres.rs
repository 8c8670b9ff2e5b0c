// ABOUTME: PostgreSQL-backed IndexStore kept in a tracking table on the warehouse
// ABOUTME: Creates the table lazily and upserts one row per (datastore_name, table_name)

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio_postgres::Client;

use super::{IndexStore, IndexValue};
use crate::utils::quote_qualified;

/// Watermarks stored in `<schema>.<table>` on the target warehouse.
///
/// The client is shared with the worker's warehouse connection.
pub struct PostgresIndexStore {
    client: Arc<Mutex<Client>>,
    qualified_table: String,
    ensured: OnceCell<()>,
}

impl PostgresIndexStore {
    pub fn new(client: Arc<Mutex<Client>>, schema: &str, table: &str) -> Self {
        Self {
            client,
            qualified_table: quote_qualified(schema, table),
            ensured: OnceCell::new(),
        }
    }

    async fn ensure_table(&self) -> Result<()> {
        self.ensured
            .get_or_try_init(|| async {
                let client = self.client.lock().await;
                client
                    .batch_execute(&create_tracking_table_sql(&self.qualified_table))
                    .await
                    .with_context(|| {
                        format!("Failed to create tracking table {}", self.qualified_table)
                    })
            })
            .await
            .map(|_| ())
    }
}

fn create_tracking_table_sql(qualified_table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            datastore_name VARCHAR(255) NOT NULL,
            table_name VARCHAR(255) NOT NULL,
            index_value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT NOW(),
            PRIMARY KEY (datastore_name, table_name)
        )",
        qualified_table
    )
}

#[async_trait]
impl IndexStore for PostgresIndexStore {
    async fn get(&self, source_alias: &str, table_id: &str) -> Result<Option<IndexValue>> {
        self.ensure_table().await?;
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT index_value FROM {} WHERE datastore_name = $1 AND table_name = $2",
                    self.qualified_table
                ),
                &[&source_alias, &table_id],
            )
            .await
            .with_context(|| format!("Failed to read watermark for {}.{}", source_alias, table_id))?;

        Ok(row
            .and_then(|r| r.get::<_, Option<String>>(0))
            .map(|text| IndexValue::parse(&text)))
    }

    async fn set(&self, source_alias: &str, table_id: &str, value: &IndexValue) -> Result<()> {
        self.ensure_table().await?;
        let client = self.client.lock().await;
        client
            .execute(
                &format!(
                    "INSERT INTO {} (datastore_name, table_name, index_value, updated_at)
                     VALUES ($1, $2, $3, NOW())
                     ON CONFLICT (datastore_name, table_name)
                     DO UPDATE SET index_value = EXCLUDED.index_value, updated_at = NOW()",
                    self.qualified_table
                ),
                &[&source_alias, &table_id, &value.as_text()],
            )
            .await
            .with_context(|| {
                format!("Failed to write watermark for {}.{}", source_alias, table_id)
            })?;

        tracing::debug!(
            "Watermark for {}.{} set to {}",
            source_alias,
            table_id,
            value
        );
        Ok(())
    }
}

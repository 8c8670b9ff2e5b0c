// ABOUTME: PostgreSQL-protocol warehouse: catalog queries, transactional DDL, COPY bulk loads
// ABOUTME: Rows are staged as local CSV files and copied into a transaction-local staging table

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use super::staging::{StagingArea, NULL_MARKER};
use super::{
    CreateTable, LoadOutcome, LoadPlan, StagedLocation, StagingProvider, TableRef, TargetCatalog,
};
use crate::postgres::privileges::{check_table_owner, fetch_table_acl, parse_table_acl, replay_grants};
use crate::source::ResultSet;
use crate::utils::{quote_ident, quote_qualified};

const COPY_CHUNK_SIZE: usize = 64 * 1024;
const MAX_IDENTIFIER_LEN: usize = 63;

/// Warehouse reached over the PostgreSQL wire protocol.
///
/// The client may be shared with a [`crate::index::PostgresIndexStore`]; every operation
/// holds the lock for the duration of its transaction.
pub struct PostgresWarehouse {
    client: Arc<Mutex<Client>>,
    staging: StagingArea,
}

impl PostgresWarehouse {
    pub fn new(client: Arc<Mutex<Client>>) -> Result<Self> {
        Ok(Self {
            client,
            staging: StagingArea::new()?,
        })
    }
}

/// Name the old table is moved to while its replacement is created.
fn replaced_table_name(table: &str) -> String {
    const SUFFIX: &str = "__replaced";
    let mut end = table.len().min(MAX_IDENTIFIER_LEN - SUFFIX.len());
    while !table.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &table[..end], SUFFIX)
}

fn copy_sql(staging_table: &str, columns: &[String]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv, NULL '{}')",
        quote_ident(staging_table),
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        NULL_MARKER
    )
}

fn staged_path(location: &StagedLocation) -> PathBuf {
    PathBuf::from(location.uri.strip_prefix("file://").unwrap_or(&location.uri))
}

#[async_trait]
impl TargetCatalog for PostgresWarehouse {
    async fn table_exists(&self, target: &TableRef) -> Result<bool> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                )",
                &[&target.schema, &target.table],
            )
            .await
            .with_context(|| format!("Failed to check whether {} exists", target))?;
        Ok(row.get(0))
    }

    async fn table_columns(&self, target: &TableRef) -> Result<Vec<String>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT column_name::text FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&target.schema, &target.table],
            )
            .await
            .with_context(|| format!("Failed to read columns of {}", target))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn create_table(&self, create: &CreateTable) -> Result<()> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin transaction")?;

        tx.batch_execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&create.target.schema)
        ))
        .await
        .with_context(|| format!("Failed to create schema {}", create.target.schema))?;

        tracing::debug!("{}", create.sql);
        tx.batch_execute(&create.sql)
            .await
            .with_context(|| format!("Failed to create table {}", create.target))?;

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit creation of {}", create.target))?;
        tracing::info!("Created table {}", create.target);
        Ok(())
    }

    async fn rebuild_table(&self, create: &CreateTable) -> Result<()> {
        let target = &create.target;
        let mut client = self.client.lock().await;
        let mut tx = client
            .transaction()
            .await
            .context("Failed to begin transaction")?;

        check_table_owner(&tx, &target.schema, &target.table).await?;
        let (owner, acl) = fetch_table_acl(&tx, &target.schema, &target.table)
            .await?
            .ok_or_else(|| anyhow!("Table {} does not exist", target))?;
        let grants = acl
            .as_deref()
            .map(|acl| parse_table_acl(acl, &owner))
            .unwrap_or_default();

        let replaced = replaced_table_name(&target.table);
        tx.batch_execute(&format!(
            "ALTER TABLE {} RENAME TO {}",
            target.quoted(),
            quote_ident(&replaced)
        ))
        .await
        .with_context(|| format!("Failed to move {} aside", target))?;

        tracing::debug!("{}", create.sql);
        tx.batch_execute(&create.sql)
            .await
            .with_context(|| format!("Failed to create replacement for {}", target))?;

        let applied = replay_grants(&mut tx, &target.schema, &target.table, &grants).await?;
        if applied < grants.len() {
            tracing::warn!(
                "Replayed {} of {} grant(s) on {}",
                applied,
                grants.len(),
                target
            );
        }

        tx.batch_execute(&format!(
            "DROP TABLE {}",
            quote_qualified(&target.schema, &replaced)
        ))
        .await
        .with_context(|| format!("Failed to drop previous version of {}", target))?;

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit rebuild of {}", target))?;
        tracing::info!("Rebuilt table {}", target);
        Ok(())
    }
}

#[async_trait]
impl StagingProvider for PostgresWarehouse {
    async fn stage(&self, name: &str, rows: &ResultSet) -> Result<StagedLocation> {
        let (path, row_count) = self.staging.write(name, rows)?;
        Ok(StagedLocation {
            uri: format!("file://{}", path.display()),
            row_count,
            columns: rows.columns.clone(),
        })
    }

    async fn bulk_load(&self, location: &StagedLocation, plan: &LoadPlan) -> Result<LoadOutcome> {
        let path = staged_path(location);
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read staging file {}", path.display()))?;

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin load transaction")?;

        // Serialises loads from several sources into one table
        tx.batch_execute(&format!(
            "LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE",
            plan.target.quoted()
        ))
        .await
        .with_context(|| format!("Failed to lock {}", plan.target))?;

        tx.batch_execute(&format!(
            "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
            quote_ident(&plan.staging_table),
            plan.target.quoted()
        ))
        .await
        .with_context(|| format!("Failed to create staging table {}", plan.staging_table))?;

        let sink = tx
            .copy_in(copy_sql(&plan.staging_table, &plan.columns).as_str())
            .await
            .with_context(|| format!("Failed to start COPY into {}", plan.staging_table))?;
        futures::pin_mut!(sink);
        for chunk in data.chunks(COPY_CHUNK_SIZE) {
            sink.send(Bytes::copy_from_slice(chunk))
                .await
                .context("Failed to stream staged rows")?;
        }
        let copied = sink.finish().await.context("Failed to finish COPY")?;

        if copied != location.row_count {
            bail!(
                "Partial load into {}: staged {} row(s) but copied {}",
                plan.target,
                location.row_count,
                copied
            );
        }

        let rows_deleted = match &plan.delete_sql {
            Some(sql) => {
                tracing::debug!("{}", sql);
                tx.execute(sql.as_str(), &[])
                    .await
                    .with_context(|| format!("Failed to delete from {}", plan.target))?
            }
            None => 0,
        };

        tracing::debug!("{}", plan.insert_sql);
        let rows_inserted = tx
            .execute(plan.insert_sql.as_str(), &[])
            .await
            .with_context(|| format!("Failed to insert into {}", plan.target))?;

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit load into {}", plan.target))?;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!("Failed to remove staging file {}: {}", path.display(), e);
        }

        Ok(LoadOutcome {
            rows_inserted,
            rows_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaced_table_name_fits_identifier_limit() {
        assert_eq!(replaced_table_name("orders"), "orders__replaced");
        let long = "t".repeat(70);
        assert_eq!(replaced_table_name(&long).len(), MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn test_copy_sql() {
        assert_eq!(
            copy_sql("shop_orders_staging", &["id".to_string(), "note".to_string()]),
            "COPY \"shop_orders_staging\" (\"id\", \"note\") FROM STDIN WITH (FORMAT csv, NULL '\\N')"
        );
    }

    #[test]
    fn test_staged_path_strips_scheme() {
        let location = StagedLocation {
            uri: "file:///tmp/x/orders.csv".into(),
            row_count: 0,
            columns: vec![],
        };
        assert_eq!(staged_path(&location), PathBuf::from("/tmp/x/orders.csv"));
    }
}

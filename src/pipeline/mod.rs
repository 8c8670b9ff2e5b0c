// ABOUTME: Pipeline orchestrator - runs every selected source with a bounded worker pool
// ABOUTME: Tables of one source run sequentially; sources run on spawned tasks up to the worker limit

pub mod report;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};

use crate::config::{IndexConfig, PipelineConfig, SourceConfig, TableConfig};
use crate::error::SyncError;
use crate::events::{EventSink, SyncEvent};
use crate::index::{IndexStore, PostgresIndexStore};
use crate::selection::Selection;
use crate::source::{Dialect, MssqlSource, MysqlSource, PostgresSource, SourceConnection, SqliteSource};
use crate::sync::{error_chain, RunOptions, SyncStage, TableOutcome, TableSync};
use crate::warehouse::{PostgresWarehouse, Warehouse};

pub use report::RunReport;

/// Default number of sources synchronized at once.
pub const DEFAULT_WORKERS: usize = 4;

/// Connections owned by one worker for the duration of one source.
pub struct WorkerConnections {
    pub source: Box<dyn SourceConnection>,
    pub warehouse: Box<dyn Warehouse>,
    pub index: Box<dyn IndexStore>,
}

/// Opens a worker's connections for a source.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, source: &SourceConfig) -> Result<WorkerConnections>;
}

/// Opens real database connections: the source by dialect, and one target connection
/// shared by the warehouse and the index store.
pub struct DatabaseConnectionFactory {
    target_url: String,
    index: IndexConfig,
}

impl DatabaseConnectionFactory {
    pub fn new(target_url: String, index: IndexConfig) -> Self {
        Self { target_url, index }
    }
}

/// Open a source connection for `source`.
pub async fn connect_source(source: &SourceConfig) -> Result<Box<dyn SourceConnection>> {
    let url = source.resolve_url()?;
    tracing::info!(
        "Connecting to {} source '{}' at {}",
        source.dialect,
        source.alias,
        crate::utils::redact_url(&url)
    );

    let connection: Box<dyn SourceConnection> = match source.dialect {
        Dialect::Postgres => {
            crate::utils::validate_connection_string(&url)?;
            Box::new(PostgresSource::connect(&url).await?)
        }
        Dialect::Mysql => Box::new(MysqlSource::connect(&url)?),
        Dialect::Mssql => Box::new(MssqlSource::connect(&url).await?),
        Dialect::Sqlite => Box::new(SqliteSource::open(crate::source::sqlite::sqlite_path(&url))?),
    };
    Ok(connection)
}

#[async_trait]
impl ConnectionFactory for DatabaseConnectionFactory {
    async fn connect(&self, source: &SourceConfig) -> Result<WorkerConnections> {
        let source_connection = connect_source(source)
            .await
            .with_context(|| format!("Failed to connect to source '{}'", source.alias))?;

        let client = crate::postgres::connect_with_retry(&self.target_url)
            .await
            .context("Failed to connect to target warehouse")?;
        let client = Arc::new(Mutex::new(client));

        Ok(WorkerConnections {
            source: source_connection,
            warehouse: Box::new(PostgresWarehouse::new(client.clone())?),
            index: Box::new(PostgresIndexStore::new(
                client,
                &self.index.schema,
                &self.index.table,
            )),
        })
    }
}

/// One run over the selected sources of a configuration.
///
/// Each source runs on its own task; a semaphore holds the number of sources with open
/// connections at the worker limit.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    factory: Arc<dyn ConnectionFactory>,
    events: Arc<dyn EventSink>,
    selection: Selection,
    options: RunOptions,
    workers: usize,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        factory: Arc<dyn ConnectionFactory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            factory,
            events,
            selection: Selection::all(),
            options: RunOptions::default(),
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Run every selected table and collect the outcomes.
    pub async fn run(&self) -> RunReport {
        let started = Instant::now();
        let sources = self.selection.apply(&self.config);
        if sources.is_empty() {
            tracing::warn!("No enabled sources or tables selected; nothing to do");
            return RunReport::new(Vec::new(), started.elapsed());
        }

        let workers = self.workers.max(1).min(sources.len());
        tracing::info!(
            "Syncing {} source(s) with {} worker(s)",
            sources.len(),
            workers
        );

        let permits = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(sources.len());
        for (source, tables) in sources {
            let worker = SourceWorker {
                source: source.clone(),
                tables: tables.into_iter().cloned().collect(),
                factory: self.factory.clone(),
                events: self.events.clone(),
                options: self.options,
            };
            let permits = permits.clone();
            let tables = worker.tables.clone();
            let alias = source.alias.clone();
            let handle = tokio::spawn(async move {
                // Released after the worker's connections are dropped
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return worker.fail_all(&anyhow!("worker pool closed: {}", e)),
                };
                worker.run().await
            });
            handles.push((alias, tables, handle));
        }

        let mut outcomes = Vec::new();
        for (alias, tables, handle) in handles {
            match handle.await {
                Ok(source_outcomes) => outcomes.extend(source_outcomes),
                Err(e) => {
                    tracing::error!("✗ Worker for source '{}' aborted: {}", alias, e);
                    let error = anyhow!("worker task aborted: {}", e);
                    outcomes.extend(
                        tables
                            .iter()
                            .map(|table| connection_failure(self.events.as_ref(), &alias, table, &error)),
                    );
                }
            }
        }

        RunReport::new(outcomes, started.elapsed())
    }
}

/// Everything one source's task owns.
struct SourceWorker {
    source: SourceConfig,
    tables: Vec<TableConfig>,
    factory: Arc<dyn ConnectionFactory>,
    events: Arc<dyn EventSink>,
    options: RunOptions,
}

impl SourceWorker {
    async fn run(&self) -> Vec<TableOutcome> {
        let connections = match self.factory.connect(&self.source).await {
            Ok(connections) => connections,
            Err(e) => {
                tracing::error!("Could not connect for source '{}': {:?}", self.source.alias, e);
                return self.fail_all(&e);
            }
        };

        let sync = TableSync::new(
            &self.source.alias,
            &self.source.data,
            connections.source.as_ref(),
            connections.warehouse.as_ref(),
            connections.index.as_ref(),
            self.events.as_ref(),
        )
        .with_options(self.options);

        let mut outcomes = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            outcomes.push(sync.run(table).await);
        }
        outcomes
    }

    fn fail_all(&self, error: &anyhow::Error) -> Vec<TableOutcome> {
        self.tables
            .iter()
            .map(|table| connection_failure(self.events.as_ref(), &self.source.alias, table, error))
            .collect()
    }
}

fn connection_failure(
    events: &dyn EventSink,
    source_alias: &str,
    table: &TableConfig,
    error: &anyhow::Error,
) -> TableOutcome {
    let error = SyncError::connection(table.table_id(), anyhow!("{:#}", error));
    events.emit(&SyncEvent::TableFailed {
        source: source_alias.to_string(),
        table: table.table_id().to_string(),
        stage: SyncStage::Connect,
        kind: error.kind(),
        error: error_chain(&error),
    });
    TableOutcome::failed(source_alias, table.table_id(), SyncStage::Connect, error)
}

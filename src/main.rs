// ABOUTME: CLI entry point for warehouse-replicator
// ABOUTME: Parses commands and routes to run, validate, and print-sql handlers

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use warehouse_replicator::config::{MissingEnv, PipelineConfig};
use warehouse_replicator::events::TracingSink;
use warehouse_replicator::index::MemoryIndexStore;
use warehouse_replicator::pipeline::{self, DatabaseConnectionFactory, Pipeline, DEFAULT_WORKERS};
use warehouse_replicator::selection::Selection;
use warehouse_replicator::sync::{error_chain, RunOptions, TableSync};
use warehouse_replicator::warehouse::MemoryWarehouse;

#[derive(Parser)]
#[command(name = "warehouse-replicator")]
#[command(about = "Incremental multi-source database to warehouse table sync", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every enabled table (or the selected ones) into the warehouse
    Run {
        /// Pipeline configuration file
        #[arg(long)]
        config: PathBuf,
        /// Only sync this source alias (runs even if disabled)
        #[arg(long)]
        database: Option<String>,
        /// Only sync these tables of --database (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
        /// Reload the selected tables completely
        #[arg(long)]
        full_refresh: bool,
        /// Recreate the selected target tables, then reload them
        #[arg(long)]
        rebuild: bool,
        /// Maximum number of source databases synced at once
        #[arg(long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
    },
    /// Check the configuration without connecting to any database
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the SQL a run would execute (reads source catalogs only)
    PrintSql {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        database: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    // Staging directories left behind by killed processes
    if let Err(e) = warehouse_replicator::utils::cleanup_stale_temp_dirs(86400) {
        tracing::warn!("Failed to clean up stale temp directories: {}", e);
    }

    warehouse_replicator::postgres::connection::init_tls_policy(cli.allow_self_signed_certs);

    match cli.command {
        Commands::Run {
            config,
            database,
            tables,
            full_refresh,
            rebuild,
            workers,
        } => {
            if (full_refresh || rebuild) && tables.is_none() {
                bail!("--full-refresh and --rebuild require --tables");
            }
            let selection = Selection::new(database, tables)?;
            run(
                &config,
                selection,
                RunOptions {
                    full_refresh,
                    rebuild,
                },
                workers,
            )
            .await
        }
        Commands::Validate { config } => validate(&config),
        Commands::PrintSql {
            config,
            database,
            tables,
        } => {
            let selection = Selection::new(database, tables)?;
            print_sql(&config, selection).await
        }
    }
}

async fn run(
    config_path: &Path,
    selection: Selection,
    options: RunOptions,
    workers: usize,
) -> anyhow::Result<()> {
    let config = PipelineConfig::from_file(config_path, MissingEnv::Error)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    selection.validate_against(&config)?;

    for (alias, error) in config.table_errors() {
        tracing::warn!("Table in source '{}' will fail: {}", alias, error);
    }

    let target_url = config.target.resolve_url()?;
    warehouse_replicator::utils::validate_connection_string(&target_url)?;
    tracing::info!(
        "Target warehouse: {}",
        warehouse_replicator::utils::redact_url(&target_url)
    );

    let factory = Arc::new(DatabaseConnectionFactory::new(target_url, config.index.clone()));
    let report = Pipeline::new(Arc::new(config), factory, Arc::new(TracingSink))
        .with_selection(selection)
        .with_options(options)
        .with_workers(workers)
        .run()
        .await;

    report.log_summary();
    if report.has_failures() {
        bail!("{} table(s) failed", report.failed().count());
    }
    Ok(())
}

fn validate(config_path: &Path) -> anyhow::Result<()> {
    let config = PipelineConfig::from_file(config_path, MissingEnv::Allow)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let mut failures = 0;
    for source in &config.sources {
        let state = if source.enabled { "" } else { " (disabled)" };
        println!("{} [{}]{}", source.alias, source.dialect, state);
        for table in &source.tables {
            match table.validate(&source.alias) {
                Ok(spec) => println!(
                    "  ✓ {} -> {}.{} ({}{})",
                    table.table_id(),
                    spec.destination_schema,
                    spec.destination_table,
                    spec.strategy.name(),
                    if spec.is_manual() { ", manual" } else { "" }
                ),
                Err(e) => {
                    failures += 1;
                    println!("  ✗ {}: {}", table.table_id(), e);
                }
            }
        }
    }

    if failures > 0 {
        bail!("{} table(s) have invalid configuration", failures);
    }
    println!("Configuration is valid");
    Ok(())
}

async fn print_sql(config_path: &Path, selection: Selection) -> anyhow::Result<()> {
    let config = PipelineConfig::from_file(config_path, MissingEnv::Allow)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    selection.validate_against(&config)?;

    // Nothing is written: an empty in-memory target previews a first run
    let warehouse = MemoryWarehouse::new();
    let index = MemoryIndexStore::new();
    let sink = TracingSink;
    let mut failures = 0;

    for (source, tables) in selection.apply(&config) {
        let connection = pipeline::connect_source(source).await?;
        let sync = TableSync::new(
            &source.alias,
            &source.data,
            connection.as_ref(),
            &warehouse,
            &index,
            &sink,
        );

        for table in tables {
            println!("-- {}.{}", source.alias, table.table_id());
            match sync.preview(table).await {
                Ok(statements) => {
                    for (label, sql) in statements {
                        println!("-- {}\n{};\n", label, sql);
                    }
                }
                Err((stage, error)) => {
                    failures += 1;
                    println!("-- failed at {}: {}\n", stage, error_chain(&error));
                }
            }
        }
    }

    if failures > 0 {
        bail!("{} table(s) could not be previewed", failures);
    }
    Ok(())
}

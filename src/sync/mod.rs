// ABOUTME: Table sync engine - drives one table from configuration to a committed watermark
// ABOUTME: Each stage maps its failures into SyncError; a failed table never affects siblings

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::{IndexSpec, Strategy, TableConfig, TableSpec};
use crate::error::SyncError;
use crate::events::{EventSink, SyncEvent};
use crate::index::{IndexStore, IndexValue};
use crate::schema::{build_column_schema, inspect_query, inspect_table, ColumnSchema};
use crate::source::{ResultSet, SourceConnection};
use crate::sql::template::{render, TemplateContext, TemplateError, TemplateValue};
use crate::sql::{self, IndexWindow};
use crate::warehouse::{CreateTable, DeleteStrategy, TableRef, Warehouse};

/// States of a table run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStage {
    /// Opening the worker's connections (reported by the orchestrator).
    Connect,
    ResolveMode,
    CheckTargetExists,
    CreateTarget,
    RebuildTarget,
    ComputeWindow,
    Extract,
    Stage,
    Load,
    CommitWatermark,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Connect => "CONNECT",
            SyncStage::ResolveMode => "RESOLVE_MODE",
            SyncStage::CheckTargetExists => "CHECK_TARGET_EXISTS",
            SyncStage::CreateTarget => "CREATE_TARGET",
            SyncStage::RebuildTarget => "REBUILD_TARGET",
            SyncStage::ComputeWindow => "COMPUTE_WINDOW",
            SyncStage::Extract => "EXTRACT",
            SyncStage::Stage => "STAGE",
            SyncStage::Load => "LOAD",
            SyncStage::CommitWatermark => "COMMIT_WATERMARK",
        }
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run overrides from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Reload everything, replacing the target's rows.
    pub full_refresh: bool,
    /// Recreate the target table first. Implies `full_refresh`.
    pub rebuild: bool,
}

/// What a successful run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub rows_extracted: u64,
    pub rows_inserted: u64,
    pub rows_deleted: u64,
    /// Watermark after the run (unchanged when nothing was synced).
    pub watermark: Option<IndexValue>,
    pub target_created: bool,
}

#[derive(Debug)]
pub enum TableStatus {
    Succeeded(SyncSummary),
    Failed { stage: SyncStage, error: SyncError },
}

/// Result of one table's run.
#[derive(Debug)]
pub struct TableOutcome {
    pub source_alias: String,
    pub table: String,
    pub status: TableStatus,
    pub duration: Duration,
}

impl TableOutcome {
    pub fn failed(source_alias: &str, table: &str, stage: SyncStage, error: SyncError) -> Self {
        Self {
            source_alias: source_alias.to_string(),
            table: table.to_string(),
            status: TableStatus::Failed { stage, error },
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, TableStatus::Succeeded(_))
    }

    pub fn summary(&self) -> Option<&SyncSummary> {
        match &self.status {
            TableStatus::Succeeded(summary) => Some(summary),
            TableStatus::Failed { .. } => None,
        }
    }
}

/// A failed stage and its error.
pub type Failure = (SyncStage, SyncError);

trait AtStage<T> {
    fn at(self, stage: SyncStage) -> Result<T, Failure>;
}

impl<T> AtStage<T> for Result<T, SyncError> {
    fn at(self, stage: SyncStage) -> Result<T, Failure> {
        self.map_err(|e| (stage, e))
    }
}

/// Error message followed by every cause, separated by colons.
pub fn error_chain(error: &SyncError) -> String {
    let mut message = error.to_string();
    let mut cause = std::error::Error::source(error);
    while let Some(inner) = cause {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        cause = inner.source();
    }
    message
}

fn template_error(table: &str, error: TemplateError) -> SyncError {
    SyncError::TemplateResolution {
        table: table.to_string(),
        reference: error.reference,
    }
}

/// Mutable state of one table run, threaded through the stages.
struct RunContext {
    table_id: String,
    spec: TableSpec,
    target: TableRef,
    templates: TemplateContext,
    full_refresh: bool,
    rebuild: bool,
}

impl RunContext {
    /// Templates for statements rendered before the window is known.
    fn templates_without_window(&self) -> TemplateContext {
        let mut templates = self.templates.clone();
        templates.set_run("old_index_value", Some("NULL".to_string()));
        templates.set_run("new_index_value", Some("NULL".to_string()));
        templates
    }

    fn render(&self, sql: &str, templates: &TemplateContext) -> Result<String, SyncError> {
        render(sql, templates).map_err(|e| template_error(&self.table_id, e))
    }
}

/// How the target side was prepared.
struct PreparedTarget {
    /// Columns to extract and load; `None` for manual tables, which load what the query returns.
    load_columns: Option<Vec<String>>,
    created: bool,
}

/// Bounds chosen by COMPUTE_WINDOW.
enum Window {
    /// Extract everything.
    Full { new: Option<IndexValue> },
    Incremental {
        old: Option<IndexValue>,
        new: IndexValue,
    },
    /// Nothing new at the source; the watermark stays as it is.
    UpToDate {
        reason: String,
        watermark: Option<IndexValue>,
    },
}

/// Synchronizes tables of one source database into the warehouse.
///
/// Holds only borrowed collaborators; one instance is used per worker and its tables run
/// strictly one after another.
pub struct TableSync<'a> {
    source_alias: &'a str,
    db_data: &'a BTreeMap<String, TemplateValue>,
    source: &'a dyn SourceConnection,
    warehouse: &'a dyn Warehouse,
    index: &'a dyn IndexStore,
    events: &'a dyn EventSink,
    options: RunOptions,
}

impl<'a> TableSync<'a> {
    pub fn new(
        source_alias: &'a str,
        db_data: &'a BTreeMap<String, TemplateValue>,
        source: &'a dyn SourceConnection,
        warehouse: &'a dyn Warehouse,
        index: &'a dyn IndexStore,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            source_alias,
            db_data,
            source,
            warehouse,
            index,
            events,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Run one table to completion. Never panics or propagates; failures are in the outcome.
    pub async fn run(&self, table: &TableConfig) -> TableOutcome {
        let started = Instant::now();
        let table_id = table.table_id().to_string();

        let status = match self.run_stages(table).await {
            Ok(summary) => {
                self.events.emit(&SyncEvent::TableSucceeded {
                    source: self.source_alias.to_string(),
                    table: table_id.clone(),
                    rows: summary.rows_inserted,
                });
                TableStatus::Succeeded(summary)
            }
            Err((stage, error)) => {
                self.events.emit(&SyncEvent::TableFailed {
                    source: self.source_alias.to_string(),
                    table: table_id.clone(),
                    stage,
                    kind: error.kind(),
                    error: error_chain(&error),
                });
                TableStatus::Failed { stage, error }
            }
        };

        TableOutcome {
            source_alias: self.source_alias.to_string(),
            table: table_id,
            status,
            duration: started.elapsed(),
        }
    }

    async fn run_stages(&self, table: &TableConfig) -> Result<SyncSummary, Failure> {
        self.events.emit(&SyncEvent::TableStarted {
            source: self.source_alias.to_string(),
            table: table.table_id().to_string(),
        });
        let mut run = self.resolve_mode(table).await.at(SyncStage::ResolveMode)?;
        self.events.emit(&SyncEvent::ModeResolved {
            source: self.source_alias.to_string(),
            table: run.table_id.clone(),
            strategy: run.spec.strategy.name(),
            full_refresh: run.full_refresh,
        });

        let prepared = self.prepare_target(&run).await?;
        let mut summary = SyncSummary {
            target_created: prepared.created,
            ..Default::default()
        };

        let window = self
            .compute_window(&mut run, prepared.created)
            .await
            .at(SyncStage::ComputeWindow)?;
        let new_watermark = match &window {
            Window::UpToDate { reason, watermark } => {
                self.events.emit(&SyncEvent::NothingToSync {
                    source: self.source_alias.to_string(),
                    table: run.table_id.clone(),
                    reason: reason.clone(),
                });
                summary.watermark = watermark.clone();
                return Ok(summary);
            }
            Window::Full { new } => new.clone(),
            Window::Incremental { new, .. } => Some(new.clone()),
        };

        let rows = self
            .extract(&run, &window, prepared.load_columns.as_deref())
            .await
            .at(SyncStage::Extract)?;
        summary.rows_extracted = rows.len() as u64;
        self.events.emit(&SyncEvent::RowsExtracted {
            source: self.source_alias.to_string(),
            table: run.table_id.clone(),
            rows: summary.rows_extracted,
        });

        if rows.is_empty() && !run.full_refresh {
            tracing::debug!("No rows in window for {}; skipping load", run.table_id);
        } else {
            self.stage_and_load(&run, rows, &mut summary).await?;
        }

        if let Some(value) = new_watermark {
            self.index
                .set(self.source_alias, &run.spec.source_table, &value)
                .await
                .map_err(|e| SyncError::watermark(&run.table_id, e))
                .at(SyncStage::CommitWatermark)?;
            self.events.emit(&SyncEvent::WatermarkCommitted {
                source: self.source_alias.to_string(),
                table: run.table_id.clone(),
                value: value.as_text(),
            });
            summary.watermark = Some(value);
        }

        Ok(summary)
    }

    /// Statements a run of `table` would execute, without writing anything.
    ///
    /// Reads the source catalog and the current index bound; the watermark comes from the
    /// configured index store, so pair this with an empty store to preview a first run.
    pub async fn preview(&self, table: &TableConfig) -> Result<Vec<(&'static str, String)>, Failure> {
        let mut run = self.resolve_mode(table).await.at(SyncStage::ResolveMode)?;
        let mut statements = Vec::new();

        let schema = match run.spec.manual {
            None => Some(
                self.managed_schema(&run)
                    .await
                    .at(SyncStage::CheckTargetExists)?,
            ),
            Some(_) => None,
        };
        let create = self
            .create_statement(&run, schema.as_ref())
            .await
            .at(SyncStage::CreateTarget)?;
        statements.push(("create", create.sql));

        if let Some(index) = run.spec.strategy.index() {
            let bound = match index {
                IndexSpec::Column(column) => {
                    sql::max_index_sql(self.source.dialect(), &run.spec.source_table, column)
                }
                IndexSpec::Expression(expression) => run
                    .render(expression, &run.templates)
                    .at(SyncStage::ComputeWindow)?,
            };
            statements.push(("index", bound));
        }

        // Against an empty target, as a first run would see it
        let window = self
            .compute_window(&mut run, true)
            .await
            .at(SyncStage::ComputeWindow)?;
        let load_columns = schema.map(|s| s.names());
        let extract = self
            .extract_query(&run, &window, load_columns.as_deref())
            .at(SyncStage::Extract)?;
        statements.push(("extract", extract));

        Ok(statements)
    }

    /// RESOLVE_MODE: validate the configuration and apply runtime options.
    async fn resolve_mode(&self, table: &TableConfig) -> Result<RunContext, SyncError> {
        let mut spec = table.validate(self.source_alias)?;
        let table_id = table.table_id().to_string();

        let has_truncate = spec
            .manual
            .as_ref()
            .is_some_and(|m| m.truncate_statement.is_some());
        if self.options.rebuild && has_truncate {
            return Err(SyncError::configuration(
                &table_id,
                "rebuild is not supported for tables with a truncate_statement",
            ));
        }

        if matches!(spec.strategy, Strategy::Indexed { .. }) && spec.primary_key.is_empty() {
            spec.primary_key = self
                .source
                .primary_key(&spec.source_table)
                .await
                .map_err(|e| SyncError::extraction(&table_id, e))?;
            if spec.primary_key.is_empty() {
                return Err(SyncError::configuration(
                    &table_id,
                    "indexed tables need a primary_key and none was found at the source",
                ));
            }
            tracing::debug!(
                "Inferred primary key ({}) for {}",
                spec.primary_key.join(", "),
                table_id
            );
        }

        let target = TableRef::new(&spec.destination_schema, &spec.destination_table);
        let mut templates = TemplateContext::new(self.db_data, &spec.data);
        templates.set_run("destination_schema", Some(target.schema.clone()));
        templates.set_run("destination_table", Some(target.table.clone()));
        templates.set_run("source_alias", Some(self.source_alias.to_string()));
        templates.set_run("db_name", Some(self.source.database_name().to_string()));
        templates.set_run("source_table", Some(spec.source_table.clone()));
        templates.set_run("index_column", spec.index_column().map(String::from));
        templates.set_run("old_index_value", None);
        templates.set_run("new_index_value", None);

        let full_refresh = self.options.full_refresh
            || self.options.rebuild
            || matches!(spec.strategy, Strategy::FullRefresh);

        Ok(RunContext {
            table_id,
            spec,
            target,
            templates,
            full_refresh,
            rebuild: self.options.rebuild,
        })
    }

    /// CHECK_TARGET_EXISTS, then CREATE_TARGET or REBUILD_TARGET when needed.
    async fn prepare_target(&self, run: &RunContext) -> Result<PreparedTarget, Failure> {
        let stage = SyncStage::CheckTargetExists;
        let load_error = |e| SyncError::load(&run.table_id, e);

        let schema = match run.spec.manual {
            None => Some(self.managed_schema(run).await.at(stage)?),
            Some(_) => None,
        };

        let exists = self
            .warehouse
            .table_exists(&run.target)
            .await
            .map_err(load_error)
            .at(stage)?;

        if exists && !run.rebuild {
            let load_columns = match &schema {
                Some(schema) => Some(self.check_target_columns(run, schema).await.at(stage)?),
                None => None,
            };
            return Ok(PreparedTarget {
                load_columns,
                created: false,
            });
        }

        let stage = if exists {
            SyncStage::RebuildTarget
        } else {
            SyncStage::CreateTarget
        };
        let create = self
            .create_statement(run, schema.as_ref())
            .await
            .at(stage)?;

        let result = if exists {
            self.warehouse.rebuild_table(&create).await
        } else {
            self.warehouse.create_table(&create).await
        };
        result.map_err(load_error).at(stage)?;

        self.events.emit(&SyncEvent::TargetCreated {
            source: self.source_alias.to_string(),
            table: run.table_id.clone(),
            rebuilt: exists,
        });

        Ok(PreparedTarget {
            load_columns: schema.map(|s| s.names()),
            created: true,
        })
    }

    async fn managed_schema(&self, run: &RunContext) -> Result<ColumnSchema, SyncError> {
        let columns = inspect_table(self.source, &run.spec.source_table)
            .await
            .map_err(|e| SyncError::extraction(&run.table_id, e))?;
        build_column_schema(&run.spec, self.source.dialect(), &columns)
    }

    /// Compare an existing managed target with the expected schema.
    ///
    /// Target columns the source no longer produces fail the table; source columns missing
    /// from the target are left out of the load.
    async fn check_target_columns(
        &self,
        run: &RunContext,
        schema: &ColumnSchema,
    ) -> Result<Vec<String>, SyncError> {
        let target_columns = self
            .warehouse
            .table_columns(&run.target)
            .await
            .map_err(|e| SyncError::load(&run.table_id, e))?;

        let extra = target_columns
            .iter()
            .filter(|c| !schema.contains(c))
            .cloned()
            .collect::<Vec<_>>();
        if !extra.is_empty() {
            return Err(SyncError::SchemaMismatch {
                table: run.target.to_string(),
                columns: extra.join(", "),
            });
        }

        let (present, missing): (Vec<String>, Vec<String>) = schema
            .names()
            .into_iter()
            .partition(|name| target_columns.iter().any(|c| c.eq_ignore_ascii_case(name)));
        if !missing.is_empty() {
            tracing::warn!(
                "Columns {} of {} are not in {} and will not be loaded",
                missing.join(", "),
                run.spec.source_table,
                run.target
            );
        }
        Ok(present)
    }

    async fn create_statement(
        &self,
        run: &RunContext,
        schema: Option<&ColumnSchema>,
    ) -> Result<CreateTable, SyncError> {
        if let Some(schema) = schema {
            return Ok(CreateTable {
                target: run.target.clone(),
                sql: sql::create_table_sql(&run.target, schema, &run.spec.primary_key),
                columns: schema.names(),
            });
        }

        let Some(manual) = &run.spec.manual else {
            return Err(SyncError::configuration(&run.table_id, "no schema for target table"));
        };
        let templates = run.templates_without_window();
        let query = run.render(&manual.extract_query, &templates)?;
        let described = inspect_query(self.source, &query)
            .await
            .map_err(|e| SyncError::extraction(&run.table_id, e))?;

        match &manual.create_statement {
            Some(create) => Ok(CreateTable {
                target: run.target.clone(),
                sql: run.render(create, &templates)?,
                columns: described.into_iter().map(|c| c.name).collect(),
            }),
            None => {
                let schema = build_column_schema(&run.spec, self.source.dialect(), &described)?;
                Ok(CreateTable {
                    target: run.target.clone(),
                    sql: sql::create_table_sql(&run.target, &schema, &run.spec.primary_key),
                    columns: schema.names(),
                })
            }
        }
    }

    /// COMPUTE_WINDOW: read the watermark and the source's current upper bound.
    ///
    /// A full refresh, or a target that was just created or rebuilt, starts from "never
    /// run" whatever watermark is stored.
    async fn compute_window(
        &self,
        run: &mut RunContext,
        target_created: bool,
    ) -> Result<Window, SyncError> {
        let Some(index) = run.spec.strategy.index().cloned() else {
            return Ok(Window::Full { new: None });
        };

        let old = if run.full_refresh || target_created {
            tracing::debug!(
                "Ignoring stored watermark for {} (full refresh or new target)",
                run.table_id
            );
            None
        } else {
            self.index
                .get(self.source_alias, &run.spec.source_table)
                .await
                .map_err(|e| SyncError::watermark(&run.table_id, e))?
        };
        run.templates
            .set_run("old_index_value", old.as_ref().map(IndexValue::to_sql_literal));

        let bound_query = match &index {
            IndexSpec::Column(column) => {
                sql::max_index_sql(self.source.dialect(), &run.spec.source_table, column)
            }
            IndexSpec::Expression(expression) => run.render(expression, &run.templates)?,
        };
        tracing::debug!("Index bound query for {}: {}", run.table_id, bound_query);
        let result = self
            .source
            .query(&bound_query)
            .await
            .map_err(|e| SyncError::extraction(&run.table_id, e))?;
        let new = result
            .first_value("index_value")
            .map_err(|e| SyncError::extraction(&run.table_id, e))?
            .and_then(IndexValue::from_sql);

        if let Some(new) = &new {
            run.templates
                .set_run("new_index_value", Some(new.to_sql_literal()));
        }

        if run.full_refresh {
            return Ok(Window::Full { new });
        }

        let Some(new) = new else {
            return Ok(Window::UpToDate {
                reason: "source reported no index value".to_string(),
                watermark: old,
            });
        };
        if let Some(old) = &old {
            if new < *old {
                tracing::warn!(
                    "Index of {} went backwards: source max {} is below watermark {}",
                    run.table_id,
                    new,
                    old
                );
            }
            if new <= *old {
                return Ok(Window::UpToDate {
                    reason: format!("no index values above {}", old),
                    watermark: Some(old.clone()),
                });
            }
        }

        Ok(Window::Incremental { old, new })
    }

    /// EXTRACT: run the managed SELECT or the rendered manual query.
    async fn extract(
        &self,
        run: &RunContext,
        window: &Window,
        load_columns: Option<&[String]>,
    ) -> Result<ResultSet, SyncError> {
        let query = self.extract_query(run, window, load_columns)?;
        tracing::debug!("Extract query for {}: {}", run.table_id, query);
        self.source
            .query(&query)
            .await
            .map_err(|e| SyncError::extraction(&run.table_id, e))
    }

    fn extract_query(
        &self,
        run: &RunContext,
        window: &Window,
        load_columns: Option<&[String]>,
    ) -> Result<String, SyncError> {
        match (&run.spec.manual, load_columns) {
            (Some(manual), _) => run.render(&manual.extract_query, &run.templates),
            (None, Some(columns)) => {
                let window = match (window, run.spec.index_column()) {
                    (Window::Incremental { old, new }, Some(column)) => Some(IndexWindow {
                        column,
                        old: old.as_ref(),
                        new,
                    }),
                    _ => None,
                };
                Ok(sql::select_sql(
                    self.source.dialect(),
                    &run.spec.source_table,
                    columns,
                    window,
                ))
            }
            (None, None) => Err(SyncError::configuration(&run.table_id, "no columns to extract")),
        }
    }

    /// STAGE and LOAD.
    async fn stage_and_load(
        &self,
        run: &RunContext,
        mut rows: ResultSet,
        summary: &mut SyncSummary,
    ) -> Result<(), Failure> {
        let load_error = |e| SyncError::load(&run.table_id, e);

        if rows.columns.is_empty() {
            rows.columns = self
                .warehouse
                .table_columns(&run.target)
                .await
                .map_err(load_error)
                .at(SyncStage::Stage)?;
        }

        let delete = self.delete_strategy(run).at(SyncStage::Load)?;
        let plan = sql::load_plan(self.source_alias, &run.target, &rows.columns, delete);

        let location = self
            .warehouse
            .stage(&plan.staging_table, &rows)
            .await
            .map_err(load_error)
            .at(SyncStage::Stage)?;

        let outcome = self
            .warehouse
            .bulk_load(&location, &plan)
            .await
            .map_err(load_error)
            .at(SyncStage::Load)?;
        if outcome.rows_inserted != rows.len() as u64 {
            return Err((
                SyncStage::Load,
                load_error(anyhow::anyhow!(
                    "Partial load: extracted {} row(s) but inserted {}",
                    rows.len(),
                    outcome.rows_inserted
                )),
            ));
        }

        self.events.emit(&SyncEvent::RowsLoaded {
            source: self.source_alias.to_string(),
            table: run.table_id.clone(),
            inserted: outcome.rows_inserted,
            deleted: outcome.rows_deleted,
        });
        summary.rows_inserted = outcome.rows_inserted;
        summary.rows_deleted = outcome.rows_deleted;
        Ok(())
    }

    fn delete_strategy(&self, run: &RunContext) -> Result<DeleteStrategy, SyncError> {
        if run.full_refresh {
            let truncate = run
                .spec
                .manual
                .as_ref()
                .and_then(|m| m.truncate_statement.as_deref());
            return match truncate {
                Some(sql) => Ok(DeleteStrategy::Custom(run.render(sql, &run.templates)?)),
                None => Ok(DeleteStrategy::All),
            };
        }

        match &run.spec.strategy {
            Strategy::AppendOnly { .. } => Ok(DeleteStrategy::None),
            Strategy::Indexed { .. } if run.spec.primary_key.is_empty() => Err(
                SyncError::configuration(&run.table_id, "upsert requires a primary key"),
            ),
            Strategy::Indexed { .. } => Ok(DeleteStrategy::MatchingKeys(run.spec.primary_key.clone())),
            Strategy::FullRefresh => Ok(DeleteStrategy::All),
        }
    }
}

// ABOUTME: Aggregated outcome of a pipeline run
// ABOUTME: Logs a per-table summary and decides the process exit status

use std::time::Duration;

use crate::sync::{error_chain, TableOutcome, TableStatus};

#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<TableOutcome>,
    pub duration: Duration,
}

impl RunReport {
    pub fn new(outcomes: Vec<TableOutcome>, duration: Duration) -> Self {
        Self { outcomes, duration }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TableOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TableOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }

    pub fn rows_loaded(&self) -> u64 {
        self.succeeded()
            .filter_map(|o| o.summary())
            .map(|s| s.rows_inserted)
            .sum()
    }

    /// Outcome for `source_alias.table`, if that table ran.
    pub fn outcome(&self, source_alias: &str, table: &str) -> Option<&TableOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.source_alias == source_alias && o.table == table)
    }

    pub fn log_summary(&self) {
        tracing::info!("");
        tracing::info!("========================================");
        tracing::info!("Sync summary");
        tracing::info!("========================================");
        for outcome in &self.outcomes {
            match &outcome.status {
                TableStatus::Succeeded(summary) => tracing::info!(
                    "  ✓ {}.{}: {} row(s) loaded, {} deleted, watermark {} ({:.1}s)",
                    outcome.source_alias,
                    outcome.table,
                    summary.rows_inserted,
                    summary.rows_deleted,
                    summary
                        .watermark
                        .as_ref()
                        .map(|w| w.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    outcome.duration.as_secs_f64()
                ),
                TableStatus::Failed { stage, error } => tracing::error!(
                    "  ✗ {}.{}: failed at {}: {}",
                    outcome.source_alias,
                    outcome.table,
                    stage,
                    error_chain(error)
                ),
            }
        }
        tracing::info!(
            "{} table(s) succeeded, {} failed, {} row(s) loaded in {:.1}s",
            self.succeeded().count(),
            self.failed().count(),
            self.rows_loaded(),
            self.duration.as_secs_f64()
        );
    }
}

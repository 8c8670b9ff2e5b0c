// ABOUTME: Structured progress events emitted by the sync engine and orchestrator
// ABOUTME: Default sink forwards to tracing; a recording sink collects events for tests

use std::sync::Mutex;

use crate::sync::SyncStage;

/// Something observable that happened while synchronizing a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    TableStarted {
        source: String,
        table: String,
    },
    /// Configuration checked; the strategy and whether this run reloads everything.
    ModeResolved {
        source: String,
        table: String,
        strategy: &'static str,
        full_refresh: bool,
    },
    TargetCreated {
        source: String,
        table: String,
        rebuilt: bool,
    },
    /// The run had nothing to extract; the watermark is left as it was.
    NothingToSync {
        source: String,
        table: String,
        reason: String,
    },
    RowsExtracted {
        source: String,
        table: String,
        rows: u64,
    },
    RowsLoaded {
        source: String,
        table: String,
        inserted: u64,
        deleted: u64,
    },
    WatermarkCommitted {
        source: String,
        table: String,
        value: String,
    },
    TableSucceeded {
        source: String,
        table: String,
        rows: u64,
    },
    TableFailed {
        source: String,
        table: String,
        stage: SyncStage,
        kind: &'static str,
        error: String,
    },
}

/// Receiver of [`SyncEvent`]s. Must be cheap; it is called inline by the engine.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SyncEvent);
}

/// Forwards events to `tracing` with structured fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &SyncEvent) {
        match event {
            SyncEvent::TableStarted { source, table } => {
                tracing::info!(source = %source, table = %table, "Syncing table")
            }
            SyncEvent::ModeResolved {
                source,
                table,
                strategy,
                full_refresh,
            } => tracing::debug!(
                source = %source,
                table = %table,
                strategy,
                full_refresh,
                "Sync mode resolved"
            ),
            SyncEvent::TargetCreated {
                source,
                table,
                rebuilt,
            } => tracing::info!(source = %source, table = %table, rebuilt, "Target table ready"),
            SyncEvent::NothingToSync {
                source,
                table,
                reason,
            } => tracing::info!(source = %source, table = %table, "Nothing to sync: {}", reason),
            SyncEvent::RowsExtracted {
                source,
                table,
                rows,
            } => tracing::debug!(source = %source, table = %table, rows, "Extracted rows"),
            SyncEvent::RowsLoaded {
                source,
                table,
                inserted,
                deleted,
            } => tracing::debug!(
                source = %source,
                table = %table,
                inserted,
                deleted,
                "Loaded rows"
            ),
            SyncEvent::WatermarkCommitted {
                source,
                table,
                value,
            } => tracing::debug!(source = %source, table = %table, value = %value, "Watermark committed"),
            SyncEvent::TableSucceeded {
                source,
                table,
                rows,
            } => tracing::info!(source = %source, table = %table, rows, "✓ Table synced"),
            SyncEvent::TableFailed {
                source,
                table,
                stage,
                kind,
                error,
            } => tracing::error!(
                source = %source,
                table = %table,
                stage = %stage,
                kind,
                "✗ Table failed: {}",
                error
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.emit(&SyncEvent::TableStarted {
            source: "shop".into(),
            table: "orders".into(),
        });
        sink.emit(&SyncEvent::TableFailed {
            source: "shop".into(),
            table: "orders".into(),
            stage: SyncStage::Load,
            kind: "load",
            error: "boom".into(),
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            SyncEvent::TableFailed {
                stage: SyncStage::Load,
                ..
            }
        ));
    }
}

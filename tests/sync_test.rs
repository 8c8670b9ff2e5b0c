// ABOUTME: Table sync engine tests against a real SQLite source and in-memory warehouse
// ABOUTME: Covers incremental windows, strategies, rebuilds, and per-stage failure reporting

use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;
use warehouse_replicator::config::{PrimaryKeyConfig, TableConfig};
use warehouse_replicator::events::{RecordingSink, SyncEvent};
use warehouse_replicator::index::{IndexStore, IndexValue, MemoryIndexStore};
use warehouse_replicator::source::{SqlValue, SqliteSource};
use warehouse_replicator::sql::template::TemplateValue;
use warehouse_replicator::sync::{RunOptions, SyncStage, TableOutcome, TableStatus, TableSync};
use warehouse_replicator::warehouse::{MemoryWarehouse, TableRef, TargetCatalog};

const ORDERS: &str = "
CREATE TABLE orders (
    id INTEGER PRIMARY KEY,
    status TEXT NOT NULL,
    total REAL,
    updated_at DATETIME NOT NULL
);
INSERT INTO orders VALUES (1, 'new', 10.5, '2024-01-01 00:00:00');
INSERT INTO orders VALUES (2, 'new', 20.0, '2024-01-02 00:00:00');
INSERT INTO orders VALUES (3, 'new', NULL, '2024-01-03 00:00:00');
";

struct Harness {
    _dir: TempDir,
    path: PathBuf,
    source: SqliteSource,
    warehouse: MemoryWarehouse,
    index: MemoryIndexStore,
    events: RecordingSink,
    data: BTreeMap<String, TemplateValue>,
}

impl Harness {
    fn new(setup: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.db");
        Connection::open(&path).unwrap().execute_batch(setup).unwrap();
        let source = SqliteSource::open(path.to_str().unwrap()).unwrap();

        Self {
            _dir: dir,
            path,
            source,
            warehouse: MemoryWarehouse::new(),
            index: MemoryIndexStore::new(),
            events: RecordingSink::new(),
            data: BTreeMap::new(),
        }
    }

    /// Change the source through a separate writable connection.
    fn exec(&self, sql: &str) {
        Connection::open(&self.path).unwrap().execute_batch(sql).unwrap();
    }

    async fn run(&self, table: &TableConfig) -> TableOutcome {
        self.run_with(table, RunOptions::default()).await
    }

    async fn run_with(&self, table: &TableConfig, options: RunOptions) -> TableOutcome {
        TableSync::new(
            "shop",
            &self.data,
            &self.source,
            &self.warehouse,
            &self.index,
            &self.events,
        )
        .with_options(options)
        .run(table)
        .await
    }

    fn row_count(&self, table: &str) -> Option<usize> {
        self.warehouse.row_count(&TableRef::new("shop", table))
    }
}

fn orders_table() -> TableConfig {
    TableConfig {
        source_table_name: Some("orders".into()),
        index_column: Some("updated_at".into()),
        primary_key: Some(PrimaryKeyConfig::Single("id".into())),
        ..Default::default()
    }
}

fn failure(outcome: &TableOutcome) -> (SyncStage, &'static str) {
    match &outcome.status {
        TableStatus::Failed { stage, error } => (*stage, error.kind()),
        TableStatus::Succeeded(_) => panic!("expected {} to fail", outcome.table),
    }
}

fn status_of(warehouse: &MemoryWarehouse, id: i64) -> Option<SqlValue> {
    warehouse
        .rows(&TableRef::new("shop", "orders"))?
        .into_iter()
        .find(|row| row.get("id") == Some(&SqlValue::Int(id)))
        .and_then(|row| row.get("status").cloned())
}

#[tokio::test]
async fn test_indexed_table_creates_then_upserts_window() {
    let h = Harness::new(ORDERS);
    let table = orders_table();

    let first = h.run(&table).await;
    let summary = first.summary().expect("first run succeeds");
    assert!(summary.target_created);
    assert_eq!(summary.rows_inserted, 3);
    assert_eq!(
        summary.watermark,
        Some(IndexValue::parse("2024-01-03 00:00:00"))
    );
    assert_eq!(
        h.warehouse
            .table_columns(&TableRef::new("shop", "orders"))
            .await
            .unwrap(),
        vec!["id", "status", "total", "updated_at"]
    );

    h.exec(
        "UPDATE orders SET status = 'paid', updated_at = '2024-01-04 00:00:00' WHERE id = 2;
         INSERT INTO orders VALUES (4, 'new', 5.0, '2024-01-05 00:00:00');",
    );

    let second = h.run(&table).await;
    let summary = second.summary().expect("second run succeeds");
    assert!(!summary.target_created);
    assert_eq!(summary.rows_extracted, 2);
    assert_eq!(summary.rows_deleted, 1);
    assert_eq!(summary.rows_inserted, 2);
    assert_eq!(h.row_count("orders"), Some(4));
    assert_eq!(status_of(&h.warehouse, 2), Some(SqlValue::Text("paid".into())));
    assert_eq!(
        h.index.get("shop", "orders").await.unwrap(),
        Some(IndexValue::parse("2024-01-05 00:00:00"))
    );
}

#[tokio::test]
async fn test_unchanged_source_is_a_no_op() {
    let h = Harness::new(ORDERS);
    let table = orders_table();
    assert!(h.run(&table).await.is_success());

    let again = h.run(&table).await;
    let summary = again.summary().expect("no-op run succeeds");
    assert_eq!(summary.rows_extracted, 0);
    assert_eq!(summary.rows_inserted, 0);
    assert_eq!(
        summary.watermark,
        Some(IndexValue::parse("2024-01-03 00:00:00"))
    );
    assert!(h
        .events
        .events()
        .iter()
        .any(|e| matches!(e, SyncEvent::NothingToSync { .. })));
    assert_eq!(h.row_count("orders"), Some(3));
}

#[tokio::test]
async fn test_replaying_a_window_does_not_duplicate_rows() {
    let h = Harness::new(ORDERS);
    let table = orders_table();
    assert!(h.run(&table).await.is_success());

    // Force the same window to be extracted again
    h.index
        .set("shop", "orders", &IndexValue::parse("2024-01-01 00:00:00"))
        .await
        .unwrap();
    let replay = h.run(&table).await;
    let summary = replay.summary().expect("replay succeeds");
    assert_eq!(summary.rows_extracted, 2);
    assert_eq!(summary.rows_deleted, 2);
    assert_eq!(h.row_count("orders"), Some(3));
}

#[tokio::test]
async fn test_append_only_never_deletes() {
    let h = Harness::new(
        "CREATE TABLE events (id INTEGER NOT NULL, kind TEXT);
         INSERT INTO events VALUES (1, 'open'), (2, 'click'), (3, 'close');",
    );
    let table = TableConfig {
        source_table_name: Some("events".into()),
        index_column: Some("id".into()),
        append_only: true,
        ..Default::default()
    };

    let first = h.run(&table).await;
    assert_eq!(first.summary().unwrap().watermark, Some(IndexValue::Integer(3)));

    h.exec("INSERT INTO events VALUES (4, 'open'), (5, 'open');");
    let second = h.run(&table).await;
    let summary = second.summary().unwrap();
    assert_eq!(summary.rows_extracted, 2);
    assert_eq!(summary.rows_deleted, 0);
    assert_eq!(h.row_count("events"), Some(5));
    assert_eq!(summary.watermark, Some(IndexValue::Integer(5)));
}

#[tokio::test]
async fn test_full_refresh_replaces_every_row() {
    let h = Harness::new(ORDERS);
    let table = TableConfig {
        source_table_name: Some("orders".into()),
        full_refresh: true,
        ..Default::default()
    };

    assert_eq!(h.run(&table).await.summary().unwrap().rows_inserted, 3);

    h.exec("DELETE FROM orders WHERE id = 1;");
    let second = h.run(&table).await;
    let summary = second.summary().unwrap();
    assert_eq!(summary.rows_deleted, 3);
    assert_eq!(summary.rows_inserted, 2);
    assert_eq!(summary.watermark, None);
    assert_eq!(h.row_count("orders"), Some(2));

    // An empty source still empties the target
    h.exec("DELETE FROM orders;");
    assert!(h.run(&table).await.is_success());
    assert_eq!(h.row_count("orders"), Some(0));
    assert!(h.index.is_empty());
}

#[tokio::test]
async fn test_runtime_full_refresh_keeps_watermark_current() {
    let h = Harness::new(ORDERS);
    let table = orders_table();
    assert!(h.run(&table).await.is_success());

    h.exec("DELETE FROM orders WHERE id = 3; UPDATE orders SET updated_at = '2024-01-02 12:00:00' WHERE id = 2;");
    let refresh = h
        .run_with(
            &table,
            RunOptions {
                full_refresh: true,
                rebuild: false,
            },
        )
        .await;
    let summary = refresh.summary().unwrap();
    assert_eq!(summary.rows_inserted, 2);
    assert_eq!(h.row_count("orders"), Some(2));
    // Full refresh records the source's current maximum, even if it went down
    assert_eq!(
        summary.watermark,
        Some(IndexValue::parse("2024-01-02 12:00:00"))
    );
}

#[tokio::test]
async fn test_manual_query_advances_watermark_without_rows() {
    let mut h = Harness::new(
        "CREATE TABLE orders (id INTEGER NOT NULL, status TEXT);
         INSERT INTO orders VALUES (10, 'new'), (11, 'new');",
    );
    h.data.insert("region".into(), TemplateValue::Text("eu".into()));

    let mut table_data = BTreeMap::new();
    table_data.insert("cutoff".into(), TemplateValue::Integer(5));
    let table = TableConfig {
        source_table_name: Some("orders".into()),
        destination_table_name: Some("orders_{{ db.region }}".into()),
        ..Default::default()
    };
    // Destination names are identifiers, not templates
    assert_eq!(
        failure(&h.run(&table).await),
        (SyncStage::ResolveMode, "configuration")
    );

    let table = TableConfig {
        source_table_name: Some("orders".into()),
        destination_table_name: Some("orders_eu".into()),
        query: Some(
            "SELECT id, status FROM orders WHERE '{{ db.region }}' = 'eu' \
             AND id > {{ run.old_index_value | default: 0 }} AND id <= {{ run.new_index_value }}"
                .into(),
        ),
        index_sql: Some("SELECT {{ table.cutoff }} AS index_value".into()),
        primary_key: Some(PrimaryKeyConfig::Single("id".into())),
        data: table_data,
        ..Default::default()
    };

    let outcome = h.run(&table).await;
    let summary = outcome.summary().expect("manual run succeeds");
    assert!(summary.target_created);
    assert_eq!(summary.rows_extracted, 0);
    assert_eq!(summary.rows_inserted, 0);
    assert_eq!(h.row_count("orders_eu"), Some(0));
    assert_eq!(
        h.index.get("shop", "orders").await.unwrap(),
        Some(IndexValue::Integer(5))
    );
}

#[tokio::test]
async fn test_manual_query_loads_what_it_selects() {
    let h = Harness::new(ORDERS);
    let table = TableConfig {
        source_table_name: Some("orders".into()),
        destination_table_name: Some("order_status".into()),
        query: Some(
            "SELECT id, upper(status) AS status FROM orders \
             WHERE updated_at > {{ run.old_index_value | default: '' }} \
             AND updated_at <= {{ run.new_index_value }}"
                .into(),
        ),
        create_statement: Some(
            "CREATE TABLE {{ run.destination_schema }}.{{ run.destination_table }} (id bigint, status text)"
                .into(),
        ),
        index_column: Some("updated_at".into()),
        append_only: true,
        ..Default::default()
    };

    let outcome = h.run(&table).await;
    assert_eq!(outcome.summary().unwrap().rows_inserted, 3);
    assert!(h
        .warehouse
        .statements()
        .iter()
        .any(|sql| sql == "CREATE TABLE shop.order_status (id bigint, status text)"));

    let rows = h.warehouse.rows(&TableRef::new("shop", "order_status")).unwrap();
    assert!(rows
        .iter()
        .all(|row| row.get("status") == Some(&SqlValue::Text("NEW".into()))));
}

#[tokio::test]
async fn test_unresolved_template_fails_only_that_table() {
    let h = Harness::new(ORDERS);
    let table = TableConfig {
        source_table_name: Some("orders".into()),
        query: Some("SELECT * FROM orders WHERE region = '{{ db.region }}'".into()),
        full_refresh: true,
        ..Default::default()
    };

    let outcome = h.run(&table).await;
    assert_eq!(failure(&outcome), (SyncStage::CreateTarget, "template_resolution"));
    assert_eq!(h.row_count("orders"), None);
}

#[tokio::test]
async fn test_failed_load_after_rebuild_keeps_table_and_watermark() {
    let h = Harness::new(ORDERS);
    let table = orders_table();
    assert!(h.run(&table).await.is_success());

    let target = TableRef::new("shop", "orders");
    h.warehouse.grant(&target, "SELECT TO reporting").unwrap();
    h.exec("INSERT INTO orders VALUES (4, 'new', 1.0, '2024-01-09 00:00:00');");
    h.warehouse.fail_next_load();

    let outcome = h
        .run_with(
            &table,
            RunOptions {
                full_refresh: false,
                rebuild: true,
            },
        )
        .await;
    assert_eq!(failure(&outcome), (SyncStage::Load, "load"));
    assert!(h.warehouse.table_exists(&target).await.unwrap());
    assert_eq!(h.warehouse.grants(&target), vec!["SELECT TO reporting"]);
    assert_eq!(
        h.index.get("shop", "orders").await.unwrap(),
        Some(IndexValue::parse("2024-01-03 00:00:00"))
    );

    // The next rebuild recovers completely
    let retry = h
        .run_with(
            &table,
            RunOptions {
                full_refresh: false,
                rebuild: true,
            },
        )
        .await;
    assert_eq!(retry.summary().unwrap().rows_inserted, 4);
    assert_eq!(h.row_count("orders"), Some(4));
}

#[tokio::test]
async fn test_conflicting_configuration_touches_nothing() {
    let h = Harness::new(ORDERS);
    let table = TableConfig {
        source_table_name: Some("orders".into()),
        index_column: Some("updated_at".into()),
        append_only: true,
        full_refresh: true,
        ..Default::default()
    };

    let outcome = h.run(&table).await;
    assert_eq!(failure(&outcome), (SyncStage::ResolveMode, "configuration"));
    assert_eq!(h.row_count("orders"), None);
    // Failures before the mode is known still open with a start event
    let events = h.events.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], SyncEvent::TableStarted { ref table, .. } if table == "orders"));
    assert!(matches!(
        events[1],
        SyncEvent::TableFailed {
            stage: SyncStage::ResolveMode,
            ..
        }
    ));
}

#[tokio::test]
async fn test_rebuild_refused_with_truncate_statement() {
    let h = Harness::new(ORDERS);
    let table = TableConfig {
        source_table_name: Some("orders".into()),
        query: Some("SELECT id FROM orders".into()),
        truncate_statement: Some("DELETE FROM shop.orders".into()),
        full_refresh: true,
        ..Default::default()
    };

    let outcome = h
        .run_with(
            &table,
            RunOptions {
                full_refresh: true,
                rebuild: true,
            },
        )
        .await;
    assert_eq!(failure(&outcome), (SyncStage::ResolveMode, "configuration"));
}

#[tokio::test]
async fn test_primary_key_inferred_from_source() {
    let h = Harness::new(ORDERS);
    let table = TableConfig {
        source_table_name: Some("orders".into()),
        index_column: Some("updated_at".into()),
        ..Default::default()
    };
    assert!(h.run(&table).await.is_success());
    assert!(h.warehouse.statements()[0].contains("PRIMARY KEY (\"id\")"));

    let keyless = Harness::new(
        "CREATE TABLE logs (n INTEGER, line TEXT); INSERT INTO logs VALUES (1, 'x');",
    );
    let table = TableConfig {
        source_table_name: Some("logs".into()),
        index_column: Some("n".into()),
        ..Default::default()
    };
    let outcome = keyless.run(&table).await;
    assert_eq!(failure(&outcome), (SyncStage::ResolveMode, "configuration"));
}

#[tokio::test]
async fn test_unsupported_column_type_names_column() {
    let h = Harness::new(
        "CREATE TABLE files (id INTEGER PRIMARY KEY, body BLOB);
         INSERT INTO files VALUES (1, x'00ff');",
    );
    let mut table = TableConfig {
        source_table_name: Some("files".into()),
        full_refresh: true,
        ..Default::default()
    };

    let outcome = h.run(&table).await;
    assert_eq!(
        failure(&outcome),
        (SyncStage::CheckTargetExists, "unsupported_type")
    );
    assert!(outcome_message(&outcome).contains("body"));

    table.columns_to_drop = vec!["body".into()];
    assert!(h.run(&table).await.is_success());
    assert_eq!(h.row_count("files"), Some(1));
}

fn outcome_message(outcome: &TableOutcome) -> String {
    match &outcome.status {
        TableStatus::Failed { error, .. } => error.to_string(),
        TableStatus::Succeeded(_) => String::new(),
    }
}

#[tokio::test]
async fn test_existing_target_schema_is_checked() {
    let h = Harness::new(ORDERS);
    let table = orders_table();
    let target = TableRef::new("shop", "orders");

    // A column the source does not have
    h.warehouse
        .insert_table(&target, &["id", "status", "total", "updated_at", "legacy"], vec![])
        .unwrap();
    let outcome = h.run(&table).await;
    assert_eq!(
        failure(&outcome),
        (SyncStage::CheckTargetExists, "schema_mismatch")
    );
    assert!(outcome_message(&outcome).contains("legacy"));

    // A source column the target lacks is skipped
    h.warehouse
        .insert_table(&target, &["id", "status", "updated_at"], vec![])
        .unwrap();
    let outcome = h.run(&table).await;
    assert_eq!(outcome.summary().unwrap().rows_inserted, 3);
    let rows = h.warehouse.rows(&target).unwrap();
    assert!(rows.iter().all(|row| !row.contains_key("total")));
}

#[tokio::test]
async fn test_index_moving_backwards_leaves_watermark() {
    let h = Harness::new(ORDERS);
    let table = orders_table();
    assert!(h.run(&table).await.is_success());

    let ahead = IndexValue::parse("2030-01-01 00:00:00");
    h.index.set("shop", "orders", &ahead).await.unwrap();

    let outcome = h.run(&table).await;
    let summary = outcome.summary().unwrap();
    assert!(!summary.target_created);
    assert_eq!(summary.rows_extracted, 0);
    assert_eq!(h.row_count("orders"), Some(3));
    assert_eq!(h.index.get("shop", "orders").await.unwrap(), Some(ahead));
}

#[tokio::test]
async fn test_missing_target_is_backfilled_despite_watermark() {
    let h = Harness::new(ORDERS);
    let table = orders_table();
    assert!(h.run(&table).await.is_success());

    // Same watermark, but the target table is gone
    let fresh = Harness::new(ORDERS);
    fresh
        .index
        .set("shop", "orders", &IndexValue::parse("2024-01-03 00:00:00"))
        .await
        .unwrap();

    let outcome = fresh.run(&table).await;
    let summary = outcome.summary().expect("backfill succeeds");
    assert!(summary.target_created);
    assert_eq!(summary.rows_inserted, 3);
    assert_eq!(fresh.row_count("orders"), Some(3));
    assert_eq!(
        fresh.index.get("shop", "orders").await.unwrap(),
        Some(IndexValue::parse("2024-01-03 00:00:00"))
    );
}

#[tokio::test]
async fn test_full_refresh_manual_query_ignores_stored_watermark() {
    let h = Harness::new(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, status TEXT);
         INSERT INTO orders VALUES (1, 'a'), (2, 'b'), (3, 'c');",
    );
    let table = TableConfig {
        source_table_name: Some("orders".into()),
        query: Some(
            "SELECT id, status FROM orders \
             WHERE id > {{ run.old_index_value | default: 0 }} AND id <= {{ run.new_index_value }}"
                .into(),
        ),
        index_column: Some("id".into()),
        ..Default::default()
    };
    assert_eq!(h.run(&table).await.summary().unwrap().rows_inserted, 3);

    h.exec("INSERT INTO orders VALUES (4, 'd');");
    let refresh = h
        .run_with(
            &table,
            RunOptions {
                full_refresh: true,
                rebuild: false,
            },
        )
        .await;
    let summary = refresh.summary().unwrap();
    assert_eq!(summary.rows_extracted, 4);
    assert_eq!(h.row_count("orders"), Some(4));
    assert_eq!(summary.watermark, Some(IndexValue::Integer(4)));
}

#[tokio::test]
async fn test_fractional_index_advances_numerically() {
    let h = Harness::new(
        "CREATE TABLE readings (id INTEGER PRIMARY KEY, level REAL NOT NULL);
         INSERT INTO readings VALUES (1, 2.25), (2, 9.5);",
    );
    let table = TableConfig {
        source_table_name: Some("readings".into()),
        index_column: Some("level".into()),
        ..Default::default()
    };
    let first = h.run(&table).await;
    assert_eq!(
        first.summary().unwrap().watermark,
        Some(IndexValue::parse("9.5"))
    );

    // As text "10.5" sorts before "9.5"
    h.exec("INSERT INTO readings VALUES (3, 10.5);");
    let second = h.run(&table).await;
    let summary = second.summary().unwrap();
    assert_eq!(summary.rows_extracted, 1);
    assert_eq!(summary.watermark, Some(IndexValue::parse("10.5")));
    assert_eq!(h.row_count("readings"), Some(3));
}

// ABOUTME: End-to-end sync between two live PostgreSQL databases
// ABOUTME: Run with TEST_SOURCE_URL and TEST_TARGET_URL set: cargo test -- --ignored

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use warehouse_replicator::config::TableConfig;
use warehouse_replicator::events::TracingSink;
use warehouse_replicator::index::{IndexStore, IndexValue, PostgresIndexStore};
use warehouse_replicator::postgres::connect;
use warehouse_replicator::source::PostgresSource;
use warehouse_replicator::sync::TableSync;
use warehouse_replicator::warehouse::PostgresWarehouse;

#[tokio::test]
#[ignore]
async fn test_incremental_sync_between_postgres_databases() {
    let source_url = std::env::var("TEST_SOURCE_URL").expect("TEST_SOURCE_URL not set");
    let target_url = std::env::var("TEST_TARGET_URL").expect("TEST_TARGET_URL not set");

    let setup = connect(&source_url).await.unwrap();
    setup
        .batch_execute(
            "DROP TABLE IF EXISTS itest_orders;
             CREATE TABLE itest_orders (id bigint PRIMARY KEY, status text, amount numeric(10,2));
             INSERT INTO itest_orders VALUES (1, 'new', 10.50), (2, 'paid', 3.00);",
        )
        .await
        .unwrap();

    let target = Arc::new(Mutex::new(connect(&target_url).await.unwrap()));
    target
        .lock()
        .await
        .batch_execute(
            "DROP TABLE IF EXISTS itest.itest_orders;
             DROP TABLE IF EXISTS public.pipeline_table_index_itest;",
        )
        .await
        .unwrap();

    let source = PostgresSource::connect(&source_url).await.unwrap();
    let warehouse = PostgresWarehouse::new(target.clone()).unwrap();
    let index = PostgresIndexStore::new(target.clone(), "public", "pipeline_table_index_itest");
    let events = TracingSink;
    let data = BTreeMap::new();
    let sync = TableSync::new("itest", &data, &source, &warehouse, &index, &events);

    let table = TableConfig {
        source_table_name: Some("itest_orders".into()),
        index_column: Some("id".into()),
        ..Default::default()
    };

    let first = sync.run(&table).await;
    assert!(first.is_success(), "{:?}", first.status);
    assert_eq!(first.summary().unwrap().rows_inserted, 2);
    assert!(first.summary().unwrap().target_created);

    setup
        .batch_execute("INSERT INTO itest_orders VALUES (3, 'new', 7.25)")
        .await
        .unwrap();
    let second = sync.run(&table).await;
    assert!(second.is_success(), "{:?}", second.status);
    assert_eq!(second.summary().unwrap().rows_inserted, 1);

    let count: i64 = target
        .lock()
        .await
        .query_one("SELECT count(*) FROM itest.itest_orders", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 3);
    assert_eq!(
        index.get("itest", "itest_orders").await.unwrap(),
        Some(IndexValue::Integer(3))
    );
}

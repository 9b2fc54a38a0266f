//! Materialization against a real ClickHouse server.
//!
//! Requires Docker (or `MATERIALIZER_TEST_CLICKHOUSE_HOST` pointing at a server).

use std::sync::Arc;

use integration_tests::containers::TestContainers;
use integration_tests::setup::{init_test_tracing, records, schema_config};
use materializer_core::{Column, Value};
use warehouse::{ClickHouseWarehouse, RelationStore, Warehouse, WarehouseTxn};
use worker::MaterializationOrchestrator;

async fn seed(client: &clickhouse::Client, db: &str) {
    let statements = [
        format!("DROP DATABASE IF EXISTS {db}"),
        format!("CREATE DATABASE {db}"),
        format!(
            "CREATE TABLE {db}.pages (id String, anonymous_id Nullable(String), \
             received_at DateTime64(3, 'UTC'), path Nullable(String), \
             context_campaign_name Nullable(String), context_page_referrer Nullable(String)) \
             ENGINE = MergeTree ORDER BY id"
        ),
        format!(
            "CREATE TABLE {db}.tracks (id String, anonymous_id Nullable(String), \
             received_at DateTime64(3, 'UTC'), event LowCardinality(String), plan Nullable(String)) \
             ENGINE = MergeTree ORDER BY id"
        ),
        format!(
            "INSERT INTO {db}.pages VALUES \
             ('p0', 'v1', '2024-05-01 09:00:00', '/', 'spring_sale', 'https://news.example'), \
             ('p5', 'v1', '2024-05-01 09:05:00', '/pricing', NULL, NULL), \
             ('p40', 'v1', '2024-05-01 09:40:00', '/docs', NULL, NULL)"
        ),
        format!(
            "INSERT INTO {db}.tracks VALUES \
             ('t41', 'v1', '2024-05-01 09:41:00', 'Signed Up', 'pro')"
        ),
        "DROP ROLE IF EXISTS analysts".to_string(),
        "CREATE ROLE analysts".to_string(),
    ];
    for sql in statements {
        client.query(&sql).execute().await.expect(&sql);
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_clickhouse_materialize_and_rerun() {
    init_test_tracing();
    let containers = TestContainers::start().await;
    let warehouse = ClickHouseWarehouse::new(containers.warehouse.clone()).expect("client");
    warehouse.ping().await.expect("ping");
    seed(warehouse.inner(), "acme").await;

    let orchestrator = MaterializationOrchestrator::new(Arc::new(warehouse.clone()));
    let config = schema_config("acme", &["analysts"], &["plan"]);

    let report = orchestrator.materialize(&config).await.expect("first run");
    assert_eq!(report.union_rows, 4);
    assert_eq!(report.session_rows, 2);
    assert_eq!(report.fact_rows, 4);

    let mut txn = warehouse.begin("acme").await.expect("begin");
    let sessions = txn
        .scan(&materializer_core::RelationRef::new("acme", "sessions"))
        .await
        .expect("scan sessions");
    let facts = txn
        .scan(&materializer_core::RelationRef::new("acme", "event_facts"))
        .await
        .expect("scan facts");
    txn.rollback().await.expect("rollback");

    let session_ids: Vec<Value> = records(&sessions)
        .into_iter()
        .map(|r| r["session_id"].clone())
        .collect();
    assert!(session_ids.contains(&Value::Text("1 - v1".into())));
    assert!(session_ids.contains(&Value::Text("2 - v1".into())));

    let columns: Vec<&Column> = facts.columns.iter().collect();
    assert!(columns.iter().any(|c| c.name == "context_campaign_name"));
    let signed_up = records(&facts)
        .into_iter()
        .find(|r| r["id"] == Value::Text("t41".into()))
        .expect("t41 fact");
    assert_eq!(signed_up["session_id"], Value::Text("2 - v1".into()));
    assert_eq!(signed_up["track_sequence_number"], Value::Int(2));
    assert_eq!(signed_up["context_campaign_name"], Value::Null);

    // Rerun swaps in fresh tables over the existing ones
    let again = orchestrator.materialize(&config).await.expect("second run");
    assert_eq!(again.fact_rows, report.fact_rows);
}

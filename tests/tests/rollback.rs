//! Failure handling: rollback, schema locks and batch failure policy.

use integration_tests::fixtures;
use integration_tests::setup::{schema_config, TestContext};
use materializer_core::{Relation, RelationRef};
use warehouse::{Warehouse, WarehouseTxn};
use worker::FailurePolicy;

const OUTPUTS: [&str; 3] = ["event_union", "sessions", "event_facts"];

fn snapshot(ctx: &TestContext, schema: &str) -> Vec<Option<Relation>> {
    OUTPUTS
        .iter()
        .map(|n| ctx.memory.get(&RelationRef::new(schema, *n)))
        .collect()
}

/// A failure in the last stage leaves no output from the earlier stages.
#[tokio::test]
async fn test_failure_publishes_nothing() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::four_page_visit();
    ctx.seed("acme", pages, tracks);
    ctx.warehouse.fail_create("event_facts");

    let err = ctx
        .orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), Some("QUERY_001"));
    for name in OUTPUTS {
        assert!(!ctx.exists("acme", name), "{} leaked after rollback", name);
    }
    assert!(!ctx.memory.is_locked("acme"));
}

/// A failed rerun keeps the previous run's outputs intact.
#[tokio::test]
async fn test_failed_rerun_keeps_previous_outputs() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::four_page_visit();
    ctx.seed("acme", pages, tracks);
    let config = schema_config("acme", &["analysts"], &[]);

    ctx.orchestrator().materialize(&config).await.expect("first run");
    let before = snapshot(&ctx, "acme");

    let (pages, tracks) = fixtures::campaign_visit();
    ctx.seed("acme", pages, tracks);
    ctx.warehouse.fail_create("sessions");
    assert!(ctx.orchestrator().materialize(&config).await.is_err());

    assert_eq!(snapshot(&ctx, "acme"), before);
}

/// A rejected grant rolls back the relations it was granting on.
#[tokio::test]
async fn test_grant_failure_rolls_back() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::four_page_visit();
    ctx.seed("acme", pages, tracks);
    ctx.warehouse.fail_grant("ghost_role");

    let err = ctx
        .orchestrator()
        .materialize(&schema_config("acme", &["analysts", "ghost_role"], &[]))
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), Some("QUERY_002"));
    assert!(!ctx.exists("acme", "event_union"));
}

/// A commit failure surfaces as a transaction error.
#[tokio::test]
async fn test_commit_failure() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::four_page_visit();
    ctx.seed("acme", pages, tracks);
    ctx.warehouse.fail_commit(true);

    let err = ctx
        .orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), Some("TXN_002"));
    assert!(!ctx.exists("acme", "sessions"));

    ctx.warehouse.heal();
    assert!(ctx
        .orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .is_ok());
}

/// A second run on a locked schema is refused without touching outputs.
#[tokio::test]
async fn test_concurrent_run_conflicts() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::four_page_visit();
    ctx.seed("acme", pages, tracks);

    let held = ctx.memory.begin("acme").await.expect("hold lock");
    let err = ctx
        .orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some("QUERY_003"));
    assert!(!ctx.exists("acme", "event_union"));

    held.rollback().await.expect("release lock");
    assert!(ctx
        .orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .is_ok());
}

/// Missing required columns fail introspection before anything is written.
#[tokio::test]
async fn test_missing_label_column() {
    let ctx = TestContext::new();
    let (pages, _) = fixtures::four_page_visit();
    let mut tracks = fixtures::SourceBuilder::tracks(&[]).build();
    tracks.columns.retain(|c| c.name != "event");
    ctx.seed("acme", pages, tracks);

    let err = ctx
        .orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some("SCHEMA_002"));
    assert!(!ctx.exists("acme", "event_union"));
}

/// Fail-fast stops the batch; later schemas are skipped, earlier ones stay committed.
#[tokio::test]
async fn test_fail_fast_policy() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::four_page_visit();
    ctx.seed("first", pages.clone(), tracks.clone());
    ctx.seed("third", pages, tracks);

    let schemas = [
        schema_config("first", &[], &[]),
        schema_config("second", &[], &[]),
        schema_config("third", &[], &[]),
    ];
    let report = ctx.runner(FailurePolicy::FailFast).run(&schemas).await;

    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "second");
    assert_eq!(report.skipped, vec!["third".to_string()]);
    assert!(ctx.exists("first", "event_facts"));
    assert!(!ctx.exists("third", "event_facts"));
}

/// Continue isolates the failing schema and runs the rest.
#[tokio::test]
async fn test_continue_policy() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::four_page_visit();
    ctx.seed("first", pages.clone(), tracks.clone());
    ctx.seed("third", pages, tracks);

    let schemas = [
        schema_config("first", &[], &[]),
        schema_config("second", &[], &[]),
        schema_config("third", &[], &[]),
    ];
    let report = ctx.runner(FailurePolicy::Continue).run(&schemas).await;

    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert!(report.skipped.is_empty());
    assert!(ctx.exists("third", "event_facts"));
}

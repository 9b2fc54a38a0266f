//! End-to-end materialization on the in-memory warehouse.

use std::collections::{BTreeMap, HashSet};

use integration_tests::fixtures::{self, at_minute, SourceBuilder};
use integration_tests::setup::{records, schema_config, TestContext};
use materializer_core::{LayoutHints, RelationRef, Value};

fn text(v: &str) -> Value {
    Value::Text(v.to_string())
}

/// Visitor v1 at minutes 0, 5, 40, 41 yields two sessions.
#[tokio::test]
async fn test_idle_gap_splits_sessions() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::four_page_visit();
    ctx.seed("acme", pages, tracks);

    let report = ctx
        .orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .expect("materialize");
    assert_eq!(report.union_rows, 4);
    assert_eq!(report.session_rows, 2);
    assert_eq!(report.fact_rows, 4);

    let sessions = records(&ctx.relation("acme", "sessions"));
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["session_id"], text("1 - v1"));
    assert_eq!(sessions[0]["session_sequence_number"], Value::Int(1));
    assert_eq!(sessions[0]["session_start_at"], Value::Timestamp(at_minute(0)));
    assert_eq!(sessions[0]["next_session_start_at"], Value::Timestamp(at_minute(40)));
    assert_eq!(sessions[1]["session_id"], text("2 - v1"));
    assert_eq!(sessions[1]["session_sequence_number"], Value::Int(2));
    assert_eq!(sessions[1]["session_start_at"], Value::Timestamp(at_minute(40)));
    assert_eq!(sessions[1]["next_session_start_at"], Value::Null);

    let union = records(&ctx.relation("acme", "event_union"));
    let gaps: Vec<&Value> = union.iter().map(|r| &r["idle_time_minutes"]).collect();
    assert_eq!(gaps, vec![&Value::Null, &Value::Int(5), &Value::Int(35), &Value::Int(1)]);
    assert_eq!(union[2]["idle_time_seconds"], Value::Int(35 * 60));

    let facts = records(&ctx.relation("acme", "event_facts"));
    let owners: Vec<(&Value, &Value)> = facts
        .iter()
        .map(|f| (&f["id"], &f["session_id"]))
        .collect();
    assert_eq!(
        owners,
        vec![
            (&text("p0"), &text("1 - v1")),
            (&text("p5"), &text("1 - v1")),
            (&text("p40"), &text("2 - v1")),
            (&text("p41"), &text("2 - v1")),
        ]
    );
}

/// Campaign columns come from the session, never from the event row.
#[tokio::test]
async fn test_campaign_attribution_is_session_level() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::campaign_visit();
    ctx.seed("acme", pages, tracks);

    ctx.orchestrator()
        .materialize(&schema_config("acme", &[], &["plan"]))
        .await
        .expect("materialize");

    let facts_rel = ctx.relation("acme", "event_facts");
    let names = facts_rel.column_names();
    assert_eq!(
        names.iter().filter(|n| **n == "context_campaign_name").count(),
        1,
        "campaign column must appear exactly once: {:?}",
        names
    );
    assert!(names.contains(&"plan"));
    assert!(names.contains(&"session_referrer"));

    let facts = records(&facts_rel);
    let by_id: BTreeMap<String, _> = facts
        .iter()
        .map(|f| (f["id"].to_text().unwrap_or_default(), f))
        .collect();

    // p2 carries no campaign itself but inherits its session's
    assert_eq!(by_id["p2"]["context_campaign_name"], text("spring_sale"));
    assert_eq!(by_id["t1"]["context_campaign_name"], text("spring_sale"));
    assert_eq!(by_id["t1"]["session_referrer"], text("https://news.example"));
    assert_eq!(by_id["t1"]["plan"], text("pro"));

    // Second v1 session (gap 78 minutes) has its own campaign
    assert_eq!(by_id["p4"]["session_id"], text("2 - v1"));
    assert_eq!(by_id["t3"]["context_campaign_name"], text("newsletter"));
    assert_eq!(by_id["t3"]["session_referrer"], Value::Null);

    assert_eq!(by_id["t2"]["session_id"], text("1 - v2"));
    assert_eq!(by_id["t2"]["context_campaign_name"], text("retarget"));

    // Sequence numbers within the first v1 session: p1, p2, t1
    assert_eq!(by_id["t1"]["track_sequence_number"], Value::Int(3));
    assert_eq!(by_id["t1"]["source_sequence_number"], Value::Int(1));
    assert_eq!(by_id["p2"]["source_sequence_number"], Value::Int(2));
}

/// Every fact references exactly one session and one union row.
#[tokio::test]
async fn test_facts_reference_sessions_and_events() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::campaign_visit();
    ctx.seed("acme", pages, tracks);

    ctx.orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .expect("materialize");

    let sessions = records(&ctx.relation("acme", "sessions"));
    let union = records(&ctx.relation("acme", "event_union"));
    let facts = records(&ctx.relation("acme", "event_facts"));

    for fact in &facts {
        let owning = sessions
            .iter()
            .filter(|s| s["session_id"] == fact["session_id"])
            .count();
        assert_eq!(owning, 1, "fact {:?} has {} sessions", fact["id"], owning);
        let events = union.iter().filter(|e| e["id"] == fact["id"]).count();
        assert_eq!(events, 1, "fact {:?} has {} union rows", fact["id"], events);
    }
    assert_eq!(facts.len(), union.len());
}

/// Within each session, track_sequence_number is a permutation of 1..N.
#[tokio::test]
async fn test_track_sequence_is_permutation() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::campaign_visit();
    ctx.seed("acme", pages, tracks);

    ctx.orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .expect("materialize");

    let facts = records(&ctx.relation("acme", "event_facts"));
    let mut per_session: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for fact in &facts {
        let Value::Int(seq) = fact["track_sequence_number"] else {
            panic!("track_sequence_number must be an integer");
        };
        per_session
            .entry(fact["session_id"].to_text().unwrap_or_default())
            .or_default()
            .push(seq);
    }

    for (session, mut seqs) in per_session {
        seqs.sort_unstable();
        let expected: Vec<i64> = (1..=seqs.len() as i64).collect();
        assert_eq!(seqs, expected, "session {}", session);
    }
}

/// Per visitor, sessions do not overlap and sequence numbers step by one.
#[tokio::test]
async fn test_sessions_are_ordered_and_disjoint() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::campaign_visit();
    ctx.seed("acme", pages, tracks);

    ctx.orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .expect("materialize");

    let sessions = records(&ctx.relation("acme", "sessions"));
    let visitors: HashSet<String> = sessions
        .iter()
        .filter_map(|s| s["anonymous_id"].to_text())
        .collect();

    for visitor in visitors {
        let mine: Vec<_> = sessions
            .iter()
            .filter(|s| s["anonymous_id"].to_text().as_deref() == Some(visitor.as_str()))
            .collect();
        for (i, s) in mine.iter().enumerate() {
            assert_eq!(s["session_sequence_number"], Value::Int(i as i64 + 1));
            match mine.get(i + 1) {
                Some(next) => assert_eq!(s["next_session_start_at"], next["session_start_at"]),
                None => assert_eq!(s["next_session_start_at"], Value::Null),
            }
        }
    }
}

/// Running twice on unchanged input publishes identical relations.
#[tokio::test]
async fn test_rerun_is_idempotent() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::campaign_visit();
    ctx.seed("acme", pages, tracks);
    let config = schema_config("acme", &["analysts"], &["plan"]);
    let orchestrator = ctx.orchestrator();

    orchestrator.materialize(&config).await.expect("first run");
    let first: Vec<_> = ["event_union", "sessions", "event_facts"]
        .iter()
        .map(|n| ctx.relation("acme", n))
        .collect();

    orchestrator.materialize(&config).await.expect("second run");
    let second: Vec<_> = ["event_union", "sessions", "event_facts"]
        .iter()
        .map(|n| ctx.relation("acme", n))
        .collect();

    assert_eq!(first, second);
}

/// Each output is granted to every principal and carries its layout hints.
#[tokio::test]
async fn test_grants_and_layout_hints() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::four_page_visit();
    ctx.seed("acme", pages, tracks);

    ctx.orchestrator()
        .materialize(&schema_config("acme", &["analysts", "bi_reader"], &[]))
        .await
        .expect("materialize");

    for name in ["event_union", "sessions", "event_facts"] {
        let grants = ctx.memory.grants(&RelationRef::new("acme", name));
        assert!(grants.contains("analysts"), "{} not granted", name);
        assert!(grants.contains("bi_reader"), "{} not granted", name);
    }

    let hints = |name: &str| ctx.memory.layout_hints(&RelationRef::new("acme", name));
    assert_eq!(
        hints("sessions"),
        Some(LayoutHints {
            distribution_key: Some("session_id".into()),
            sort_key: Some("session_start_at".into()),
        })
    );
    assert_eq!(
        hints("event_facts"),
        Some(LayoutHints {
            distribution_key: Some("id".into()),
            sort_key: Some("received_at".into()),
        })
    );
}

/// Anonymous rows stay in the union but never reach sessions or facts.
#[tokio::test]
async fn test_rows_without_visitor() {
    let ctx = TestContext::new();
    let pages = SourceBuilder::pages(&[])
        .row("p1", "v1", 0, "/", &[])
        .anonymous_row("p2", 1, "/bot")
        .build();
    ctx.seed("acme", pages, SourceBuilder::tracks(&[]).build());

    let report = ctx
        .orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .expect("materialize");

    assert_eq!(report.union_rows, 2);
    assert_eq!(report.session_rows, 1);
    assert_eq!(report.fact_rows, 1);
}

/// Two visitorless rows minutes apart still carry no idle gap.
#[tokio::test]
async fn test_visitorless_rows_do_not_chain() {
    let ctx = TestContext::new();
    let pages = SourceBuilder::pages(&[])
        .anonymous_row("p1", 0, "/bot")
        .anonymous_row("p2", 7, "/bot")
        .build();
    ctx.seed("acme", pages, SourceBuilder::tracks(&[]).build());

    ctx.orchestrator()
        .materialize(&schema_config("acme", &[], &[]))
        .await
        .expect("materialize");

    let union = records(&ctx.relation("acme", "event_union"));
    assert_eq!(union.len(), 2);
    for row in &union {
        assert_eq!(row["idle_time_minutes"], Value::Null);
        assert_eq!(row["idle_time_seconds"], Value::Null);
    }
}

/// Raw columns that clash with output names or the campaign marker keep every
/// output column name unique, and no selected property is lost.
#[tokio::test]
async fn test_output_column_names_are_unique() {
    let ctx = TestContext::new();
    let extra = ["session_id", "utm_context_campaign", "context_campaign_name"];
    let pages = SourceBuilder::pages(&extra)
        .row("p1", "v1", 0, "/", &[Some("raw"), Some("spring"), Some("sale")])
        .row("p2", "v1", 3, "/pricing", &[None, None, None])
        .build();
    ctx.seed("acme", pages, SourceBuilder::tracks(&[]).build());

    ctx.orchestrator()
        .materialize(&schema_config("acme", &[], &["session", "utm"]))
        .await
        .expect("materialize");

    for name in ["event_union", "sessions", "event_facts"] {
        let columns: Vec<String> = ctx
            .relation("acme", name)
            .columns
            .into_iter()
            .map(|c| c.name)
            .collect();
        let unique: HashSet<&String> = columns.iter().collect();
        assert_eq!(unique.len(), columns.len(), "{} has duplicate columns: {:?}", name, columns);
    }

    let facts = ctx.relation("acme", "event_facts");
    for column in ctx.relation("acme", "sessions").columns.iter().skip(5) {
        assert!(
            facts.columns.iter().any(|c| c.name == column.name),
            "{} missing from event_facts",
            column.name
        );
    }
    let facts = records(&facts);
    assert_eq!(facts[1]["utm_context_campaign"], text("spring"));
    assert_eq!(facts[1]["session_id"], text("1 - v1"));
}

/// Schemas are isolated from each other.
#[tokio::test]
async fn test_schemas_do_not_mix() {
    let ctx = TestContext::new();
    let (pages, tracks) = fixtures::four_page_visit();
    ctx.seed("acme", pages, tracks);
    let (pages, tracks) = fixtures::campaign_visit();
    ctx.seed("globex", pages, tracks);

    let report = ctx
        .runner(worker::FailurePolicy::FailFast)
        .run(&[schema_config("acme", &[], &[]), schema_config("globex", &[], &[])])
        .await;
    assert!(report.is_success());

    assert_eq!(ctx.relation("acme", "event_facts").len(), 4);
    assert_eq!(ctx.relation("globex", "event_facts").len(), 7);
}

//! Per-schema materialization.
//!
//! Builds `event_union`, `sessions` and `event_facts` for one schema inside a
//! single warehouse transaction. Any failure rolls the whole schema back.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use materializer_core::schema::{
    self, EVENT_FACTS_RELATION, EVENT_UNION_RELATION, PAGES_RELATION, PAGE_LABEL_COLUMN,
    SESSIONS_RELATION, TRACKS_RELATION, TRACK_LABEL_COLUMN,
};
use materializer_core::{
    event_facts, event_union, sessions, EventSource, LayoutHints, RawSource, Relation,
    RelationRef, Result, SchemaConfig, CAMPAIGN_PREFIX,
};
use telemetry::metrics;
use warehouse::{AccessGrantor, RelationStore, SchemaIntrospector, Warehouse, WarehouseTxn};

/// Rows written by one successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeReport {
    pub schema: String,
    pub run_id: Uuid,
    pub union_rows: u64,
    pub session_rows: u64,
    pub fact_rows: u64,
}

/// Sequences the three builders for a schema and publishes them atomically.
pub struct MaterializationOrchestrator {
    warehouse: Arc<dyn Warehouse>,
}

impl MaterializationOrchestrator {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Materializes one schema. Nothing is visible unless every stage succeeds.
    pub async fn materialize(&self, config: &SchemaConfig) -> Result<MaterializeReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("materialize", schema = %config.name, run_id = %run_id);
        self.materialize_inner(config, run_id).instrument(span).await
    }

    async fn materialize_inner(&self, config: &SchemaConfig, run_id: Uuid) -> Result<MaterializeReport> {
        config.check()?;
        let m = metrics();
        m.runs_started.inc();
        let started = Instant::now();

        let mut txn = match self.warehouse.begin(&config.name).await {
            Ok(txn) => txn,
            Err(e) => {
                if e.error_code() == Some("QUERY_003") {
                    m.lock_conflicts.inc();
                }
                m.runs_failed.inc();
                error!(error = %e, "Could not open transaction");
                return Err(e);
            }
        };

        let outcome = build_all(txn.as_mut(), config).await;
        let result = match outcome {
            Ok((union_rows, session_rows, fact_rows)) => match txn.commit().await {
                Ok(()) => Ok(MaterializeReport {
                    schema: config.name.clone(),
                    run_id,
                    union_rows,
                    session_rows,
                    fact_rows,
                }),
                Err(e) => {
                    error!(error = %e, "Commit failed");
                    Err(e)
                }
            },
            Err(e) => {
                m.rollbacks.inc();
                error!(error = %e, code = e.error_code().unwrap_or("-"), "Materialization failed, rolling back");
                if let Err(rb) = txn.rollback().await {
                    warn!(error = %rb, "Rollback failed");
                }
                Err(e)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        m.materialize_latency_ms.observe(elapsed_ms);
        match result {
            Ok(ref report) => {
                m.runs_succeeded.inc();
                m.union_rows_written.inc_by(report.union_rows);
                m.session_rows_written.inc_by(report.session_rows);
                m.fact_rows_written.inc_by(report.fact_rows);
                info!(
                    union_rows = report.union_rows,
                    session_rows = report.session_rows,
                    fact_rows = report.fact_rows,
                    elapsed_ms,
                    "Schema materialized"
                );
            }
            Err(_) => m.runs_failed.inc(),
        }
        result
    }
}

async fn read_source(
    txn: &mut dyn WarehouseTxn,
    relation: &RelationRef,
    label: &str,
) -> Result<Relation> {
    let columns = txn.inspect(relation).await?;
    schema::validate_source(relation, &columns, label)?;
    txn.scan(relation).await
}

async fn publish(
    txn: &mut dyn WarehouseTxn,
    config: &SchemaConfig,
    name: &str,
    data: &Relation,
) -> Result<u64> {
    let relation = RelationRef::new(config.name.clone(), name);
    let hints = LayoutHints::from_columns(&data.columns);
    let written = txn.create_or_replace(&relation, data, &hints).await?;
    for principal in &config.principals {
        txn.grant_select(&relation, principal).await?;
    }
    Ok(written)
}

/// Runs the three stages against an open transaction.
async fn build_all(txn: &mut dyn WarehouseTxn, config: &SchemaConfig) -> Result<(u64, u64, u64)> {
    let pages_ref = RelationRef::new(config.name.clone(), PAGES_RELATION);
    let tracks_ref = RelationRef::new(config.name.clone(), TRACKS_RELATION);
    let pages = read_source(txn, &pages_ref, PAGE_LABEL_COLUMN).await?;
    let tracks = read_source(txn, &tracks_ref, TRACK_LABEL_COLUMN).await?;

    let union = event_union::build(
        RawSource {
            relation_ref: &pages_ref,
            source: EventSource::Pages,
            data: &pages,
        },
        RawSource {
            relation_ref: &tracks_ref,
            source: EventSource::Tracks,
            data: &tracks,
        },
        &config.properties,
    )?;
    let union_rows = publish(txn, config, EVENT_UNION_RELATION, &union.to_relation()).await?;
    info!(rows = union_rows, "Built event_union");

    let sessions = sessions::build(&union, config.idle_threshold_minutes, &config.properties);
    let session_rows = publish(txn, config, SESSIONS_RELATION, &sessions.to_relation()).await?;
    info!(rows = session_rows, "Built sessions");

    let facts = event_facts::build(&union, &sessions, &config.properties, CAMPAIGN_PREFIX);
    let fact_rows = publish(txn, config, EVENT_FACTS_RELATION, &facts.to_relation()).await?;
    info!(rows = fact_rows, "Built event_facts");

    Ok((union_rows, session_rows, fact_rows))
}

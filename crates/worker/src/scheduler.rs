//! Multi-schema batch runner.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use materializer_core::{Error, SchemaConfig};
use telemetry::{log_metrics_summary, metrics};
use warehouse::Warehouse;

use crate::orchestrator::{MaterializationOrchestrator, MaterializeReport};

/// What a batch does after one schema fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failure; remaining schemas are skipped.
    #[default]
    FailFast,
    /// Keep going and report every failure.
    Continue,
}

/// Outcome of one pass over the configured schemas.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<MaterializeReport>,
    pub failed: Vec<(String, Error)>,
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Runs schemas one after another, each in its own transaction.
pub struct BatchRunner {
    orchestrator: MaterializationOrchestrator,
    policy: FailurePolicy,
}

impl BatchRunner {
    pub fn new(warehouse: Arc<dyn Warehouse>, policy: FailurePolicy) -> Self {
        Self {
            orchestrator: MaterializationOrchestrator::new(warehouse),
            policy,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Materializes every schema in order.
    pub async fn run(&self, schemas: &[SchemaConfig]) -> BatchReport {
        let mut report = BatchReport::default();

        for (i, schema) in schemas.iter().enumerate() {
            match self.orchestrator.materialize(schema).await {
                Ok(done) => report.succeeded.push(done),
                Err(e) => {
                    error!(schema = %schema.name, error = %e, "Schema failed");
                    report.failed.push((schema.name.clone(), e));
                    if self.policy == FailurePolicy::FailFast {
                        report.skipped = schemas[i + 1..].iter().map(|s| s.name.clone()).collect();
                        metrics().runs_skipped.inc_by(report.skipped.len() as u64);
                        if !report.skipped.is_empty() {
                            warn!(skipped = ?report.skipped, "Stopping batch after failure");
                        }
                        break;
                    }
                }
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Batch complete"
        );
        log_metrics_summary();
        report
    }

    /// Runs the batch on a fixed interval until the task is dropped.
    pub async fn run_every(&self, schemas: &[SchemaConfig], period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let report = self.run(schemas).await;
            if !report.is_success() {
                warn!(
                    failed = report.failed.len(),
                    "Batch had failures, retrying at next interval"
                );
            }
        }
    }
}

//! Run metrics.
//!
//! Counters are process-wide and summarized into the log after each batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Histogram for run latency.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 100ms, 500ms, 1s, 5s, 10s, 30s, 1m, 5m, 15m
    buckets: [AtomicU64; 9],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 9] = [100, 500, 1_000, 5_000, 10_000, 30_000, 60_000, 300_000, 900_000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let idx = Self::BUCKET_BOUNDS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(Self::BUCKET_BOUNDS.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Returns `(upper bound ms, count)` pairs.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the materializer.
#[derive(Debug, Default)]
pub struct Metrics {
    // Schema runs
    pub runs_started: Counter,
    pub runs_succeeded: Counter,
    pub runs_failed: Counter,
    pub runs_skipped: Counter,
    pub rollbacks: Counter,
    pub lock_conflicts: Counter,

    // Rows written per output relation
    pub union_rows_written: Counter,
    pub session_rows_written: Counter,
    pub fact_rows_written: Counter,

    pub materialize_latency_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_skipped: u64,
    pub rollbacks: u64,
    pub lock_conflicts: u64,
    pub union_rows_written: u64,
    pub session_rows_written: u64,
    pub fact_rows_written: u64,
    pub materialize_latency_mean_ms: f64,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            runs_started: self.runs_started.get(),
            runs_succeeded: self.runs_succeeded.get(),
            runs_failed: self.runs_failed.get(),
            runs_skipped: self.runs_skipped.get(),
            rollbacks: self.rollbacks.get(),
            lock_conflicts: self.lock_conflicts.get(),
            union_rows_written: self.union_rows_written.get(),
            session_rows_written: self.session_rows_written.get(),
            fact_rows_written: self.fact_rows_written.get(),
            materialize_latency_mean_ms: self.materialize_latency_ms.mean(),
        }
    }
}

/// Logs a one-line summary of the current metrics.
pub fn log_metrics_summary() {
    let s = metrics().snapshot();
    tracing::info!(
        runs_started = s.runs_started,
        runs_succeeded = s.runs_succeeded,
        runs_failed = s.runs_failed,
        runs_skipped = s.runs_skipped,
        rollbacks = s.rollbacks,
        lock_conflicts = s.lock_conflicts,
        union_rows = s.union_rows_written,
        session_rows = s.session_rows_written,
        fact_rows = s.fact_rows_written,
        mean_latency_ms = s.materialize_latency_mean_ms,
        "Materializer metrics"
    );
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

//! Materialization workers.
//!
//! - Orchestrator (one schema, one transaction)
//! - Scheduler (schema batches, failure policy, interval runs)

pub mod orchestrator;
pub mod scheduler;

pub use orchestrator::*;
pub use scheduler::*;

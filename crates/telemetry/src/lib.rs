//! Structured logging and in-process run metrics for the materializer.

pub mod metrics;
pub mod tracing_setup;

pub use metrics::*;
pub use tracing_setup::*;

//! Shared types and aggregation rules for Tally
//!
//! This crate contains the metric data model and the merge rules applied by
//! every store, on the agent side as well as in the aggregator.

pub mod aggregate;
pub mod metric;

// Re-export commonly used types
pub use aggregate::{BatchOutcome, MergeError};
pub use metric::{Metric, MetricKind, MetricValue, ParseError};

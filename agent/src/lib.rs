//! Tally Agent Library
//!
//! Producer-side plumbing: a [`buffer::MetricBuffer`] that pre-aggregates
//! metrics between reports, and a [`reporter::Reporter`] that drains it into
//! an external [`reporter::MetricSender`] on a fixed interval.

pub mod buffer;
pub mod config;
pub mod reporter;

pub use buffer::{BufferError, MetricBuffer};
pub use config::Config;
pub use reporter::{MetricSender, Reporter};

//! Aggregation rules
//!
//! How an incoming observation merges into what a store already holds:
//! counters accumulate, gauges overwrite, and an id never changes kind once
//! it has been observed.

use crate::metric::{Metric, MetricKind, MetricValue};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    #[error("metric {id:?} is stored as {stored}, cannot apply a {incoming} value")]
    WrongType {
        id: String,
        stored: MetricKind,
        incoming: MetricKind,
    },

    #[error("counter {id:?} would overflow")]
    Overflow { id: String },

    #[error("gauge {id:?} reading {value} is not finite")]
    NonFinite { id: String, value: f64 },
}

/// Reject values no store can hold: NaN and infinite gauge readings.
pub fn validate(metric: &Metric) -> Result<(), MergeError> {
    match metric.value {
        MetricValue::Gauge(value) if !value.is_finite() => Err(MergeError::NonFinite {
            id: metric.id.clone(),
            value,
        }),
        _ => Ok(()),
    }
}

/// Merge `incoming` into `existing`, returning the value that should be stored.
pub fn merge(existing: Option<&Metric>, incoming: Metric) -> Result<Metric, MergeError> {
    validate(&incoming)?;
    let Some(existing) = existing else {
        return Ok(incoming);
    };

    match (existing.value, incoming.value) {
        (MetricValue::Counter(total), MetricValue::Counter(delta)) => {
            let total = total
                .checked_add(delta)
                .ok_or_else(|| MergeError::Overflow {
                    id: incoming.id.clone(),
                })?;
            Ok(Metric::new(incoming.id, MetricValue::Counter(total)))
        }
        (MetricValue::Gauge(_), MetricValue::Gauge(_)) => Ok(incoming),
        (stored, incoming_value) => Err(MergeError::WrongType {
            id: incoming.id,
            stored: stored.kind(),
            incoming: incoming_value.kind(),
        }),
    }
}

/// Apply `incoming` to `metrics` in place and return the stored result.
/// On error the map is left untouched.
pub fn apply(metrics: &mut HashMap<String, Metric>, incoming: Metric) -> Result<Metric, MergeError> {
    let merged = merge(metrics.get(&incoming.id), incoming)?;
    metrics.insert(merged.id.clone(), merged.clone());
    Ok(merged)
}

/// Outcome of applying a batch: every element merged before the first error,
/// plus that error if one occurred.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: Vec<Metric>,
    pub error: Option<MergeError>,
}

impl BatchOutcome {
    pub fn into_result(self) -> Result<Vec<Metric>, MergeError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.applied),
        }
    }
}

/// Apply a batch in order. Stops at the first error; elements applied before
/// it stay applied.
pub fn apply_batch(
    metrics: &mut HashMap<String, Metric>,
    batch: impl IntoIterator<Item = Metric>,
) -> BatchOutcome {
    let batch = batch.into_iter();
    let mut outcome = BatchOutcome {
        applied: Vec::with_capacity(batch.size_hint().0),
        error: None,
    };
    for metric in batch {
        match apply(metrics, metric) {
            Ok(merged) => outcome.applied.push(merged),
            Err(err) => {
                outcome.error = Some(err);
                break;
            }
        }
    }
    outcome
}

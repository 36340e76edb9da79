//! Metric data model
//!
//! A [`Metric`] pairs a stable identity with a typed value. The value variant
//! fixes the metric kind, so a counter can never carry a gauge reading.
//!
//! The JSON form is one flat object per metric, used both by the backup file
//! and by the agent/aggregator boundary:
//!
//! ```json
//! {"id":"Alloc","type":"gauge","value":1048576.0}
//! {"id":"PollCount","type":"counter","delta":42}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while decoding a metric kind or a JSON record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown metric type: {0:?}")]
    UnknownKind(String),

    #[error("{kind} metric {id:?} must carry exactly one `{field}` field")]
    MissingValue {
        id: String,
        kind: MetricKind,
        field: &'static str,
    },
}

/// Metric kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            other => Err(ParseError::UnknownKind(other.to_string())),
        }
    }
}

/// Typed metric value. Counters carry an integer delta (or running total once
/// stored), gauges carry the latest reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Counter(i64),
    Gauge(f64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
        }
    }
}

/// A named measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MetricRecord", into = "MetricRecord")]
pub struct Metric {
    pub id: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn new(id: impl Into<String>, value: MetricValue) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self::new(id, MetricValue::Counter(delta))
    }

    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self::new(id, MetricValue::Gauge(value))
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    pub fn delta(&self) -> Option<i64> {
        match self.value {
            MetricValue::Counter(delta) => Some(delta),
            MetricValue::Gauge(_) => None,
        }
    }

    pub fn reading(&self) -> Option<f64> {
        match self.value {
            MetricValue::Gauge(value) => Some(value),
            MetricValue::Counter(_) => None,
        }
    }

    /// Plain-text rendering of the value, as served by the admin `/value` route.
    pub fn value_string(&self) -> String {
        match self.value {
            MetricValue::Counter(delta) => delta.to_string(),
            MetricValue::Gauge(value) => value.to_string(),
        }
    }
}

/// Flat wire/backup representation. Exactly one of `delta` / `value` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetricRecord {
    id: String,
    #[serde(rename = "type")]
    kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
}

impl TryFrom<MetricRecord> for Metric {
    type Error = ParseError;

    fn try_from(record: MetricRecord) -> Result<Self, Self::Error> {
        let value = match (record.kind, record.delta, record.value) {
            (MetricKind::Counter, Some(delta), None) => MetricValue::Counter(delta),
            (MetricKind::Gauge, None, Some(value)) => MetricValue::Gauge(value),
            (kind, _, _) => {
                return Err(ParseError::MissingValue {
                    id: record.id,
                    kind,
                    field: match kind {
                        MetricKind::Counter => "delta",
                        MetricKind::Gauge => "value",
                    },
                })
            }
        };
        Ok(Metric::new(record.id, value))
    }
}

impl From<Metric> for MetricRecord {
    fn from(metric: Metric) -> Self {
        let (delta, value) = match metric.value {
            MetricValue::Counter(delta) => (Some(delta), None),
            MetricValue::Gauge(value) => (None, Some(value)),
        };
        Self {
            kind: metric.kind(),
            id: metric.id,
            delta,
            value,
        }
    }
}

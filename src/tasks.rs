//! Reduction tasks: raw measurement to task vector.
//!
//! A reduction task maps one raw measurement to one or more scalars. The
//! configured tasks run in order and their outputs are concatenated into the
//! task vector, whose length must equal the number of task labels.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::core::{Position, RawMeasurement, TaskVector};
use crate::error::{ScanError, ScanResult};

/// A named, pluggable reduction function.
pub trait ReductionTask: Send + Sync {
    /// Reduce a raw measurement to a scalar or a short vector.
    fn reduce(&self, raw: &RawMeasurement) -> ScanResult<Vec<f64>>;
}

/// Summary statistic computed by [`RoiStatistic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    /// Arithmetic mean
    Mean,
    /// Sum
    Sum,
    /// Maximum
    Max,
    /// Minimum
    Min,
    /// Population standard deviation
    Std,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoiParams {
    /// `[start, stop)` index range per measurement dimension
    #[serde(default)]
    roi: Option<Vec<[usize; 2]>>,
}

/// A statistic over an optional rectangular region of interest.
#[derive(Debug, Clone)]
pub struct RoiStatistic {
    statistic: Statistic,
    roi: Option<Vec<[usize; 2]>>,
}

impl RoiStatistic {
    /// `statistic` over the `[start, stop)` index ranges in `roi`, or over everything.
    pub fn new(statistic: Statistic, roi: Option<Vec<[usize; 2]>>) -> Self {
        Self { statistic, roi }
    }

    /// Build from configuration parameters (`roi` is the only accepted key).
    pub fn from_params(statistic: Statistic, params: &Map<String, Value>) -> ScanResult<Self> {
        let parsed: RoiParams = serde_json::from_value(Value::Object(params.clone()))
            .map_err(|e| ScanError::Configuration(format!("invalid task parameters: {e}")))?;
        if let Some(roi) = &parsed.roi {
            if roi.iter().any(|[start, stop]| start >= stop) {
                return Err(ScanError::Configuration(format!("empty roi range in {roi:?}")));
            }
        }
        Ok(Self::new(statistic, parsed.roi))
    }

    fn selected(&self, raw: &RawMeasurement) -> ScanResult<Vec<f64>> {
        let Some(roi) = &self.roi else {
            return Ok(raw.data().to_vec());
        };
        let shape = raw.shape();
        if roi.len() != shape.len() {
            return Err(ScanError::DimensionMismatch {
                what: "roi ranges",
                expected: shape.len(),
                found: roi.len(),
            });
        }
        let clipped: Vec<[usize; 2]> = roi
            .iter()
            .zip(shape)
            .map(|([start, stop], &len)| [(*start).min(len), (*stop).min(len)])
            .collect();
        let mut strides = vec![1usize; shape.len()];
        for d in (0..shape.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * shape[d + 1];
        }
        let mut out = Vec::new();
        let mut index: Vec<usize> = clipped.iter().map(|[start, _]| *start).collect();
        if clipped.iter().any(|[start, stop]| start >= stop) {
            return Ok(out);
        }
        loop {
            let flat: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
            out.push(raw.data()[flat]);
            // odometer increment, last dimension fastest
            let mut d = index.len();
            loop {
                if d == 0 {
                    return Ok(out);
                }
                d -= 1;
                index[d] += 1;
                if index[d] < clipped[d][1] {
                    break;
                }
                index[d] = clipped[d][0];
            }
        }
    }
}

impl ReductionTask for RoiStatistic {
    fn reduce(&self, raw: &RawMeasurement) -> ScanResult<Vec<f64>> {
        let values = self.selected(raw)?;
        if values.is_empty() {
            return Err(ScanError::MalformedPayload(
                "region of interest selects no values".to_string(),
            ));
        }
        let n = values.len() as f64;
        let value = match self.statistic {
            Statistic::Mean => values.iter().sum::<f64>() / n,
            Statistic::Sum => values.iter().sum(),
            Statistic::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Statistic::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Statistic::Std => {
                let mean = values.iter().sum::<f64>() / n;
                (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
            }
        };
        Ok(vec![value])
    }
}

/// The configured reduction pipeline.
#[derive(Clone)]
pub struct TaskReducer {
    labels: Vec<String>,
    tasks: Vec<Arc<dyn ReductionTask>>,
}

impl TaskReducer {
    /// Reducer producing one value per task; `labels` and `tasks` pair up by index.
    pub fn new(labels: Vec<String>, tasks: Vec<Arc<dyn ReductionTask>>) -> Self {
        Self { labels, tasks }
    }

    /// Task labels.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Number of tasks.
    pub fn n_tasks(&self) -> usize {
        self.labels.len()
    }

    /// Run every task and concatenate the outputs.
    ///
    /// A length mismatch against the label count is a configuration error.
    pub fn reduce(&self, position: &Position, raw: &RawMeasurement) -> ScanResult<TaskVector> {
        let mut reduced = Vec::with_capacity(self.labels.len());
        for task in &self.tasks {
            reduced.extend(task.reduce(raw)?);
        }
        if reduced.len() != self.labels.len() {
            return Err(ScanError::DimensionMismatch {
                what: "reduced task vector",
                expected: self.labels.len(),
                found: reduced.len(),
            });
        }
        debug!(?position, tasks = ?reduced, "Reduced measurement");
        Ok(reduced)
    }
}

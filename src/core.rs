//! Core data types for the scan orchestrator.
//!
//! This module defines the values that flow around the measurement feedback cycle:
//!
//! ```text
//! Transport --[Position, RawMeasurement]--> PositionStore --[TaskVector]--> SurrogateModel
//!     ^                                                                          |
//!     +-------------------------- ADD_POINT (rounded) <--------------------------+
//! ```
//!
//! Positions are in instrument physical units. Raw measurements are opaque numeric
//! arrays with a shape fixed by the instrument for the whole campaign. Task vectors
//! hold one reduced scalar per configured analysis task.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ScanError, ScanResult};

// =============================================================================
// Basic Data Types
// =============================================================================

/// Ordered tuple of `n_dim` coordinates in instrument physical units.
pub type Position = Vec<f64>;

/// One reduced value per configured reduction task.
pub type TaskVector = Vec<f64>;

/// A raw measurement as returned by the instrument for one position.
///
/// Data is stored flattened in row-major order together with its shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurement {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl RawMeasurement {
    /// Reshape flat data into a measurement, failing if the element count does not match.
    pub fn from_flat(shape: &[usize], data: Vec<f64>) -> ScanResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ScanError::MalformedPayload(format!(
                "cannot reshape {} values into {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Element-wise arithmetic mean of a non-empty set of equally shaped measurements.
    pub fn mean_of(measurements: &[RawMeasurement]) -> ScanResult<Self> {
        let first = measurements
            .first()
            .ok_or_else(|| ScanError::MalformedPayload("mean of zero measurements".into()))?;
        let mut sum = vec![0.0; first.data.len()];
        for m in measurements {
            if m.shape != first.shape {
                return Err(ScanError::MalformedPayload(format!(
                    "shape {:?} does not match {:?}",
                    m.shape, first.shape
                )));
            }
            for (acc, v) in sum.iter_mut().zip(&m.data) {
                *acc += v;
            }
        }
        let n = measurements.len() as f64;
        sum.iter_mut().for_each(|v| *v /= n);
        Ok(Self {
            shape: first.shape.clone(),
            data: sum,
        })
    }

    /// Row-major shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flattened values, row-major.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the measurement holds no values.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Quantized position used as the deduplication key.
///
/// Coordinates are grid-rounded before keying, so bit equality is exact equality
/// on the instrument grid.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GridKey(Vec<u64>);

impl GridKey {
    /// Build a key from coordinates that were already snapped to the grid.
    pub fn from_snapped(coords: &[f64]) -> Self {
        // -0.0 and 0.0 must share a key
        Self(coords.iter().map(|c| (c + 0.0).to_bits()).collect())
    }
}

// =============================================================================
// Training History
// =============================================================================

/// One entry per training event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterRecord {
    /// Hyperparameter vector after training
    pub hyperparameters: Vec<f64>,
    /// Training wall time in seconds
    pub time: f64,
    /// Model-loop iteration at which training ran
    pub iteration: u64,
    /// Number of positions the model was trained on
    pub samples: usize,
}

impl HyperparameterRecord {
    /// Record of a training that took `elapsed` at `iteration` over `samples` positions.
    pub fn new(hyperparameters: Vec<f64>, elapsed: Duration, iteration: u64, samples: usize) -> Self {
        Self {
            hyperparameters,
            time: elapsed.as_secs_f64(),
            iteration,
            samples,
        }
    }
}

/// Returns true when two coordinate vectors agree within numpy-style `isclose` tolerances.
pub fn positions_close(a: &[f64], b: &[f64]) -> bool {
    const RTOL: f64 = 1e-5;
    const ATOL: f64 = 1e-8;
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| (x - y).abs() <= ATOL + RTOL * y.abs())
}

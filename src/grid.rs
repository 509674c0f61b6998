//! Instrument positioning grid.
//!
//! The instrument moves on a discrete grid: each axis has its own ordered list of
//! reachable coordinates. Candidates coming out of the surrogate model are snapped
//! to that grid one axis at a time (nearest coordinate per axis, not Euclidean
//! nearest on the full product grid).

use serde::{Deserialize, Serialize};

use crate::core::{GridKey, Position};
use crate::error::{ScanError, ScanResult};

/// Per-axis discrete coordinate lists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentGrid {
    axes: Vec<Vec<f64>>,
}

impl InstrumentGrid {
    /// Create a grid, rejecting a grid with no axes or an empty axis.
    pub fn new(axes: Vec<Vec<f64>>) -> ScanResult<Self> {
        if axes.is_empty() || axes.iter().any(Vec::is_empty) {
            return Err(ScanError::TransportConnect(
                "instrument reported empty axes".to_string(),
            ));
        }
        Ok(Self { axes })
    }

    /// Build an axis from `start` to `stop` (inclusive when reachable) in `step` increments.
    pub fn axis_from_range(start: f64, stop: f64, step: f64) -> ScanResult<Vec<f64>> {
        if !(step.is_finite() && step > 0.0) || stop < start {
            return Err(ScanError::Configuration(format!(
                "invalid axis range {start}..{stop} step {step}"
            )));
        }
        let n = ((stop - start) / step + 1e-9).floor() as usize + 1;
        Ok((0..n).map(|i| start + step * i as f64).collect())
    }

    /// Coordinates of each axis.
    pub fn axes(&self) -> &[Vec<f64>] {
        &self.axes
    }

    /// Number of axes.
    pub fn n_dim(&self) -> usize {
        self.axes.len()
    }

    /// `[min, max]` per axis.
    pub fn limits(&self) -> Vec<[f64; 2]> {
        self.axes
            .iter()
            .map(|axis| {
                let min = axis.iter().copied().fold(f64::INFINITY, f64::min);
                let max = axis.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                [min, max]
            })
            .collect()
    }

    /// Spacing between the first two coordinates of each axis (0 for single-point axes).
    pub fn step_size(&self) -> Vec<f64> {
        self.axes
            .iter()
            .map(|axis| match axis.as_slice() {
                [a, b, ..] => (b - a).abs(),
                _ => 0.0,
            })
            .collect()
    }

    /// Snap a point to the grid, independently per axis. Ties go to the first coordinate.
    pub fn closest_point(&self, point: &[f64]) -> ScanResult<Position> {
        if point.len() != self.axes.len() {
            return Err(ScanError::DimensionMismatch {
                what: "position coordinates",
                expected: self.axes.len(),
                found: point.len(),
            });
        }
        if let Some(x) = point.iter().find(|x| !x.is_finite()) {
            return Err(ScanError::MalformedPayload(format!(
                "non-finite coordinate {x} cannot be snapped to the grid"
            )));
        }
        Ok(point
            .iter()
            .zip(&self.axes)
            .map(|(&x, axis)| nearest_on_axis(x, axis))
            .collect())
    }

    /// Quantized deduplication key for a raw position.
    pub fn key(&self, point: &[f64]) -> ScanResult<(GridKey, Position)> {
        let snapped = self.closest_point(point)?;
        Ok((GridKey::from_snapped(&snapped), snapped))
    }
}

fn nearest_on_axis(x: f64, axis: &[f64]) -> f64 {
    let mut best = axis[0];
    let mut best_distance = (axis[0] - x).abs();
    for &candidate in &axis[1..] {
        let distance = (candidate - x).abs();
        // strict comparison keeps the first coordinate on ties
        if distance < best_distance {
            best = candidate;
            best_distance = distance;
        }
    }
    best
}

/// Map a point in the unit cube onto physical limits, axis by axis.
pub fn scale_unit_point(point: &[f64], limits: &[[f64; 2]]) -> ScanResult<Position> {
    if point.len() != limits.len() {
        return Err(ScanError::DimensionMismatch {
            what: "initial point",
            expected: limits.len(),
            found: point.len(),
        });
    }
    Ok(point
        .iter()
        .zip(limits)
        .map(|(&u, [lo, hi])| u * hi + (1.0 - u) * lo)
        .collect())
}

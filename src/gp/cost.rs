//! Movement cost functions.
//!
//! A cost function weighs how expensive it is to move the instrument from the
//! current position to each candidate. The model divides acquisition scores by
//! the cost, so cheap moves win among similarly promising candidates.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::{positions_close, Position};
use crate::error::{ScanError, ScanResult};
use crate::grid::InstrumentGrid;

/// Cost assigned to a candidate that rounds onto an already visited grid point.
pub const REVISIT_PENALTY: f64 = 1e9;

/// Campaign state the cost function sees, refreshed before every ask.
#[derive(Debug, Clone, Default)]
pub struct CostContext {
    /// Positions measured so far
    pub prev_points: Vec<Position>,
    /// Number of instrument axes
    pub n_dim: usize,
    /// Number of tasks
    pub n_tasks: usize,
    /// Grid used to detect revisits
    pub grid: Option<InstrumentGrid>,
}

/// Cost of moving from `origin` to each point.
pub trait CostFunction: Send + Sync {
    /// One cost per point, all strictly positive.
    fn cost(&self, origin: &[f64], points: &[Position], context: &CostContext) -> ScanResult<Vec<f64>>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PerAxis {
    Scalar(f64),
    Axes(Vec<f64>),
}

impl PerAxis {
    fn expand(&self, what: &'static str, n_dim: usize) -> ScanResult<Vec<f64>> {
        match self {
            PerAxis::Scalar(v) => Ok(vec![*v; n_dim]),
            PerAxis::Axes(v) if v.len() == n_dim => Ok(v.clone()),
            PerAxis::Axes(v) => Err(ScanError::DimensionMismatch {
                what,
                expected: n_dim,
                found: v.len(),
            }),
        }
    }
}

fn default_speed() -> PerAxis {
    PerAxis::Scalar(250.0)
}

fn default_weight() -> PerAxis {
    PerAxis::Scalar(1.0)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PerAxisParams {
    #[serde(default = "default_speed")]
    speed: PerAxis,
    #[serde(default = "default_weight")]
    weight: PerAxis,
}

/// `1 + Σ weight·|Δx| / speed`, with a large penalty for revisits.
///
/// Axes with a non-positive speed do not contribute.
#[derive(Debug, Clone)]
pub struct CostPerAxis {
    speed: PerAxis,
    weight: PerAxis,
}

impl CostPerAxis {
    /// Build from `cost_per_axis` parameters; `speed` and `weight` take a scalar or one value per axis.
    pub fn from_params(params: &Map<String, Value>) -> ScanResult<Self> {
        let p: PerAxisParams = serde_json::from_value(Value::Object(params.clone()))
            .map_err(|e| ScanError::Configuration(format!("invalid parameters for cost_per_axis: {e}")))?;
        Ok(Self {
            speed: p.speed,
            weight: p.weight,
        })
    }
}

impl CostFunction for CostPerAxis {
    fn cost(&self, origin: &[f64], points: &[Position], context: &CostContext) -> ScanResult<Vec<f64>> {
        let n_dim = origin.len();
        let speed = self.speed.expand("cost speed", n_dim)?;
        let weight = self.weight.expand("cost weight", n_dim)?;

        let mut out = Vec::with_capacity(points.len());
        for point in points {
            if point.len() != n_dim {
                return Err(ScanError::DimensionMismatch {
                    what: "cost candidate",
                    expected: n_dim,
                    found: point.len(),
                });
            }
            if let Some(grid) = &context.grid {
                let rounded = grid.closest_point(point)?;
                if context
                    .prev_points
                    .iter()
                    .any(|prev| positions_close(&rounded, prev))
                {
                    debug!(?point, ?rounded, "Candidate rounds onto a measured position");
                    out.push(REVISIT_PENALTY);
                    continue;
                }
            }
            let moved: f64 = (0..n_dim)
                .filter(|&d| speed[d] > 0.0)
                .map(|d| weight[d] * (point[d] - origin[d]).abs() / speed[d])
                .sum();
            out.push(1.0 + moved);
        }
        Ok(out)
    }
}

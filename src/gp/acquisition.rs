//! Acquisition functions: score candidate positions from the model posterior.
//!
//! Higher scores are better. Scores are computed for a batch of candidates at
//! once so models can vectorize their posterior queries.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::Position;
use crate::error::{ScanError, ScanResult};
use crate::gp::model::Posterior;

/// Scores candidate positions.
pub trait AcquisitionFunction: Send + Sync {
    /// One score per point, evaluated against `posterior`.
    fn evaluate(&self, points: &[Position], posterior: &dyn Posterior) -> ScanResult<Vec<f64>>;
}

fn default_norm() -> f64 {
    2.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct WeightedParams {
    a: f64,
    #[serde(default)]
    weights: Option<Vec<f64>>,
    #[serde(default = "default_norm")]
    norm: f64,
    #[serde(default)]
    c: f64,
}

fn parse<T: for<'de> Deserialize<'de>>(name: &str, params: &Map<String, Value>) -> ScanResult<T> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| ScanError::Configuration(format!("invalid parameters for {name}: {e}")))
}

fn task_weights(weights: &Option<Vec<f64>>, n_tasks: usize) -> ScanResult<Vec<f64>> {
    match weights {
        Some(w) if w.len() != n_tasks => Err(ScanError::DimensionMismatch {
            what: "acquisition weights",
            expected: n_tasks,
            found: w.len(),
        }),
        Some(w) => Ok(w.clone()),
        None => Ok(vec![1.0; n_tasks]),
    }
}

/// Weighted multi-task upper confidence bound.
///
/// `norm * (Σ w·mean + a·sqrt(Σ w·var) + c·Σ w·covar)`
#[derive(Debug, Clone)]
pub struct WeightedUcb {
    a: f64,
    weights: Option<Vec<f64>>,
    norm: f64,
    c: f64,
}

impl WeightedUcb {
    /// Exploitation weight `a`, optional task weights, variance norm and offset `c`.
    pub fn new(a: f64, weights: Option<Vec<f64>>, norm: f64, c: f64) -> Self {
        Self { a, weights, norm, c }
    }

    /// Build from `acquisition_function_nd` parameters (`a`, `weights`, `norm`, `c`).
    pub fn from_params(params: &Map<String, Value>) -> ScanResult<Self> {
        let p: WeightedParams = parse("acquisition_function_nd", params)?;
        Ok(Self::new(p.a, p.weights, p.norm, p.c))
    }
}

impl AcquisitionFunction for WeightedUcb {
    fn evaluate(&self, points: &[Position], posterior: &dyn Posterior) -> ScanResult<Vec<f64>> {
        let weights = task_weights(&self.weights, posterior.n_tasks())?;
        let mut total_mean = vec![0.0; points.len()];
        let mut total_var = vec![0.0; points.len()];
        let mut total_covar = vec![0.0; points.len()];
        for (task, w) in weights.iter().enumerate() {
            let mean = posterior.posterior_mean(points, task);
            let var = posterior.posterior_variance(points, task);
            for i in 0..points.len() {
                total_mean[i] += w * mean[i];
                total_var[i] += w * var[i];
            }
            if self.c != 0.0 {
                let covar = posterior.posterior_covariance(points, task);
                for i in 0..points.len() {
                    total_covar[i] += w * covar[i];
                }
            }
        }
        Ok((0..points.len())
            .map(|i| {
                self.norm
                    * (total_mean[i] + self.a * total_var[i].max(0.0).sqrt() + self.c * total_covar[i])
            })
            .collect())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExplorationParams {
    #[serde(default)]
    weights: Option<Vec<f64>>,
}

/// Pure exploration: `sqrt(Σ w·var)`.
#[derive(Debug, Clone, Default)]
pub struct Exploration {
    weights: Option<Vec<f64>>,
}

impl Exploration {
    /// Build from `exploration` parameters (optional `weights`).
    pub fn from_params(params: &Map<String, Value>) -> ScanResult<Self> {
        let p: ExplorationParams = parse("exploration", params)?;
        Ok(Self { weights: p.weights })
    }
}

impl AcquisitionFunction for Exploration {
    fn evaluate(&self, points: &[Position], posterior: &dyn Posterior) -> ScanResult<Vec<f64>> {
        let weights = task_weights(&self.weights, posterior.n_tasks())?;
        let mut total_var = vec![0.0; points.len()];
        for (task, w) in weights.iter().enumerate() {
            for (acc, v) in total_var.iter_mut().zip(posterior.posterior_variance(points, task)) {
                *acc += w * v;
            }
        }
        Ok(total_var.into_iter().map(|v| v.max(0.0).sqrt()).collect())
    }
}

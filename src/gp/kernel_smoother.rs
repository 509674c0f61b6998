//! Baseline surrogate model: anisotropic Gaussian kernel regression.
//!
//! The hyperparameter vector has `n_dim + 2` entries:
//! `[signal_variance, length_1, .., length_n_dim, task_length]`. Tasks are
//! treated as an extra input coordinate (the task index), so correlated tasks
//! share information the same way nearby positions do.
//!
//! The posterior mean is a Nadaraya-Watson estimate with weights `k / variance`.
//! The posterior variance is `signal_variance * (1 - max k)`, which vanishes on
//! measured points and approaches the signal variance far from any data.
//! Training and asking are population-based random searches.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::config::AskMethod;
use crate::core::{positions_close, Position, TaskVector};
use crate::error::{ScanError, ScanResult};
use crate::gp::acquisition::AcquisitionFunction;
use crate::gp::cost::{CostContext, CostFunction};
use crate::gp::model::{
    AskOptions, ModelFactory, ModelSpec, Posterior, SurrogateModel, TrainingOptions,
};

const MIN_LENGTH: f64 = 1e-12;
const MIN_VARIANCE: f64 = 1e-12;

/// Builds [`KernelSmoother`] models.
#[derive(Debug, Clone, Default)]
pub struct KernelSmootherFactory;

impl ModelFactory for KernelSmootherFactory {
    fn build(&self, spec: &ModelSpec) -> ScanResult<Box<dyn SurrogateModel>> {
        if spec.bounds.len() != spec.n_dim {
            return Err(ScanError::DimensionMismatch {
                what: "model input bounds",
                expected: spec.n_dim,
                found: spec.bounds.len(),
            });
        }
        Ok(Box::new(KernelSmoother::new(spec.clone())))
    }
}

/// Nadaraya-Watson smoother with a squared-exponential kernel and random-search training.
pub struct KernelSmoother {
    spec: ModelSpec,
    hyperparameters: Vec<f64>,
    positions: Vec<Position>,
    values: Vec<TaskVector>,
    variances: Vec<TaskVector>,
    cost: Option<Arc<dyn CostFunction>>,
    cost_context: CostContext,
    rng: StdRng,
}

struct Prediction {
    mean: f64,
    max_correlation: f64,
}

impl KernelSmoother {
    /// Smoother with length scales of a quarter of each input range.
    pub fn new(spec: ModelSpec) -> Self {
        let hyperparameters = std::iter::once(1.0)
            .chain(spec.bounds.iter().map(|[lo, hi]| ((hi - lo) / 4.0).max(MIN_LENGTH)))
            .chain(std::iter::once(1.0))
            .collect();
        Self {
            spec,
            hyperparameters,
            positions: Vec::new(),
            values: Vec::new(),
            variances: Vec::new(),
            cost: None,
            cost_context: CostContext::default(),
            rng: StdRng::from_entropy(),
        }
    }

    fn correlation(&self, hps: &[f64], a: &[f64], task_a: usize, b: &[f64], task_b: usize) -> f64 {
        let n_dim = self.spec.n_dim;
        let mut sq = 0.0;
        for d in 0..n_dim {
            let scaled = (a[d] - b[d]) / hps[1 + d].max(MIN_LENGTH);
            sq += scaled * scaled;
        }
        let task = (task_a as f64 - task_b as f64) / hps[n_dim + 1].max(MIN_LENGTH);
        (-0.5 * (sq + task * task)).exp()
    }

    fn predict(&self, hps: &[f64], x: &[f64], task: usize, skip: Option<usize>) -> Prediction {
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        let mut max_correlation: f64 = 0.0;
        for (n, position) in self.positions.iter().enumerate() {
            if skip == Some(n) {
                continue;
            }
            for t in 0..self.spec.n_tasks {
                let k = self.correlation(hps, x, task, position, t);
                let w = k / self.variances[n][t].max(MIN_VARIANCE);
                numerator += w * self.values[n][t];
                denominator += w;
                max_correlation = max_correlation.max(k);
            }
        }
        let mean = if denominator > f64::MIN_POSITIVE {
            numerator / denominator
        } else {
            0.0
        };
        Prediction {
            mean,
            max_correlation,
        }
    }

    /// Leave-one-out Gaussian negative log likelihood.
    fn loo_loss(&self, hps: &[f64]) -> f64 {
        let mut loss = 0.0;
        for (n, position) in self.positions.iter().enumerate() {
            for t in 0..self.spec.n_tasks {
                let p = self.predict(hps, position, t, Some(n));
                let var = hps[0].abs() * (1.0 - p.max_correlation).max(0.0)
                    + self.variances[n][t].max(MIN_VARIANCE);
                let residual = self.values[n][t] - p.mean;
                loss += residual * residual / var + var.ln();
            }
        }
        loss
    }

    fn sample_within(rng: &mut StdRng, lo: f64, hi: f64) -> f64 {
        if hi > lo {
            rng.gen_range(lo..=hi)
        } else {
            lo
        }
    }

    fn sample_near(rng: &mut StdRng, center: &[f64], bounds: &[[f64; 2]], radius: f64) -> Vec<f64> {
        center
            .iter()
            .zip(bounds)
            .map(|(&c, &[lo, hi])| {
                let r = radius * (hi - lo);
                Self::sample_within(rng, (c - r).max(lo), (c + r).min(hi))
            })
            .collect()
    }

    fn score(&self, candidates: &[Position], origin: &[f64], acquisition: &dyn AcquisitionFunction) -> ScanResult<Vec<f64>> {
        let mut scores = acquisition.evaluate(candidates, self)?;
        if let Some(cost) = &self.cost {
            let costs = cost.cost(origin, candidates, &self.cost_context)?;
            for (score, c) in scores.iter_mut().zip(costs) {
                // costs are >= 1; dividing a negative score would reward expensive moves
                if *score >= 0.0 {
                    *score /= c;
                } else {
                    *score *= c;
                }
            }
        }
        Ok(scores)
    }
}

impl Posterior for KernelSmoother {
    fn n_dim(&self) -> usize {
        self.spec.n_dim
    }

    fn n_tasks(&self) -> usize {
        self.spec.n_tasks
    }

    fn posterior_mean(&self, points: &[Position], task: usize) -> Vec<f64> {
        points
            .iter()
            .map(|x| self.predict(&self.hyperparameters, x, task, None).mean)
            .collect()
    }

    fn posterior_variance(&self, points: &[Position], task: usize) -> Vec<f64> {
        let signal = self.hyperparameters[0].abs();
        points
            .iter()
            .map(|x| {
                let p = self.predict(&self.hyperparameters, x, task, None);
                signal * (1.0 - p.max_correlation).max(0.0)
            })
            .collect()
    }

    fn posterior_covariance(&self, points: &[Position], task: usize) -> Vec<f64> {
        let Some(first) = points.first() else {
            return Vec::new();
        };
        let variances = self.posterior_variance(points, task);
        points
            .iter()
            .zip(&variances)
            .map(|(x, v)| {
                (variances[0] * v).sqrt()
                    * self.correlation(&self.hyperparameters, first, task, x, task)
            })
            .collect()
    }
}

impl SurrogateModel for KernelSmoother {
    fn init(&mut self, hyperparameters: Vec<f64>, options: &Map<String, Value>) -> ScanResult<()> {
        let expected = self.spec.n_dim + 2;
        if hyperparameters.len() != expected {
            return Err(ScanError::DimensionMismatch {
                what: "init_hyperparameters",
                expected,
                found: hyperparameters.len(),
            });
        }
        self.hyperparameters = hyperparameters;
        for (key, value) in options {
            match (key.as_str(), value.as_u64()) {
                ("seed", Some(seed)) => self.rng = StdRng::seed_from_u64(seed),
                _ => debug!(option = %key, %value, "Model option not used by kernel smoother"),
            }
        }
        Ok(())
    }

    fn hyperparameters(&self) -> &[f64] {
        &self.hyperparameters
    }

    fn n_samples(&self) -> usize {
        self.positions.len()
    }

    fn init_cost(&mut self, cost: Arc<dyn CostFunction>) {
        self.cost = Some(cost);
    }

    fn update_cost_context(&mut self, context: CostContext) {
        self.cost_context = context;
    }

    fn tell(
        &mut self,
        positions: &[Position],
        values: &[TaskVector],
        variances: &[TaskVector],
    ) -> ScanResult<()> {
        for (what, found) in [("model values", values.len()), ("model variances", variances.len())] {
            if found != positions.len() {
                return Err(ScanError::DimensionMismatch {
                    what,
                    expected: positions.len(),
                    found,
                });
            }
        }
        if let Some(p) = positions.iter().find(|p| p.len() != self.spec.n_dim) {
            return Err(ScanError::DimensionMismatch {
                what: "model position",
                expected: self.spec.n_dim,
                found: p.len(),
            });
        }
        if let Some(v) = values
            .iter()
            .chain(variances)
            .find(|v| v.len() != self.spec.n_tasks)
        {
            return Err(ScanError::DimensionMismatch {
                what: "model task vector",
                expected: self.spec.n_tasks,
                found: v.len(),
            });
        }
        self.positions = positions.to_vec();
        self.values = values.to_vec();
        self.variances = variances.to_vec();
        Ok(())
    }

    fn train(&mut self, options: &TrainingOptions) -> ScanResult<Vec<f64>> {
        if options.bounds.len() != self.hyperparameters.len() {
            return Err(ScanError::DimensionMismatch {
                what: "hyperparameter bounds",
                expected: self.hyperparameters.len(),
                found: options.bounds.len(),
            });
        }
        if self.positions.len() < 2 {
            debug!(samples = self.positions.len(), "Not enough samples to train");
            return Ok(self.hyperparameters.clone());
        }

        let clamped: Vec<f64> = self
            .hyperparameters
            .iter()
            .zip(&options.bounds)
            .map(|(h, [lo, hi])| h.clamp(*lo, *hi))
            .collect();
        let mut best_loss = self.loo_loss(&clamped);
        let mut best = clamped;

        for generation in 0..options.max_iter.max(1) {
            let previous = best_loss;
            for i in 0..options.pop_size {
                let candidate = if i % 2 == 0 {
                    options
                        .bounds
                        .iter()
                        .map(|[lo, hi]| Self::sample_within(&mut self.rng, *lo, *hi))
                        .collect()
                } else {
                    Self::sample_near(&mut self.rng, &best, &options.bounds, 0.1)
                };
                let loss = self.loo_loss(&candidate);
                if loss.is_finite() && loss < best_loss {
                    best_loss = loss;
                    best = candidate;
                }
            }
            debug!(generation, loss = best_loss, "Training generation");
            if (previous - best_loss).abs() < options.tolerance {
                break;
            }
        }
        self.hyperparameters = best.clone();
        Ok(best)
    }

    fn ask(
        &mut self,
        start: &[f64],
        acquisition: &dyn AcquisitionFunction,
        options: &AskOptions,
    ) -> ScanResult<Vec<Position>> {
        let n_dim = self.spec.n_dim;
        if options.bounds.len() != n_dim {
            return Err(ScanError::DimensionMismatch {
                what: "ask bounds",
                expected: n_dim,
                found: options.bounds.len(),
            });
        }
        if start.len() != n_dim {
            return Err(ScanError::DimensionMismatch {
                what: "ask start position",
                expected: n_dim,
                found: start.len(),
            });
        }

        let mut pool: Vec<(Position, f64)> = Vec::new();
        let mut best: Position = start.to_vec();
        let mut best_score = f64::NEG_INFINITY;

        for generation in 0..options.max_iter.max(1) {
            let radius = 0.25 / (generation + 1) as f64;
            let candidates: Vec<Position> = (0..options.pop_size)
                .map(|i| match options.method {
                    AskMethod::Global if generation == 0 || i % 2 == 0 => options
                        .bounds
                        .iter()
                        .map(|[lo, hi]| Self::sample_within(&mut self.rng, *lo, *hi))
                        .collect(),
                    AskMethod::Local if generation == 0 => {
                        Self::sample_near(&mut self.rng, start, &options.bounds, radius)
                    }
                    _ => Self::sample_near(&mut self.rng, &best, &options.bounds, radius),
                })
                .collect();
            let scores = self.score(&candidates, start, acquisition)?;

            let previous = best_score;
            for (candidate, score) in candidates.into_iter().zip(scores) {
                if !score.is_finite() {
                    continue;
                }
                if score > best_score {
                    best_score = score;
                    best = candidate.clone();
                }
                pool.push((candidate, score));
            }
            if generation > 0 && (best_score - previous).abs() < options.tol {
                break;
            }
        }

        pool.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        let mut chosen: Vec<Position> = Vec::with_capacity(options.n);
        for (candidate, _) in pool {
            if chosen.len() == options.n {
                break;
            }
            if !chosen.iter().any(|c| positions_close(c, &candidate)) {
                chosen.push(candidate);
            }
        }
        if chosen.is_empty() {
            return Err(ScanError::Model(
                "acquisition search produced no finite candidate".to_string(),
            ));
        }
        Ok(chosen)
    }
}

//! Surrogate model contract.
//!
//! The scan loop only needs a handful of operations from the model: ingest
//! data, train hyperparameters within bounds, propose the next positions and
//! answer posterior queries for acquisition functions. Any regression model
//! that can do that plugs in through [`ModelFactory`].

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::{AskMethod, AskSettings, TrainingSettings};
use crate::core::{Position, TaskVector};
use crate::error::ScanResult;
use crate::gp::acquisition::AcquisitionFunction;
use crate::gp::cost::{CostContext, CostFunction};

/// Posterior queries used by acquisition functions.
///
/// All queries take a batch of points and a task index and return one value
/// per point.
pub trait Posterior {
    /// Number of input dimensions.
    fn n_dim(&self) -> usize;

    /// Number of outputs.
    fn n_tasks(&self) -> usize;

    /// Posterior mean of `task` at each point.
    fn posterior_mean(&self, points: &[Position], task: usize) -> Vec<f64>;

    /// Posterior variance of `task` at each point.
    fn posterior_variance(&self, points: &[Position], task: usize) -> Vec<f64>;

    /// Covariance between the first point of the batch and every point of the batch.
    fn posterior_covariance(&self, points: &[Position], task: usize) -> Vec<f64>;
}

/// Static description of the model to build.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    /// `[min, max]` of the input space per axis
    pub bounds: Vec<[f64; 2]>,
    /// Number of instrument axes
    pub n_dim: usize,
    /// Number of reduction tasks
    pub n_tasks: usize,
}

/// Hyperparameter optimisation request.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOptions {
    /// `[min, max]` per hyperparameter
    pub bounds: Vec<[f64; 2]>,
    /// Candidate population per round
    pub pop_size: usize,
    /// Optimisation rounds
    pub max_iter: usize,
    /// Convergence threshold
    pub tolerance: f64,
}

impl From<&TrainingSettings> for TrainingOptions {
    fn from(settings: &TrainingSettings) -> Self {
        Self {
            bounds: settings.hyperparameter_bounds.clone(),
            pop_size: settings.pop_size,
            max_iter: settings.max_iter,
            tolerance: settings.tolerance,
        }
    }
}

/// Next-position query.
#[derive(Debug, Clone, PartialEq)]
pub struct AskOptions {
    /// Number of positions to return
    pub n: usize,
    /// Search bounds per axis
    pub bounds: Vec<[f64; 2]>,
    /// Global or local search
    pub method: AskMethod,
    /// Candidate population per round
    pub pop_size: usize,
    /// Search rounds
    pub max_iter: usize,
    /// Convergence threshold
    pub tol: f64,
}

impl AskOptions {
    /// Ask options with search bounds defaulting to the instrument limits.
    pub fn from_settings(settings: &AskSettings, limits: &[[f64; 2]]) -> Self {
        Self {
            n: settings.n,
            bounds: settings.bounds.clone().unwrap_or_else(|| limits.to_vec()),
            method: settings.method,
            pop_size: settings.pop_size,
            max_iter: settings.max_iter,
            tol: settings.tol,
        }
    }
}

/// A regression model over `n_dim` inputs with `n_tasks` outputs.
///
/// `train` and `ask` may take seconds; callers run them on a blocking thread.
pub trait SurrogateModel: Posterior + Send {
    /// Set the initial hyperparameters and free-form model options.
    fn init(&mut self, hyperparameters: Vec<f64>, options: &Map<String, Value>) -> ScanResult<()>;

    /// Current hyperparameter vector.
    fn hyperparameters(&self) -> &[f64];

    /// Number of positions currently ingested.
    fn n_samples(&self) -> usize;

    /// Attach a movement cost used to penalize candidates during `ask`.
    fn init_cost(&mut self, cost: Arc<dyn CostFunction>);

    /// Refresh the campaign state seen by the cost function.
    fn update_cost_context(&mut self, context: CostContext);

    /// Replace the ingested data. `variances` holds one variance per value.
    fn tell(
        &mut self,
        positions: &[Position],
        values: &[TaskVector],
        variances: &[TaskVector],
    ) -> ScanResult<()>;

    /// Optimise the hyperparameters within bounds and return the new vector.
    fn train(&mut self, options: &TrainingOptions) -> ScanResult<Vec<f64>>;

    /// Propose up to `options.n` positions, best first.
    fn ask(
        &mut self,
        start: &[f64],
        acquisition: &dyn AcquisitionFunction,
        options: &AskOptions,
    ) -> ScanResult<Vec<Position>>;
}

/// Builds a fresh model once the instrument geometry is known.
pub trait ModelFactory: Send + Sync {
    /// Build an untrained model for `spec`.
    fn build(&self, spec: &ModelSpec) -> ScanResult<Box<dyn SurrogateModel>>;
}

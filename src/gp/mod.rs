//! Surrogate model, acquisition and cost functions.
//!
//! - [`model`]: the traits the scan loops drive (`SurrogateModel`, `ModelFactory`)
//! - [`acquisition`]: scoring of candidate positions
//! - [`cost`]: movement cost penalties
//! - [`kernel_smoother`]: the built-in baseline model

pub mod acquisition;
pub mod cost;
pub mod kernel_smoother;
pub mod model;

pub use acquisition::{AcquisitionFunction, Exploration, WeightedUcb};
pub use cost::{CostContext, CostFunction, CostPerAxis};
pub use kernel_smoother::{KernelSmoother, KernelSmootherFactory};
pub use model::{AskOptions, ModelFactory, ModelSpec, Posterior, SurrogateModel, TrainingOptions};

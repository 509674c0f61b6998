//! Name-based lookup of reduction, acquisition and cost functions.
//!
//! Configuration refers to functions by name. The registry maps those names to
//! constructors and resolves the whole configuration once, when the scan is
//! built, so an unknown name fails the campaign before the instrument is touched.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Settings;
use crate::error::{ScanError, ScanResult};
use crate::gp::{AcquisitionFunction, CostFunction, CostPerAxis, Exploration, WeightedUcb};
use crate::tasks::{ReductionTask, RoiStatistic, Statistic, TaskReducer};

type ReductionFactory =
    Box<dyn Fn(&Map<String, Value>) -> ScanResult<Arc<dyn ReductionTask>> + Send + Sync>;
type AcquisitionFactory =
    Box<dyn Fn(&Map<String, Value>) -> ScanResult<Arc<dyn AcquisitionFunction>> + Send + Sync>;
type CostFactory =
    Box<dyn Fn(&Map<String, Value>) -> ScanResult<Arc<dyn CostFunction>> + Send + Sync>;

/// Functions resolved from a configuration.
#[derive(Clone)]
pub struct ResolvedFunctions {
    /// Reduction tasks in configuration order
    pub reducer: TaskReducer,
    /// Acquisition function
    pub acquisition: Arc<dyn AcquisitionFunction>,
    /// Movement cost, when configured
    pub cost: Option<Arc<dyn CostFunction>>,
}

/// Named constructors for reduction, acquisition and cost functions.
pub struct FunctionRegistry {
    reductions: HashMap<String, ReductionFactory>,
    acquisitions: HashMap<String, AcquisitionFactory>,
    costs: HashMap<String, CostFactory>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    /// Registry with the built-in functions.
    pub fn new() -> Self {
        let mut registry = Self {
            reductions: HashMap::new(),
            acquisitions: HashMap::new(),
            costs: HashMap::new(),
        };

        for (name, statistic) in [
            ("mean", Statistic::Mean),
            ("sum", Statistic::Sum),
            ("max", Statistic::Max),
            ("min", Statistic::Min),
            ("std", Statistic::Std),
        ] {
            registry.register_reduction(name, move |params| {
                Ok(Arc::new(RoiStatistic::from_params(statistic, params)?) as Arc<dyn ReductionTask>)
            });
        }

        registry.register_acquisition("acquisition_function_nd", |params| {
            Ok(Arc::new(WeightedUcb::from_params(params)?) as Arc<dyn AcquisitionFunction>)
        });
        registry.register_acquisition("exploration", |params| {
            Ok(Arc::new(Exploration::from_params(params)?) as Arc<dyn AcquisitionFunction>)
        });

        registry.register_cost("cost_per_axis", |params| {
            Ok(Arc::new(CostPerAxis::from_params(params)?) as Arc<dyn CostFunction>)
        });

        registry
    }

    /// Register (or replace) a reduction constructor.
    pub fn register_reduction<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Map<String, Value>) -> ScanResult<Arc<dyn ReductionTask>> + Send + Sync + 'static,
    {
        self.reductions.insert(name.to_string(), Box::new(factory));
    }

    /// Register (or replace) an acquisition constructor.
    pub fn register_acquisition<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Map<String, Value>) -> ScanResult<Arc<dyn AcquisitionFunction>> + Send + Sync + 'static,
    {
        self.acquisitions.insert(name.to_string(), Box::new(factory));
    }

    /// Register (or replace) a cost constructor.
    pub fn register_cost<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Map<String, Value>) -> ScanResult<Arc<dyn CostFunction>> + Send + Sync + 'static,
    {
        self.costs.insert(name.to_string(), Box::new(factory));
    }

    /// Instantiate a reduction by name.
    pub fn create_reduction(
        &self,
        name: &str,
        params: &Map<String, Value>,
    ) -> ScanResult<Arc<dyn ReductionTask>> {
        self.reductions
            .get(name)
            .ok_or_else(|| unknown("reduction", name))
            .and_then(|factory| factory(params))
    }

    /// Instantiate an acquisition function by name.
    pub fn create_acquisition(
        &self,
        name: &str,
        params: &Map<String, Value>,
    ) -> ScanResult<Arc<dyn AcquisitionFunction>> {
        self.acquisitions
            .get(name)
            .ok_or_else(|| unknown("acquisition", name))
            .and_then(|factory| factory(params))
    }

    /// Instantiate a cost function by name.
    pub fn create_cost(&self, name: &str, params: &Map<String, Value>) -> ScanResult<Arc<dyn CostFunction>> {
        self.costs
            .get(name)
            .ok_or_else(|| unknown("cost", name))
            .and_then(|factory| factory(params))
    }

    /// Resolve every function the configuration names.
    pub fn resolve(&self, settings: &Settings) -> ScanResult<ResolvedFunctions> {
        let tasks = settings
            .tasks
            .iter()
            .map(|task| self.create_reduction(&task.function, &task.params))
            .collect::<ScanResult<Vec<_>>>()?;
        let reducer = TaskReducer::new(settings.task_labels(), tasks);

        let acq = &settings.acquisition_function;
        let acquisition = self.create_acquisition(&acq.function, &acq.params)?;

        let cost = settings
            .cost_function
            .as_ref()
            .map(|c| self.create_cost(&c.function, &c.params))
            .transpose()?;

        Ok(ResolvedFunctions {
            reducer,
            acquisition,
            cost,
        })
    }
}

fn unknown(kind: &'static str, name: &str) -> ScanError {
    ScanError::UnknownFunction {
        kind,
        name: name.to_string(),
    }
}

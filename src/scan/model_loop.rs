//! Model update loop: feed data to the surrogate model, retrain it on schedule
//! and command the instrument to the positions it proposes.
//!
//! ```text
//! WarmingUp --> Active --(data ready)--> [Training] --> Asking --> Active ...
//!                  |
//!                  +--(stop or iteration cap)--> END sent --> done
//! ```
//!
//! The model is built lazily on the first data-ready tick after warm-up. Model
//! `train` and `ask` run on the blocking pool: the model is moved into the
//! blocking task and handed back together with the result.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::spawn_blocking;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::core::{HyperparameterRecord, Position};
use crate::error::{ScanError, ScanResult};
use crate::gp::{AskOptions, CostContext, ModelFactory, ModelSpec, SurrogateModel, TrainingOptions};
use crate::registry::ResolvedFunctions;
use crate::scan::control::ScanControl;
use crate::scan::persistence::HyperparameterHistory;
use crate::store::{Normalizer, PositionStore};
use crate::transport::{InstrumentInfo, Transport};

/// Whether the model is retrained at `iteration`.
pub fn training_due(iteration: u64, train_at: &BTreeSet<u64>, train_every: u64) -> bool {
    train_at.contains(&iteration) || (train_every > 0 && iteration % train_every == 0)
}

/// The model-update side of a campaign.
///
/// Borrows the shared campaign state for the duration of one [`ModelLoop::run`]
/// and owns the surrogate model once it is built.
pub struct ModelLoop<'a> {
    settings: &'a Settings,
    transport: &'a dyn Transport,
    store: &'a RwLock<PositionStore>,
    control: &'a ScanControl,
    history: &'a Mutex<HyperparameterHistory>,
    functions: &'a ResolvedFunctions,
    info: &'a InstrumentInfo,
    factory: Arc<dyn ModelFactory>,
    initial_points: Vec<Position>,
    history_path: Option<PathBuf>,
    last_asked: Option<Position>,
    normalizer: Normalizer,
    model: Option<Box<dyn SurrogateModel>>,
}

impl<'a> ModelLoop<'a> {
    /// Model loop over shared campaign state. The model itself is built from
    /// `factory` on the first data-ready tick.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &'a Settings,
        transport: &'a dyn Transport,
        store: &'a RwLock<PositionStore>,
        control: &'a ScanControl,
        history: &'a Mutex<HyperparameterHistory>,
        functions: &'a ResolvedFunctions,
        info: &'a InstrumentInfo,
        factory: Arc<dyn ModelFactory>,
    ) -> Self {
        let scanning = &settings.scanning;
        Self {
            settings,
            transport,
            store,
            control,
            history,
            functions,
            info,
            factory,
            initial_points: Vec::new(),
            history_path: None,
            last_asked: None,
            normalizer: Normalizer::new(scanning.normalize_values, scanning.fixed_normalization.clone()),
            model: None,
        }
    }

    /// Grid-snapped initial points the warm-up waits for.
    pub fn with_initial_points(mut self, points: Vec<Position>) -> Self {
        self.initial_points = points;
        self
    }

    /// Where the hyperparameter history is written after each training.
    pub fn with_history_path(mut self, path: PathBuf) -> Self {
        self.history_path = Some(path);
        self
    }

    /// Position the first `ask` starts from, normally the last queued initial point.
    pub fn with_last_asked(mut self, position: Option<Position>) -> Self {
        self.last_asked = position;
        self
    }

    /// Last position accepted by the instrument's `ADD_POINT`.
    pub fn last_asked(&self) -> Option<&Position> {
        self.last_asked.as_ref()
    }

    /// Run until stop, then send END to the instrument.
    pub async fn run(&mut self) -> ScanResult<()> {
        info!("Starting model loop");
        let result = self.run_active().await;
        if let Err(e) = self.transport.end().await {
            warn!(error = %e, "END failed");
        }
        result
    }

    async fn run_active(&mut self) -> ScanResult<()> {
        let settings = self.settings;
        let timing = &settings.timing;
        let max_points = settings.scanning.max_points;
        if self.control.sleep(timing.startup_delay).await {
            return Ok(());
        }
        self.warm_up().await;

        while !self.control.is_stopped() {
            if self.control.is_paused() {
                self.control.sleep(timing.pause_poll).await;
                continue;
            }
            if self.control.iteration() >= max_points {
                warn!(max_points, "Maximum number of iterations reached, ending scan");
                self.control.request_stop();
                break;
            }
            if !self.control.take_data_ready() {
                self.control.sleep(timing.idle_poll).await;
                continue;
            }

            let iteration = self.control.next_iteration();
            {
                let store = self.store.read();
                info!(
                    iteration,
                    max_points,
                    samples = store.n_positions(),
                    spectra = store.n_spectra(),
                    "Model iteration"
                );
            }
            if self.model.is_none() {
                self.init_model(iteration).await?;
            } else {
                self.tell(false)?;
                let scanning = &settings.scanning;
                if training_due(iteration, &scanning.train_at, scanning.train_every) {
                    self.train(iteration).await?;
                }
                self.ask().await?;
                self.control.mark_replot();
            }
        }
        Ok(())
    }

    /// Wait until the initial points are (mostly) measured.
    async fn warm_up(&self) {
        let n_initial = self.initial_points.len();
        if n_initial == 0 {
            return;
        }
        while !self.control.is_stopped() {
            let (n_positions, n_spectra, all_measured) = {
                let store = self.store.read();
                (
                    store.n_positions(),
                    store.n_spectra(),
                    self.initial_points.iter().all(|p| store.was_already_measured(p)),
                )
            };
            if n_positions > n_initial {
                info!(n_positions, "Enough positions to start the model");
                return;
            }
            if all_measured {
                info!("All initial points measured, starting the model");
                return;
            }
            if n_spectra as f64 > 1.2 * n_initial as f64 {
                info!(n_spectra, "Enough spectra to start the model");
                return;
            }
            debug!(n_positions, n_initial, "Waiting for initial points");
            self.control.sleep(self.settings.timing.warmup_poll).await;
        }
    }

    fn model_mut(&mut self) -> ScanResult<&mut Box<dyn SurrogateModel>> {
        self.model
            .as_mut()
            .ok_or_else(|| ScanError::Model("model not initialized".to_string()))
    }

    fn take_model(&mut self) -> ScanResult<Box<dyn SurrogateModel>> {
        self.model
            .take()
            .ok_or_else(|| ScanError::Model("model not initialized".to_string()))
    }

    /// Hand all data to the model, normalized.
    fn tell(&mut self, refresh_normalization: bool) -> ScanResult<()> {
        let (positions, values, variances) = {
            let store = self.store.read();
            (store.positions(), store.task_values(), store.variances())
        };
        let n_tasks = self.functions.reducer.n_tasks();
        let values = self.normalizer.apply(&values, n_tasks, refresh_normalization);
        if let (Some(position), Some(tasks)) = (positions.last(), values.last()) {
            debug!(?position, ?tasks, samples = positions.len(), "Telling model");
        }
        self.model_mut()?.tell(&positions, &values, &variances)
    }

    async fn init_model(&mut self, iteration: u64) -> ScanResult<()> {
        let n_dim = self.info.grid.n_dim();
        let spec = ModelSpec {
            bounds: self.info.limits(),
            n_dim,
            n_tasks: self.functions.reducer.n_tasks(),
        };
        debug!(?spec, "Building model");
        self.model = Some(self.factory.build(&spec)?);
        self.tell(false)?;

        let settings = self.settings;
        let fvgp = &settings.gp.fvgp;
        if fvgp.init_hyperparameters.len() != n_dim + 2 {
            return Err(ScanError::DimensionMismatch {
                what: "init_hyperparameters",
                expected: n_dim + 2,
                found: fvgp.init_hyperparameters.len(),
            });
        }
        for (key, value) in &fvgp.options {
            debug!(option = %key, %value, "Model option");
        }
        let hyperparameters = fvgp.init_hyperparameters.clone();
        self.model_mut()?.init(hyperparameters, &fvgp.options)?;
        info!(samples = self.store.read().n_positions(), "Initialized model");

        self.train(iteration).await?;

        if let Some(cost) = self.functions.cost.clone() {
            debug!("Initializing cost function");
            self.model_mut()?.init_cost(cost);
        }
        Ok(())
    }

    async fn train(&mut self, iteration: u64) -> ScanResult<()> {
        let options = TrainingOptions::from(&self.settings.gp.training);
        let old = self.model_mut()?.hyperparameters().to_vec();
        if options.bounds.len() != old.len() {
            return Err(ScanError::DimensionMismatch {
                what: "hyperparameter bounds",
                expected: old.len(),
                found: options.bounds.len(),
            });
        }
        self.history.lock().set_bounds_once(&options.bounds);
        let samples = self.store.read().n_positions();
        info!(iteration, samples, "Training model");
        self.tell(true)?;

        let bounds = options.bounds.clone();
        let mut model = self.take_model()?;
        let started = Instant::now();
        let (model, result) = spawn_blocking(move || {
            let result = model.train(&options);
            (model, result)
        })
        .await?;
        self.model = Some(model);
        let new = result?;
        let elapsed = started.elapsed();
        info!(elapsed = ?elapsed, "Training complete");

        if new == old {
            warn!("Training left the hyperparameters unchanged");
        }
        for (index, ((before, after), [lo, hi])) in old.iter().zip(&new).zip(&bounds).enumerate() {
            let change = if *before != 0.0 {
                (after - before) / before
            } else {
                f64::NAN
            };
            if after == lo || after == hi {
                warn!(index, before, after, change, lo, hi, "Hyperparameter hit its bound");
            } else {
                info!(index, before, after, change, "Hyperparameter");
            }
        }

        let mut history = self.history.lock();
        history.insert(HyperparameterRecord::new(new, elapsed, iteration, samples));
        if let Some(path) = &self.history_path {
            if let Err(e) = history.save(path) {
                error!(error = %e, "Could not save hyperparameter history");
            }
        }
        Ok(())
    }

    async fn ask(&mut self) -> ScanResult<()> {
        let info = self.info;
        let grid = &info.grid;
        let (positions, last_position) = {
            let store = self.store.read();
            (store.positions(), store.last_position().cloned())
        };
        let context = CostContext {
            prev_points: positions,
            n_dim: grid.n_dim(),
            n_tasks: self.functions.reducer.n_tasks(),
            grid: Some(grid.clone()),
        };
        self.model_mut()?.update_cost_context(context);

        let start = self
            .last_asked
            .clone()
            .or(last_position)
            .ok_or_else(|| ScanError::Model("no position to start asking from".to_string()))?;
        debug!(?start, "Asking model");

        let options = AskOptions::from_settings(&self.settings.gp.ask, &info.limits());
        let acquisition = self.functions.acquisition.clone();
        let mut model = self.take_model()?;
        let (model, result) = spawn_blocking(move || {
            let result = model.ask(&start, acquisition.as_ref(), &options);
            (model, result)
        })
        .await?;
        self.model = Some(model);

        let candidates = match result {
            Ok(candidates) => candidates,
            Err(ScanError::Model(msg)) => {
                error!(reason = %msg, "Model could not propose a position");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for candidate in candidates {
            let rounded = match grid.closest_point(&candidate) {
                Ok(rounded) => rounded,
                Err(e) => {
                    error!(from = ?candidate, error = %e, "Model proposed a position off the grid");
                    continue;
                }
            };
            info!(position = ?rounded, from = ?candidate, "Adding point to scan");
            let already = self.store.read().was_already_measured(&rounded);
            if already {
                warn!(position = ?rounded, "Point already evaluated");
            }
            match self.transport.add_point(&rounded).await {
                Ok(()) => self.last_asked = Some(rounded),
                Err(e) => error!(position = ?rounded, error = %e, "ADD_POINT failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::tests::MINIMAL;
    use crate::core::{RawMeasurement, TaskVector};
    use crate::gp::{AcquisitionFunction, CostFunction, Posterior};
    use crate::grid::InstrumentGrid;
    use crate::registry::FunctionRegistry;
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    /// What the test model returns, and what it was asked to do.
    #[derive(Default)]
    struct Script {
        /// Returned by `train`; the current hyperparameters when unset
        trained: Option<Vec<f64>>,
        /// Returned by every `ask`
        candidates: Vec<Position>,
        tells: usize,
        trains: usize,
        ask_starts: Vec<Position>,
    }

    struct ScriptedModel {
        script: Arc<Mutex<Script>>,
        hyperparameters: Vec<f64>,
        samples: usize,
    }

    impl Posterior for ScriptedModel {
        fn n_dim(&self) -> usize {
            2
        }
        fn n_tasks(&self) -> usize {
            2
        }
        fn posterior_mean(&self, points: &[Position], _task: usize) -> Vec<f64> {
            vec![0.0; points.len()]
        }
        fn posterior_variance(&self, points: &[Position], _task: usize) -> Vec<f64> {
            vec![1.0; points.len()]
        }
        fn posterior_covariance(&self, points: &[Position], _task: usize) -> Vec<f64> {
            vec![0.0; points.len()]
        }
    }

    impl SurrogateModel for ScriptedModel {
        fn init(&mut self, hyperparameters: Vec<f64>, _options: &Map<String, Value>) -> ScanResult<()> {
            self.hyperparameters = hyperparameters;
            Ok(())
        }
        fn hyperparameters(&self) -> &[f64] {
            &self.hyperparameters
        }
        fn n_samples(&self) -> usize {
            self.samples
        }
        fn init_cost(&mut self, _cost: Arc<dyn CostFunction>) {}
        fn update_cost_context(&mut self, _context: CostContext) {}
        fn tell(
            &mut self,
            positions: &[Position],
            _values: &[TaskVector],
            _variances: &[TaskVector],
        ) -> ScanResult<()> {
            self.samples = positions.len();
            self.script.lock().tells += 1;
            Ok(())
        }
        fn train(&mut self, _options: &TrainingOptions) -> ScanResult<Vec<f64>> {
            let mut script = self.script.lock();
            script.trains += 1;
            if let Some(trained) = &script.trained {
                self.hyperparameters = trained.clone();
            }
            Ok(self.hyperparameters.clone())
        }
        fn ask(
            &mut self,
            start: &[f64],
            _acquisition: &dyn AcquisitionFunction,
            _options: &AskOptions,
        ) -> ScanResult<Vec<Position>> {
            let mut script = self.script.lock();
            script.ask_starts.push(start.to_vec());
            Ok(script.candidates.clone())
        }
    }

    struct ScriptedFactory {
        script: Arc<Mutex<Script>>,
        builds: AtomicUsize,
    }

    impl ModelFactory for ScriptedFactory {
        fn build(&self, spec: &ModelSpec) -> ScanResult<Box<dyn SurrogateModel>> {
            assert_eq!(spec.n_dim, 2);
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedModel {
                script: self.script.clone(),
                hyperparameters: Vec::new(),
                samples: 0,
            }))
        }
    }

    /// Records every `ADD_POINT`, accepted or not.
    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<Position>>,
        reject: AtomicBool,
        ended: AtomicBool,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn start(&self) -> ScanResult<()> {
            Ok(())
        }
        async fn end(&self) -> ScanResult<()> {
            self.ended.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn status(&self) -> ScanResult<String> {
            Ok("READY".into())
        }
        async fn connect(&self) -> ScanResult<InstrumentInfo> {
            Ok(info())
        }
        async fn add_point(&self, position: &[f64]) -> ScanResult<()> {
            self.added.lock().push(position.to_vec());
            if self.reject.load(Ordering::SeqCst) {
                return Err(ScanError::TransportRejected("stage out of range".into()));
            }
            Ok(())
        }
        async fn measure(&self) -> ScanResult<String> {
            Ok("NO_DATA".into())
        }
    }

    fn info() -> InstrumentInfo {
        let axis = InstrumentGrid::axis_from_range(0.0, 10.0, 1.0).unwrap();
        InstrumentInfo {
            grid: InstrumentGrid::new(vec![axis.clone(), axis]).unwrap(),
            filename: PathBuf::from("scan.h5"),
            measurement_shape: vec![2],
        }
    }

    /// Shared state of one model loop under test.
    struct Bench {
        settings: Settings,
        functions: ResolvedFunctions,
        info: InstrumentInfo,
        store: RwLock<PositionStore>,
        control: ScanControl,
        history: Mutex<HyperparameterHistory>,
        transport: Recorder,
        script: Arc<Mutex<Script>>,
        factory: Arc<ScriptedFactory>,
    }

    impl Bench {
        fn new(script: Script) -> Self {
            let mut settings = Settings::from_toml_str(MINIMAL).unwrap();
            settings.timing.startup_delay = Duration::ZERO;
            settings.timing.idle_poll = Duration::from_millis(10);
            settings.timing.warmup_poll = Duration::from_millis(10);
            let functions = FunctionRegistry::new().resolve(&settings).unwrap();
            let info = info();
            let mut store = PositionStore::new(functions.reducer.clone(), true, 0.01);
            store.set_grid(info.grid.clone());
            let script = Arc::new(Mutex::new(script));
            let factory = Arc::new(ScriptedFactory {
                script: script.clone(),
                builds: AtomicUsize::new(0),
            });
            Self {
                settings,
                functions,
                info,
                store: RwLock::new(store),
                control: ScanControl::new(),
                history: Mutex::new(HyperparameterHistory::new()),
                transport: Recorder::default(),
                script,
                factory,
            }
        }

        fn model_loop(&self) -> ModelLoop<'_> {
            ModelLoop::new(
                &self.settings,
                &self.transport,
                &self.store,
                &self.control,
                &self.history,
                &self.functions,
                &self.info,
                self.factory.clone(),
            )
        }

        fn measure(&self, position: [f64; 2]) {
            let raw = RawMeasurement::from_flat(&[2], vec![1.0, 3.0]).unwrap();
            self.store.write().record(position.to_vec(), raw).unwrap();
        }

        fn builds(&self) -> usize {
            self.factory.builds.load(Ordering::SeqCst)
        }

        fn added(&self) -> Vec<Position> {
            self.transport.added.lock().clone()
        }

        /// Raise data-ready and wait until the loop has taken it.
        async fn tick(&self) {
            let before = self.control.iteration();
            self.control.mark_data_ready();
            wait_for(|| self.control.iteration() > before).await;
            // blocking model calls hold the paused clock until they return
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    fn script_with_candidates(candidates: Vec<Position>) -> Script {
        Script {
            candidates,
            ..Script::default()
        }
    }

    #[test]
    fn test_training_schedule_explicit_iterations() {
        let train_at: BTreeSet<u64> = [10, 20].into_iter().collect();
        let trained: Vec<u64> = (1..=30).filter(|i| training_due(*i, &train_at, 0)).collect();
        assert_eq!(trained, vec![10, 20]);
    }

    #[test]
    fn test_training_schedule_periodic() {
        let train_at: BTreeSet<u64> = [10, 20].into_iter().collect();
        let trained: Vec<u64> = (1..=22).filter(|i| training_due(*i, &train_at, 5)).collect();
        assert_eq!(trained, vec![5, 10, 15, 20]);
        assert!(training_due(7, &BTreeSet::new(), 7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_initializes_and_trains_without_asking() {
        let bench = Bench::new(script_with_candidates(vec![vec![7.0, 7.0]]));
        bench.measure([5.0, 5.0]);
        let mut model_loop = bench.model_loop();

        let (result, ()) = tokio::join!(model_loop.run(), async {
            bench.tick().await;
            bench.control.request_stop();
        });

        assert!(result.is_ok());
        assert_eq!(bench.builds(), 1);
        assert_eq!(bench.control.iteration(), 1);
        let script = bench.script.lock();
        assert_eq!(script.tells, 2);
        assert_eq!(script.trains, 1);
        assert!(script.ask_starts.is_empty());
        assert!(bench.added().is_empty());
        assert!(!bench.control.take_replot());
        assert!(bench.history.lock().get(1).is_some());
        assert!(bench.transport.ended.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ask_starts_from_last_accepted_point() {
        let bench = Bench::new(script_with_candidates(vec![vec![7.2, 6.9]]));
        bench.measure([5.0, 5.0]);
        let mut model_loop = bench.model_loop().with_last_asked(Some(vec![2.0, 3.0]));

        let (result, ()) = tokio::join!(model_loop.run(), async {
            bench.tick().await;
            bench.tick().await;
            assert!(bench.control.take_replot());
            bench.tick().await;
            bench.control.request_stop();
        });

        assert!(result.is_ok());
        assert_eq!(
            bench.script.lock().ask_starts,
            vec![vec![2.0, 3.0], vec![7.0, 7.0]]
        );
        assert_eq!(bench.added(), vec![vec![7.0, 7.0], vec![7.0, 7.0]]);
        assert_eq!(model_loop.last_asked(), Some(&vec![7.0, 7.0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ask_without_queued_point_starts_from_last_measured() {
        let bench = Bench::new(script_with_candidates(vec![vec![1.0, 9.0]]));
        bench.measure([5.0, 5.0]);
        bench.measure([3.0, 4.0]);
        let mut model_loop = bench.model_loop();

        let (result, ()) = tokio::join!(model_loop.run(), async {
            bench.tick().await;
            bench.tick().await;
            bench.control.request_stop();
        });

        assert!(result.is_ok());
        assert_eq!(bench.script.lock().ask_starts, vec![vec![3.0, 4.0]]);
        assert_eq!(model_loop.last_asked(), Some(&vec![1.0, 9.0]));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_already_measured_candidate_is_still_sent() {
        let bench = Bench::new(script_with_candidates(vec![vec![5.1, 4.8]]));
        bench.measure([5.0, 5.0]);
        let mut model_loop = bench.model_loop();

        let (result, ()) = tokio::join!(model_loop.run(), async {
            bench.tick().await;
            bench.tick().await;
            bench.control.request_stop();
        });

        assert!(result.is_ok());
        assert!(logs_contain("Point already evaluated"));
        assert_eq!(bench.added(), vec![vec![5.0, 5.0]]);
        assert_eq!(model_loop.last_asked(), Some(&vec![5.0, 5.0]));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_rejected_add_point_keeps_last_asked() {
        let bench = Bench::new(script_with_candidates(vec![vec![8.0, 8.0]]));
        bench.transport.reject.store(true, Ordering::SeqCst);
        bench.measure([5.0, 5.0]);
        let mut model_loop = bench.model_loop().with_last_asked(Some(vec![2.0, 3.0]));

        let (result, ()) = tokio::join!(model_loop.run(), async {
            bench.tick().await;
            bench.tick().await;
            bench.tick().await;
            bench.control.request_stop();
        });

        assert!(result.is_ok());
        assert!(logs_contain("ADD_POINT failed"));
        assert_eq!(bench.added(), vec![vec![8.0, 8.0], vec![8.0, 8.0]]);
        assert_eq!(
            bench.script.lock().ask_starts,
            vec![vec![2.0, 3.0], vec![2.0, 3.0]]
        );
        assert_eq!(model_loop.last_asked(), Some(&vec![2.0, 3.0]));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_off_grid_candidate_is_skipped() {
        let bench = Bench::new(script_with_candidates(vec![vec![f64::NAN, 1.0], vec![4.0, 4.0]]));
        bench.measure([5.0, 5.0]);
        let mut model_loop = bench.model_loop();

        let (result, ()) = tokio::join!(model_loop.run(), async {
            bench.tick().await;
            bench.tick().await;
            bench.control.request_stop();
        });

        assert!(result.is_ok());
        assert!(logs_contain("Model proposed a position off the grid"));
        assert_eq!(bench.added(), vec![vec![4.0, 4.0]]);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_hyperparameter_on_bound_is_warned() {
        let bench = Bench::new(Script {
            trained: Some(vec![10.0, 50.0, 20.0, 0.5]),
            ..Script::default()
        });
        bench.measure([5.0, 5.0]);
        let mut model_loop = bench.model_loop();

        let (result, ()) = tokio::join!(model_loop.run(), async {
            bench.tick().await;
            bench.control.request_stop();
        });

        assert!(result.is_ok());
        assert!(logs_contain("Hyperparameter hit its bound"));
        assert!(!logs_contain("Training left the hyperparameters unchanged"));
        let history = bench.history.lock();
        assert_eq!(
            history.latest().map(|r| r.hyperparameters.clone()),
            Some(vec![10.0, 50.0, 20.0, 0.5])
        );
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_unchanged_hyperparameters_are_warned() {
        let bench = Bench::new(Script::default());
        bench.measure([5.0, 5.0]);
        let mut model_loop = bench.model_loop();

        let (result, ()) = tokio::join!(model_loop.run(), async {
            bench.tick().await;
            bench.control.request_stop();
        });

        assert!(result.is_ok());
        assert!(logs_contain("Training left the hyperparameters unchanged"));
        assert!(!logs_contain("Hyperparameter hit its bound"));
    }

    /// Runs the loop with `initial` queued, feeding `before` and then `after`.
    /// Returns whether the model was built before `after` arrived.
    async fn warm_up_with(bench: &Bench, initial: Vec<Position>, before: &[[f64; 2]], after: &[[f64; 2]]) -> bool {
        let mut model_loop = bench.model_loop().with_initial_points(initial);
        let (result, early) = tokio::join!(model_loop.run(), async {
            for position in before {
                bench.measure(*position);
            }
            bench.control.mark_data_ready();
            tokio::time::sleep(Duration::from_millis(200)).await;
            let early = bench.builds() > 0;
            for position in after {
                bench.measure(*position);
            }
            wait_for(|| bench.builds() == 1).await;
            bench.control.request_stop();
            early
        });
        assert!(result.is_ok());
        early
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_warm_up_ends_on_enough_positions() {
        let bench = Bench::new(Script::default());
        let initial: Vec<Position> = (0..5).map(|i| vec![i as f64, i as f64]).collect();
        let early = warm_up_with(
            &bench,
            initial,
            &[[0.0, 9.0], [1.0, 9.0], [2.0, 9.0], [3.0, 9.0], [4.0, 9.0]],
            &[[5.0, 9.0]],
        )
        .await;

        assert!(!early);
        assert!(logs_contain("Enough positions to start the model"));
        assert!(!logs_contain("All initial points measured"));
        assert!(!logs_contain("Enough spectra to start the model"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_warm_up_ends_when_initial_points_measured() {
        let bench = Bench::new(Script::default());
        let early = warm_up_with(
            &bench,
            vec![vec![2.0, 2.0], vec![8.0, 8.0]],
            &[[2.0, 2.0]],
            &[[8.1, 7.9]],
        )
        .await;

        assert!(!early);
        assert!(logs_contain("All initial points measured"));
        assert!(!logs_contain("Enough positions to start the model"));
        assert!(!logs_contain("Enough spectra to start the model"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_warm_up_ends_on_enough_spectra() {
        let bench = Bench::new(Script::default());
        let early = warm_up_with(
            &bench,
            vec![vec![2.0, 2.0], vec![8.0, 8.0]],
            &[[2.0, 2.0], [2.0, 2.0]],
            &[[2.0, 2.0]],
        )
        .await;

        assert!(!early);
        assert!(logs_contain("Enough spectra to start the model"));
        assert!(!logs_contain("All initial points measured"));
        assert!(!logs_contain("Enough positions to start the model"));
    }
}

//! Campaign orchestrator.
//!
//! [`SmartScan`] owns everything a campaign needs: settings, resolved
//! functions, the position store, the hyperparameter history and the shared
//! [`ScanControl`]. A campaign runs in three phases:
//!
//! 1. [`SmartScan::init_scan`]: start the instrument (with one END+START
//!    recovery), wait for `READY`, connect, write the settings copy and queue
//!    the initial points.
//! 2. [`SmartScan::run`]: drive the acquisition, model, timer and
//!    visualization loops concurrently until stop.
//! 3. [`SmartScan::finalize`]: persist the hyperparameter history and save the
//!    visualizer. Runs exactly once, also when the orchestrator is dropped.
//!
//! Any loop that fails requests a stop so the others wind down too.

use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::core::Position;
use crate::error::{ScanError, ScanResult};
use crate::error_recovery::{start_with_retry, wait_until_ready, RetryPolicy};
use crate::gp::{KernelSmootherFactory, ModelFactory};
use crate::grid::scale_unit_point;
use crate::logging::DeferredFile;
use crate::registry::{FunctionRegistry, ResolvedFunctions};
use crate::scan::acquisition::acquisition_loop;
use crate::scan::control::ScanControl;
use crate::scan::initial_points;
use crate::scan::model_loop::ModelLoop;
use crate::scan::persistence::{save_settings, ArtifactPaths, HyperparameterHistory};
use crate::scan::timer::timer_loop;
use crate::scan::visualization::{visualization_loop, ScanSnapshot, Visualizer};
use crate::store::PositionStore;
use crate::transport::{InstrumentInfo, Transport};

/// Cloneable remote control for a running campaign.
#[derive(Debug, Clone)]
pub struct ScanHandle {
    control: Arc<ScanControl>,
}

impl ScanHandle {
    /// Handle over `control`.
    pub fn new(control: Arc<ScanControl>) -> Self {
        Self { control }
    }

    /// Hold every loop.
    pub fn pause(&self) {
        self.control.pause();
    }

    /// Release a pause.
    pub fn resume(&self) {
        self.control.resume();
    }

    /// Request a cooperative stop of every loop.
    pub fn stop(&self) {
        self.control.request_stop();
    }

    /// Whether stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }

    /// Whether the campaign is paused.
    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }
}

/// What a finished campaign did.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSummary {
    /// Model-loop iterations run
    pub iterations: u64,
    /// Distinct grid points measured
    pub unique_positions: usize,
    /// Raw measurements received
    pub spectra: usize,
    /// Trainings recorded in the hyperparameter history
    pub trainings: usize,
    /// Wall time of the campaign
    pub elapsed: Duration,
}

/// One adaptive scan campaign against one instrument.
///
/// Runs the acquisition, model, timer and visualization loops concurrently
/// until stop, then finalizes exactly once.
pub struct SmartScan {
    settings: Settings,
    transport: Arc<dyn Transport>,
    functions: ResolvedFunctions,
    factory: Arc<dyn ModelFactory>,
    control: Arc<ScanControl>,
    store: RwLock<PositionStore>,
    history: Mutex<HyperparameterHistory>,
    visualizer: Mutex<Option<Box<dyn Visualizer>>>,
    log_file: Option<DeferredFile>,
    duration: Duration,
    info: Option<InstrumentInfo>,
    paths: Option<ArtifactPaths>,
    initial_points: Vec<Position>,
    last_asked: Option<Position>,
    finalized: AtomicBool,
}

fn build_store(settings: &Settings, functions: &ResolvedFunctions) -> PositionStore {
    PositionStore::new(
        functions.reducer.clone(),
        settings.scanning.merge_unique_positions,
        settings.scanning.base_error,
    )
}

/// Request a stop when `future` fails so sibling loops wind down.
async fn stop_on_error<F>(control: &ScanControl, task: &'static str, future: F) -> ScanResult<()>
where
    F: Future<Output = ScanResult<()>>,
{
    let result = future.await;
    if let Err(e) = &result {
        error!(task, error = %e, "Loop failed, stopping scan");
        control.request_stop();
    }
    result
}

impl SmartScan {
    /// Build a campaign with the built-in functions and model.
    ///
    /// Every function named in `settings` is resolved here, so an unknown
    /// name fails before the instrument is contacted.
    pub fn new(settings: Settings, transport: Arc<dyn Transport>) -> ScanResult<Self> {
        let functions = FunctionRegistry::new().resolve(&settings)?;
        let store = build_store(&settings, &functions);
        let duration = settings.scanning.duration;
        Ok(Self {
            settings,
            transport,
            functions,
            factory: Arc::new(KernelSmootherFactory),
            control: Arc::new(ScanControl::new()),
            store: RwLock::new(store),
            history: Mutex::new(HyperparameterHistory::new()),
            visualizer: Mutex::new(None),
            log_file: None,
            duration,
            info: None,
            paths: None,
            initial_points: Vec::new(),
            last_asked: None,
            finalized: AtomicBool::new(false),
        })
    }

    /// Resolve functions against a custom registry.
    pub fn with_registry(mut self, registry: &FunctionRegistry) -> ScanResult<Self> {
        let functions = registry.resolve(&self.settings)?;
        self.store = RwLock::new(build_store(&self.settings, &functions));
        self.functions = functions;
        Ok(self)
    }

    /// Use another surrogate model.
    pub fn with_model_factory(mut self, factory: Arc<dyn ModelFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Feed snapshots to `visualizer` whenever the model asks for a redraw.
    pub fn with_visualizer(self, visualizer: Box<dyn Visualizer>) -> Self {
        *self.visualizer.lock() = Some(visualizer);
        self
    }

    /// File log to attach once the artifact directory is known.
    pub fn with_log_file(mut self, log_file: DeferredFile) -> Self {
        self.log_file = Some(log_file);
        self
    }

    /// Override the configured time budget.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Remote control usable from other tasks.
    pub fn handle(&self) -> ScanHandle {
        ScanHandle::new(self.control.clone())
    }

    /// Settings the campaign was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Instrument geometry, once connected.
    pub fn instrument(&self) -> Option<&InstrumentInfo> {
        self.info.as_ref()
    }

    /// Artifact paths, once connected.
    pub fn artifacts(&self) -> Option<&ArtifactPaths> {
        self.paths.as_ref()
    }

    /// Last position the instrument accepted.
    pub fn last_asked(&self) -> Option<&Position> {
        self.last_asked.as_ref()
    }

    /// Current campaign state.
    pub fn snapshot(&self) -> ScanSnapshot {
        ScanSnapshot::capture(&self.control, &self.store, &self.history)
    }

    /// Start the instrument, connect and queue the initial points.
    pub async fn init_scan(&mut self) -> ScanResult<()> {
        let timing = &self.settings.timing;
        let transport = self.transport.as_ref();

        let start_policy = RetryPolicy {
            max_attempts: 2,
            backoff_delay: timing.start_retry_backoff,
        };
        start_with_retry(transport, &start_policy).await?;
        let status_policy = RetryPolicy {
            max_attempts: timing.status_attempts,
            backoff_delay: timing.status_poll,
        };
        wait_until_ready(transport, &status_policy).await?;

        let info = transport.connect().await?;
        if info.grid.n_dim() == 0 {
            return Err(ScanError::TransportConnect("instrument reported no axes".to_string()));
        }
        info!(
            axes = info.grid.n_dim(),
            limits = ?info.limits(),
            step_size = ?info.step_size(),
            shape = ?info.measurement_shape,
            filename = %info.filename.display(),
            "Connected to instrument"
        );

        let paths = ArtifactPaths::from_instrument_filename(&info.filename)?;
        if let Some(log_file) = &self.log_file {
            match log_file.attach(&paths.log) {
                Ok(()) => info!(path = %paths.log.display(), "Logging to file"),
                Err(e) => warn!(path = %paths.log.display(), error = %e, "Could not open log file"),
            }
        }
        save_settings(&self.settings, &paths.settings)?;
        self.store.write().set_grid(info.grid.clone());

        let mut queued = Vec::new();
        if let Some(name) = &self.settings.scanning.initial_points {
            let unit = initial_points::layout(name).ok_or_else(|| {
                ScanError::Configuration(format!("Unknown initial point layout '{name}'"))
            })?;
            let limits = info.limits();
            for point in &unit {
                let scaled = scale_unit_point(point, &limits)?;
                let snapped = info.grid.closest_point(&scaled)?;
                transport.add_point(&snapped).await?;
                queued.push(snapped);
            }
            info!(layout = %name, points = queued.len(), "Queued initial points");
        }

        self.last_asked = queued.last().cloned();
        self.initial_points = queued;
        self.paths = Some(paths);
        self.info = Some(info);
        Ok(())
    }

    /// Run every loop until stop, then finalize.
    ///
    /// Calls [`init_scan`](Self::init_scan) first if it has not run yet.
    pub async fn run(&mut self) -> ScanResult<ScanSummary> {
        if self.info.is_none() {
            if let Err(e) = self.init_scan().await {
                self.finalize();
                return Err(e);
            }
        }
        let info = self
            .info
            .as_ref()
            .ok_or_else(|| ScanError::TransportConnect("not connected".to_string()))?;
        let started = Instant::now();
        let settings = &self.settings;
        let control = self.control.as_ref();
        let transport = self.transport.as_ref();

        let mut model_loop = ModelLoop::new(
            settings,
            transport,
            &self.store,
            control,
            &self.history,
            &self.functions,
            info,
            self.factory.clone(),
        )
        .with_initial_points(self.initial_points.clone())
        .with_last_asked(self.last_asked.clone());
        if let Some(paths) = &self.paths {
            model_loop = model_loop.with_history_path(paths.hyperparameters.clone());
        }

        info!(duration = ?self.duration, "Starting scan loops");
        let (acquisition, model, timer, visualization) = tokio::join!(
            stop_on_error(
                control,
                "acquisition",
                acquisition_loop(transport, &self.store, control, info, &settings.timing),
            ),
            stop_on_error(control, "model", model_loop.run()),
            stop_on_error(
                control,
                "timer",
                timer_loop(control, self.duration, settings.timing.timer_tick),
            ),
            stop_on_error(
                control,
                "visualization",
                visualization_loop(control, &self.store, &self.history, &self.visualizer, &settings.timing),
            ),
        );
        let last_asked = model_loop.last_asked().cloned();
        drop(model_loop);
        self.last_asked = last_asked;

        let summary = self.summary(started.elapsed());
        self.finalize();
        acquisition?;
        model?;
        timer?;
        visualization?;
        info!(
            iterations = summary.iterations,
            positions = summary.unique_positions,
            spectra = summary.spectra,
            trainings = summary.trainings,
            elapsed = ?summary.elapsed,
            "Scan finished"
        );
        Ok(summary)
    }

    fn summary(&self, elapsed: Duration) -> ScanSummary {
        let store = self.store.read();
        ScanSummary {
            iterations: self.control.iteration(),
            unique_positions: store.n_positions(),
            spectra: store.n_spectra(),
            trainings: self.history.lock().len(),
            elapsed,
        }
    }

    /// Persist the history and save the visualizer. Effective once.
    ///
    /// Failures are logged and never returned.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.control.request_stop();

        if let Some(paths) = &self.paths {
            let history = self.history.lock();
            if !history.is_empty() {
                if let Err(e) = history.save(&paths.hyperparameters) {
                    error!(error = %e, "Could not save hyperparameter history");
                }
            }
        }
        if let Some(visualizer) = self.visualizer.lock().as_mut() {
            if let Some(paths) = &self.paths {
                let snapshot = ScanSnapshot::capture(&self.control, &self.store, &self.history);
                if let Err(e) = visualizer.update(&snapshot) {
                    warn!(error = %e, "Final visualizer update failed");
                }
                if let Err(e) = visualizer.save(&paths.stem) {
                    error!(error = %e, "Could not save visualization");
                }
            }
            visualizer.close();
        }
        info!("Scan finalized");
    }

    /// Whether the campaign has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }
}

impl Drop for SmartScan {
    fn drop(&mut self) {
        self.finalize();
    }
}

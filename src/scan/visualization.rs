//! Read-only campaign snapshots for visualization consumers.
//!
//! The model loop raises the replot flag after every ask. The visualization
//! loop consumes the flag, captures a [`ScanSnapshot`] and hands it to the
//! attached [`Visualizer`]. Rendering is up to the visualizer; the crate ships
//! [`SnapshotWriter`], which keeps the latest snapshot and writes it as JSON
//! when the campaign is finalized.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::TimingSettings;
use crate::core::{Position, RawMeasurement, TaskVector};
use crate::error::{ScanError, ScanResult};
use crate::scan::control::ScanControl;
use crate::scan::persistence::HyperparameterHistory;
use crate::store::PositionStore;

/// Campaign state at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSnapshot {
    /// Model iterations run
    pub iteration: u64,
    /// Time budget left
    pub remaining_secs: u64,
    /// Raw measurements received
    pub n_spectra: usize,
    /// Positions the model is fed
    pub positions: Vec<Position>,
    /// Task labels in configuration order
    pub task_labels: Vec<String>,
    /// Task vector per position
    pub task_values: Vec<TaskVector>,
    /// Most recent raw measurement
    pub last_spectrum: Option<RawMeasurement>,
    /// Latest trained hyperparameters
    pub hyperparameters: Option<Vec<f64>>,
}

impl ScanSnapshot {
    /// Read the shared campaign state. Locks are released before returning.
    pub fn capture(
        control: &ScanControl,
        store: &RwLock<PositionStore>,
        history: &Mutex<HyperparameterHistory>,
    ) -> Self {
        let hyperparameters = history.lock().latest().map(|r| r.hyperparameters.clone());
        let store = store.read();
        Self {
            iteration: control.iteration(),
            remaining_secs: control.remaining().as_secs(),
            n_spectra: store.n_spectra(),
            positions: store.positions(),
            task_labels: store.reducer().labels().to_vec(),
            task_values: store.task_values(),
            last_spectrum: store.last_spectrum().cloned(),
            hyperparameters,
        }
    }
}

/// Consumer of campaign snapshots.
pub trait Visualizer: Send {
    /// Take a new snapshot.
    fn update(&mut self, snapshot: &ScanSnapshot) -> ScanResult<()>;

    /// Persist the final state next to the campaign artifacts.
    fn save(&mut self, _stem: &Path) -> ScanResult<()> {
        Ok(())
    }

    /// Release any resources. Called once when the campaign ends.
    fn close(&mut self) {}
}

/// Keeps the latest snapshot and writes it to `<stem>_snapshot.json` on save.
#[derive(Debug, Default)]
pub struct SnapshotWriter {
    latest: Option<ScanSnapshot>,
    written: Option<PathBuf>,
}

impl SnapshotWriter {
    /// Writer with nothing captured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent snapshot.
    pub fn latest(&self) -> Option<&ScanSnapshot> {
        self.latest.as_ref()
    }

    /// Where the last save wrote to.
    pub fn written(&self) -> Option<&Path> {
        self.written.as_deref()
    }
}

impl Visualizer for SnapshotWriter {
    fn update(&mut self, snapshot: &ScanSnapshot) -> ScanResult<()> {
        debug!(
            iteration = snapshot.iteration,
            positions = snapshot.positions.len(),
            "Snapshot updated"
        );
        self.latest = Some(snapshot.clone());
        Ok(())
    }

    fn save(&mut self, stem: &Path) -> ScanResult<()> {
        let Some(snapshot) = &self.latest else {
            return Ok(());
        };
        let mut path = stem.as_os_str().to_owned();
        path.push("_snapshot.json");
        let path = PathBuf::from(path);
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| ScanError::Persistence(format!("cannot serialize snapshot: {e}")))?;
        std::fs::write(&path, json)?;
        info!(path = %path.display(), "Saved final snapshot");
        self.written = Some(path);
        Ok(())
    }
}

/// Feed snapshots to the visualizer whenever the replot flag is raised.
pub async fn visualization_loop(
    control: &ScanControl,
    store: &RwLock<PositionStore>,
    history: &Mutex<HyperparameterHistory>,
    visualizer: &Mutex<Option<Box<dyn Visualizer>>>,
    timing: &TimingSettings,
) -> ScanResult<()> {
    if visualizer.lock().is_none() {
        return Ok(());
    }
    info!("Starting visualization loop");
    if control.sleep(timing.startup_delay).await {
        return Ok(());
    }
    while !control.is_stopped() {
        if control.is_paused() {
            control.sleep(timing.pause_poll).await;
            continue;
        }
        if control.take_replot() {
            let snapshot = ScanSnapshot::capture(control, store, history);
            if let Some(v) = visualizer.lock().as_mut() {
                if let Err(e) = v.update(&snapshot) {
                    warn!(error = %e, "Visualizer update failed");
                }
            }
        }
        control.sleep(timing.idle_poll).await;
    }
    Ok(())
}

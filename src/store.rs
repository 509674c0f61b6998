//! Campaign data: measured positions, raw measurements and task vectors.
//!
//! The store keeps two views of the same data:
//!
//! - an append-only raw view, one entry per `MEASURE` reply, always maintained;
//! - a deduplicated view keyed by the grid-rounded position, used when
//!   `scanning.merge_unique_positions` is enabled. Each record keeps every raw
//!   measurement that landed on its grid point and recomputes the mean (and the
//!   task vector reduced from it) on every arrival.
//!
//! The model is fed from the deduplicated view when merging is enabled and from
//! the raw view otherwise.

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::NormalizeMode;
use crate::core::{positions_close, GridKey, Position, RawMeasurement, TaskVector};
use crate::error::{ScanError, ScanResult};
use crate::grid::InstrumentGrid;
use crate::tasks::TaskReducer;

/// All measurements that landed on one grid point.
#[derive(Debug, Clone)]
pub struct AggregatedRecord {
    position: Position,
    measurements: Vec<RawMeasurement>,
    mean: RawMeasurement,
    tasks: TaskVector,
}

impl AggregatedRecord {
    /// Grid point the measurements landed on.
    pub fn position(&self) -> &Position {
        &self.position
    }

    /// Number of measurements aggregated.
    pub fn count(&self) -> usize {
        self.measurements.len()
    }

    /// Element-wise mean of the measurements.
    pub fn mean(&self) -> &RawMeasurement {
        &self.mean
    }

    /// Task vector reduced from the mean.
    pub fn tasks(&self) -> &TaskVector {
        &self.tasks
    }
}

/// What a call to [`PositionStore::record`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// First raw entry (or first measurement of a grid point)
    New {
        /// Grid point, or the raw position when merging is off
        position: Position,
        /// Task vector of the measurement
        tasks: TaskVector,
    },
    /// Merged into an existing grid point
    Merged {
        /// Grid point the measurement landed on
        position: Position,
        /// Task vector of the updated mean
        tasks: TaskVector,
        /// Measurements now aggregated on the point
        count: usize,
    },
}

#[derive(Debug, Default)]
struct RawView {
    positions: Vec<Position>,
    measurements: Vec<RawMeasurement>,
    tasks: Vec<TaskVector>,
}

/// Measured data of one campaign.
pub struct PositionStore {
    reducer: TaskReducer,
    merge_unique: bool,
    base_error: f64,
    grid: Option<InstrumentGrid>,
    raw: RawView,
    records: Vec<AggregatedRecord>,
    index: HashMap<GridKey, usize>,
}

impl PositionStore {
    /// Empty store. Merging needs a grid, see [`PositionStore::set_grid`].
    pub fn new(reducer: TaskReducer, merge_unique: bool, base_error: f64) -> Self {
        Self {
            reducer,
            merge_unique,
            base_error,
            grid: None,
            raw: RawView::default(),
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Attach the instrument grid used to quantize positions.
    pub fn set_grid(&mut self, grid: InstrumentGrid) {
        self.grid = Some(grid);
    }

    /// Reducer applied to every measurement.
    pub fn reducer(&self) -> &TaskReducer {
        &self.reducer
    }

    /// Whether repeated measurements are merged per grid point.
    pub fn merges_unique_positions(&self) -> bool {
        self.merge_unique
    }

    /// Record one measurement.
    ///
    /// Reduction failures (including a task-vector length mismatch) are
    /// returned to the caller and leave the store untouched.
    pub fn record(&mut self, position: Position, raw: RawMeasurement) -> ScanResult<RecordOutcome> {
        let raw_tasks = self.reducer.reduce(&position, &raw)?;

        if !self.merge_unique {
            self.push_raw(position.clone(), raw, raw_tasks.clone());
            return Ok(RecordOutcome::New {
                position,
                tasks: raw_tasks,
            });
        }

        let grid = self.grid.as_ref().ok_or_else(|| {
            ScanError::Configuration("position store has no instrument grid".to_string())
        })?;
        let (key, snapped) = grid.key(&position)?;

        let outcome = match self.index.get(&key).copied() {
            Some(slot) => {
                let record = &self.records[slot];
                let mut measurements = record.measurements.clone();
                measurements.push(raw.clone());
                let mean = RawMeasurement::mean_of(&measurements)?;
                let tasks = self.reducer.reduce(&record.position, &mean)?;
                let record = &mut self.records[slot];
                record.measurements = measurements;
                record.mean = mean;
                record.tasks = tasks.clone();
                debug!(position = ?record.position, count = record.count(), "Merged repeated measurement");
                RecordOutcome::Merged {
                    position: record.position.clone(),
                    tasks,
                    count: record.count(),
                }
            }
            None => {
                self.index.insert(key, self.records.len());
                self.records.push(AggregatedRecord {
                    position: snapped.clone(),
                    measurements: vec![raw.clone()],
                    mean: raw.clone(),
                    tasks: raw_tasks.clone(),
                });
                RecordOutcome::New {
                    position: snapped,
                    tasks: raw_tasks.clone(),
                }
            }
        };
        self.push_raw(position, raw, raw_tasks);
        Ok(outcome)
    }

    fn push_raw(&mut self, position: Position, raw: RawMeasurement, tasks: TaskVector) {
        self.raw.positions.push(position);
        self.raw.measurements.push(raw);
        self.raw.tasks.push(tasks);
    }

    /// Positions fed to the model.
    pub fn positions(&self) -> Vec<Position> {
        if self.merge_unique {
            self.records.iter().map(|r| r.position.clone()).collect()
        } else {
            self.raw.positions.clone()
        }
    }

    /// Task vectors fed to the model, aligned with [`positions`](Self::positions).
    pub fn task_values(&self) -> Vec<TaskVector> {
        if self.merge_unique {
            self.records.iter().map(|r| r.tasks.clone()).collect()
        } else {
            self.raw.tasks.clone()
        }
    }

    /// Per-task measurement variances, aligned with [`positions`](Self::positions).
    ///
    /// Merged records report `base_error / sqrt(count)`; raw entries report 1.
    pub fn variances(&self) -> Vec<TaskVector> {
        let n_tasks = self.reducer.n_tasks();
        if self.merge_unique {
            self.records
                .iter()
                .map(|r| vec![self.base_error / (r.count() as f64).sqrt(); n_tasks])
                .collect()
        } else {
            vec![vec![1.0; n_tasks]; self.raw.positions.len()]
        }
    }

    /// Number of positions fed to the model.
    pub fn n_positions(&self) -> usize {
        if self.merge_unique {
            self.records.len()
        } else {
            self.raw.positions.len()
        }
    }

    /// Number of raw measurements received.
    pub fn n_spectra(&self) -> usize {
        self.raw.measurements.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.raw.measurements.is_empty()
    }

    /// Most recent raw measurement.
    pub fn last_spectrum(&self) -> Option<&RawMeasurement> {
        self.raw.measurements.last()
    }

    /// Most recently measured position as reported by the instrument.
    pub fn last_position(&self) -> Option<&Position> {
        self.raw.positions.last()
    }

    /// Every reported position, in arrival order.
    pub fn raw_positions(&self) -> &[Position] {
        &self.raw.positions
    }

    /// Deduplicated records, in first-arrival order.
    pub fn records(&self) -> &[AggregatedRecord] {
        &self.records
    }

    /// Whether a position close to `position` has already been measured.
    pub fn was_already_measured(&self, position: &[f64]) -> bool {
        if self.merge_unique {
            self.records
                .iter()
                .any(|r| positions_close(position, &r.position))
        } else {
            self.raw
                .positions
                .iter()
                .any(|p| positions_close(position, p))
        }
    }
}

/// Task-value scaling applied before data reaches the model.
#[derive(Debug, Clone)]
pub struct Normalizer {
    mode: NormalizeMode,
    fixed: Option<Vec<f64>>,
    cached: Option<Vec<f64>>,
}

impl Normalizer {
    /// Scaler for `mode`; `fixed` holds the constants of [`NormalizeMode::Fixed`].
    pub fn new(mode: NormalizeMode, fixed: Option<Vec<f64>>) -> Self {
        Self {
            mode,
            fixed,
            cached: None,
        }
    }

    /// Configured scaling mode.
    pub fn mode(&self) -> NormalizeMode {
        self.mode
    }

    /// Weights for the current data.
    ///
    /// `refresh` forces the cached weights to be recomputed in `training` mode;
    /// `init` mode computes them once and ignores it.
    pub fn weights(&mut self, values: &[TaskVector], n_tasks: usize, refresh: bool) -> Vec<f64> {
        match self.mode {
            NormalizeMode::Never => vec![1.0; n_tasks],
            NormalizeMode::Fixed => match &self.fixed {
                Some(constants) => constants.iter().map(|c| 1.0 / c).collect(),
                None => vec![1.0; n_tasks],
            },
            NormalizeMode::Init => self.cached_or_compute(values, n_tasks, false),
            NormalizeMode::Training => self.cached_or_compute(values, n_tasks, refresh),
            NormalizeMode::Always => self.cached_or_compute(values, n_tasks, true),
        }
    }

    /// Scale each task vector by the current weights.
    pub fn apply(&mut self, values: &[TaskVector], n_tasks: usize, refresh: bool) -> Vec<TaskVector> {
        let weights = self.weights(values, n_tasks, refresh);
        values
            .iter()
            .map(|v| v.iter().zip(&weights).map(|(x, w)| x * w).collect())
            .collect()
    }

    fn cached_or_compute(&mut self, values: &[TaskVector], n_tasks: usize, refresh: bool) -> Vec<f64> {
        if let Some(cached) = &self.cached {
            if !refresh {
                return cached.clone();
            }
        }
        if values.is_empty() {
            return vec![1.0; n_tasks];
        }
        let weights = inverse_column_mean(values, n_tasks);
        debug!(?weights, mode = ?self.mode, "Updated task weights");
        self.cached = Some(weights.clone());
        weights
    }
}

fn inverse_column_mean(values: &[TaskVector], n_tasks: usize) -> Vec<f64> {
    let n = values.len() as f64;
    (0..n_tasks)
        .map(|t| {
            let mean = values.iter().map(|v| v[t]).sum::<f64>() / n;
            if mean == 0.0 || !mean.is_finite() {
                warn!(task = t, mean, "Cannot normalize task by its mean, using weight 1");
                1.0
            } else {
                1.0 / mean
            }
        })
        .collect()
}

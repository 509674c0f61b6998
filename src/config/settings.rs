//! Typed scan settings loaded with Figment.
//!
//! Every section has documented defaults; only `scanning`, `tasks`,
//! `acquisition_function` and `gp` must be present in a configuration file.

use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ScanError, ScanResult};
use crate::scan::initial_points;

/// Top-level scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Instrument TCP endpoint
    #[serde(default)]
    pub tcp: TcpSettings,
    /// Console and file logging
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Campaign policy: budget, training schedule, deduplication, normalization
    pub scanning: ScanningSettings,
    /// Ordered reduction tasks; order defines the task vector layout
    pub tasks: Vec<TaskSettings>,
    /// Acquisition function used when asking the model
    pub acquisition_function: FunctionSettings,
    /// Optional movement cost function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_function: Option<FunctionSettings>,
    /// Surrogate model settings
    pub gp: GpSettings,
    /// In-process instrument simulator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulator: Option<SimulatorSettings>,
    /// Loop sleep intervals and startup backoffs
    #[serde(default)]
    pub timing: TimingSettings,
}

/// Instrument TCP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpSettings {
    /// Instrument host name or address
    #[serde(default = "default_host")]
    pub host: String,
    /// Instrument TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum reply size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Per-request timeout
    #[serde(default = "default_tcp_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            buffer_size: default_buffer_size(),
            timeout: default_tcp_timeout(),
        }
    }
}

/// Output format of the console log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line records
    #[default]
    Full,
    /// Single-line records
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Console record layout
    #[serde(default)]
    pub format: LogFormat,
    /// Colored console output
    #[serde(default = "default_true")]
    pub ansi: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            ansi: true,
        }
    }
}

/// How task vectors are scaled before they reach the surrogate model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizeMode {
    /// No scaling
    Never,
    /// Inverse of `fixed_normalization`
    Fixed,
    /// Inverse of the mean of the first batch, computed once
    Init,
    /// Cached inverse mean, refreshed on every training pass
    #[default]
    Training,
    /// Inverse of the running mean, recomputed on every call
    #[serde(alias = "dynamic")]
    Always,
}

/// Campaign policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanningSettings {
    /// Hard cap on model-loop iterations
    #[serde(default = "default_max_points")]
    pub max_points: u64,
    /// Wall-clock budget of the campaign
    #[serde(default = "default_duration", with = "humantime_serde")]
    pub duration: Duration,
    /// Explicit iterations at which the model is retrained
    #[serde(default = "default_train_at")]
    pub train_at: BTreeSet<u64>,
    /// Periodic retraining interval (0 disables)
    #[serde(default)]
    pub train_every: u64,
    /// Task-vector scaling applied before the model sees the data
    #[serde(default)]
    pub normalize_values: NormalizeMode,
    /// Constants for `NormalizeMode::Fixed`, one per task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_normalization: Option<Vec<f64>>,
    /// Aggregate repeated measurements on the same grid point
    #[serde(default = "default_true")]
    pub merge_unique_positions: bool,
    /// Error of a single measurement; shrinks with the square root of the repeat count
    #[serde(default = "default_base_error")]
    pub base_error: f64,
    /// Name of the initial point layout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_points: Option<String>,
}

/// One reduction task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Task label, unique within the campaign
    pub label: String,
    /// Registered reduction function name
    pub function: String,
    /// Parameters passed to the reduction constructor
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Name and parameters of a pluggable function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSettings {
    /// Registered function name
    pub function: String,
    /// Constructor parameters
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Surrogate model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpSettings {
    /// Model initialization
    pub fvgp: FvgpSettings,
    /// Hyperparameter training
    pub training: TrainingSettings,
    /// Next-position queries
    #[serde(default)]
    pub ask: AskSettings,
}

/// Model initialization: hyperparameter seed plus free-form model options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FvgpSettings {
    /// Initial hyperparameters: signal variance, one length scale per axis, noise
    pub init_hyperparameters: Vec<f64>,
    /// Any other keys, handed to the model as-is
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// Hyperparameter optimisation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// `[min, max]` per hyperparameter
    pub hyperparameter_bounds: Vec<[f64; 2]>,
    /// Candidate population per optimisation round
    #[serde(default = "default_train_pop_size")]
    pub pop_size: usize,
    /// Optimisation rounds
    #[serde(default = "default_train_max_iter")]
    pub max_iter: usize,
    /// Convergence threshold on the likelihood improvement
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

/// Search strategy for the next position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AskMethod {
    /// Search the whole bounded space
    #[default]
    Global,
    /// Search around the start position
    Local,
}

/// Next-position query settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskSettings {
    /// Number of positions requested per query
    #[serde(default = "default_ask_n")]
    pub n: usize,
    /// Search bounds; defaults to the instrument limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Vec<[f64; 2]>>,
    /// Global or local search
    #[serde(default)]
    pub method: AskMethod,
    /// Candidate population per search round
    #[serde(default = "default_ask_pop_size")]
    pub pop_size: usize,
    /// Search rounds
    #[serde(default = "default_ask_max_iter")]
    pub max_iter: usize,
    /// Convergence threshold
    #[serde(default = "default_tolerance")]
    pub tol: f64,
}

impl Default for AskSettings {
    fn default() -> Self {
        Self {
            n: default_ask_n(),
            bounds: None,
            method: AskMethod::default(),
            pop_size: default_ask_pop_size(),
            max_iter: default_ask_max_iter(),
            tol: default_tolerance(),
        }
    }
}

/// Simulated axis: `start..=stop` in `step` increments
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AxisRange {
    /// First coordinate
    pub start: f64,
    /// Last coordinate, included when reachable
    pub stop: f64,
    /// Coordinate spacing
    pub step: f64,
}

/// In-process instrument simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSettings {
    /// One coordinate range per axis
    pub axes: Vec<AxisRange>,
    /// Shape of each simulated measurement
    #[serde(default = "default_spectrum_shape")]
    pub spectrum_shape: Vec<usize>,
    /// Time spent measuring one point
    #[serde(default = "default_dwell_time", with = "humantime_serde")]
    pub dwell_time: Duration,
    /// Standard deviation of additive noise
    #[serde(default = "default_noise")]
    pub noise: f64,
    /// Positional jitter as a fraction of the axis step
    #[serde(default)]
    pub jitter: f64,
    /// Probability of answering `MEASURE` with `ERROR`
    #[serde(default)]
    pub error_rate: f64,
    /// Keep measuring the last point while no new point is queued
    #[serde(default = "default_true")]
    pub repeat_last: bool,
    /// Directory receiving the campaign artifacts
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Random seed; entropy when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Loop cadence and startup backoffs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Delay before the acquisition and model loops start working
    #[serde(default = "default_startup_delay", with = "humantime_serde")]
    pub startup_delay: Duration,
    /// Model-loop sleep while no data is ready
    #[serde(default = "default_idle_poll", with = "humantime_serde")]
    pub idle_poll: Duration,
    /// Sleep of every loop while paused
    #[serde(default = "default_pause_poll", with = "humantime_serde")]
    pub pause_poll: Duration,
    /// Interval between warm-up checks
    #[serde(default = "default_warmup_poll", with = "humantime_serde")]
    pub warmup_poll: Duration,
    /// Acquisition sleep after a `NO_DATA` or unknown reply
    #[serde(default = "default_idle_poll", with = "humantime_serde")]
    pub no_data_backoff: Duration,
    /// Acquisition sleep after an instrument error
    #[serde(default = "default_idle_poll", with = "humantime_serde")]
    pub error_backoff: Duration,
    /// Wait between END and the second START attempt
    #[serde(default = "default_start_retry_backoff", with = "humantime_serde")]
    pub start_retry_backoff: Duration,
    /// Interval between `STATUS` checks at startup
    #[serde(default = "default_pause_poll", with = "humantime_serde")]
    pub status_poll: Duration,
    /// `STATUS` checks before giving up on a busy instrument
    #[serde(default = "default_status_attempts")]
    pub status_attempts: u32,
    /// Countdown resolution of the lifecycle timer
    #[serde(default = "default_pause_poll", with = "humantime_serde")]
    pub timer_tick: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            startup_delay: default_startup_delay(),
            idle_poll: default_idle_poll(),
            pause_poll: default_pause_poll(),
            warmup_poll: default_warmup_poll(),
            no_data_backoff: default_idle_poll(),
            error_backoff: default_idle_poll(),
            start_retry_backoff: default_start_retry_backoff(),
            status_poll: default_pause_poll(),
            status_attempts: default_status_attempts(),
            timer_tick: default_pause_poll(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    54333
}

fn default_buffer_size() -> usize {
    8 * 1024 * 1024
}

fn default_tcp_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_points() -> u64 {
    999
}

fn default_duration() -> Duration {
    Duration::from_secs(7200)
}

fn default_train_at() -> BTreeSet<u64> {
    [10, 20, 50, 100, 200, 500, 1000, 2000, 5000, 10000]
        .into_iter()
        .collect()
}

fn default_base_error() -> f64 {
    0.01
}

fn default_train_pop_size() -> usize {
    20
}

fn default_train_max_iter() -> usize {
    2
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_ask_n() -> usize {
    1
}

fn default_ask_pop_size() -> usize {
    20
}

fn default_ask_max_iter() -> usize {
    10
}

fn default_spectrum_shape() -> Vec<usize> {
    vec![32, 32]
}

fn default_dwell_time() -> Duration {
    Duration::from_millis(100)
}

fn default_noise() -> f64 {
    0.01
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_startup_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_idle_poll() -> Duration {
    Duration::from_millis(200)
}

fn default_pause_poll() -> Duration {
    Duration::from_secs(1)
}

fn default_warmup_poll() -> Duration {
    Duration::from_millis(500)
}

fn default_start_retry_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_status_attempts() -> u32 {
    30
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from a TOML or YAML file plus `SMARTSCAN_` environment overrides.
    ///
    /// Files ending in `.yaml` or `.yml` are read as YAML, anything else as TOML.
    /// After loading, configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let path = path.as_ref();
        let figment = if is_yaml(path) {
            Figment::from(Yaml::file(path))
        } else {
            Figment::from(Toml::file(path))
        };
        Self::extract(figment.merge(Env::prefixed("SMARTSCAN_").split("__")))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> ScanResult<Self> {
        Self::extract(Figment::from(Toml::string(content)))
    }

    fn extract(figment: Figment) -> ScanResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Task labels in task-vector order.
    pub fn task_labels(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.label.clone()).collect()
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - At least one task, labels unique
    /// - Fixed normalization has one non-zero constant per task
    /// - Base error is positive
    /// - Initial point layout exists
    /// - Hyperparameter seed and bounds agree in length, bounds are ordered
    /// - Ask settings request at least one point
    pub fn validate(&self) -> ScanResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ScanError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.tasks.is_empty() {
            return Err(ScanError::Configuration(
                "At least one reduction task must be configured".to_string(),
            ));
        }
        let mut labels = HashSet::new();
        for task in &self.tasks {
            if !labels.insert(task.label.as_str()) {
                return Err(ScanError::Configuration(format!(
                    "Duplicate task label: '{}'",
                    task.label
                )));
            }
        }

        let scanning = &self.scanning;
        if scanning.normalize_values == NormalizeMode::Fixed {
            let constants = scanning.fixed_normalization.as_ref().ok_or_else(|| {
                ScanError::Configuration(
                    "normalize_values = \"fixed\" requires fixed_normalization".to_string(),
                )
            })?;
            if constants.len() != self.tasks.len() {
                return Err(ScanError::DimensionMismatch {
                    what: "fixed_normalization",
                    expected: self.tasks.len(),
                    found: constants.len(),
                });
            }
            if constants.iter().any(|c| *c == 0.0 || !c.is_finite()) {
                return Err(ScanError::Configuration(
                    "fixed_normalization constants must be finite and non-zero".to_string(),
                ));
            }
        }
        if !(scanning.base_error.is_finite() && scanning.base_error > 0.0) {
            return Err(ScanError::Configuration(format!(
                "base_error must be positive, got {}",
                scanning.base_error
            )));
        }
        if let Some(name) = &scanning.initial_points {
            if !initial_points::is_known(name) {
                return Err(ScanError::Configuration(format!(
                    "Unknown initial point layout '{}'. Must be one of: {}",
                    name,
                    initial_points::NAMES.join(", ")
                )));
            }
        }

        let training = &self.gp.training;
        if training.hyperparameter_bounds.len() != self.gp.fvgp.init_hyperparameters.len() {
            return Err(ScanError::DimensionMismatch {
                what: "hyperparameter_bounds",
                expected: self.gp.fvgp.init_hyperparameters.len(),
                found: training.hyperparameter_bounds.len(),
            });
        }
        if let Some([lo, hi]) = training
            .hyperparameter_bounds
            .iter()
            .find(|[lo, hi]| !(lo.is_finite() && hi.is_finite() && lo <= hi))
        {
            return Err(ScanError::Configuration(format!(
                "Invalid hyperparameter bound [{lo}, {hi}]"
            )));
        }
        if self.gp.ask.n == 0 || self.gp.ask.pop_size == 0 {
            return Err(ScanError::Configuration(
                "gp.ask.n and gp.ask.pop_size must be at least 1".to_string(),
            ));
        }

        if let Some(sim) = &self.simulator {
            if sim.axes.is_empty() || sim.spectrum_shape.is_empty() {
                return Err(ScanError::Configuration(
                    "simulator needs at least one axis and a non-empty spectrum_shape".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL: &str = r#"
        [scanning]
        initial_points = "center_2D"

        [[tasks]]
        label = "mean"
        function = "mean"

        [[tasks]]
        label = "max"
        function = "max"

        [acquisition_function]
        function = "acquisition_function_nd"
        params = { a = 1.0 }

        [gp.fvgp]
        init_hyperparameters = [1.0, 10.0, 10.0, 0.5]

        [gp.training]
        hyperparameter_bounds = [[0.1, 10.0], [1.0, 100.0], [1.0, 100.0], [0.01, 5.0]]
    "#;

    #[test]
    fn test_defaults_applied() {
        let settings = Settings::from_toml_str(MINIMAL).unwrap();
        assert_eq!(settings.tcp.port, 54333);
        assert_eq!(settings.scanning.max_points, 999);
        assert_eq!(settings.scanning.duration, Duration::from_secs(7200));
        assert!(settings.scanning.train_at.contains(&10));
        assert_eq!(settings.scanning.normalize_values, NormalizeMode::Training);
        assert!(settings.scanning.merge_unique_positions);
        assert_eq!(settings.gp.ask.n, 1);
        assert_eq!(settings.timing.start_retry_backoff, Duration::from_secs(10));
        assert_eq!(settings.task_labels(), vec!["mean", "max"]);
    }

    #[test]
    fn test_dynamic_is_alias_for_always() {
        let content = MINIMAL.replace(
            "[scanning]",
            "[scanning]\nnormalize_values = \"dynamic\"\nduration = \"30m\"",
        );
        let settings = Settings::from_toml_str(&content).unwrap();
        assert_eq!(settings.scanning.normalize_values, NormalizeMode::Always);
        assert_eq!(settings.scanning.duration, Duration::from_secs(1800));
    }

    #[test]
    fn test_fixed_normalization_length_checked() {
        let content = MINIMAL.replace(
            "[scanning]",
            "[scanning]\nnormalize_values = \"fixed\"\nfixed_normalization = [1.0]",
        );
        assert!(matches!(
            Settings::from_toml_str(&content),
            Err(ScanError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_initial_points_rejected() {
        let content = MINIMAL.replace("center_2D", "spiral_2D");
        assert!(matches!(
            Settings::from_toml_str(&content),
            Err(ScanError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_task_labels_rejected() {
        let content = MINIMAL.replace("label = \"max\"", "label = \"mean\"");
        assert!(Settings::from_toml_str(&content).is_err());
    }

    #[test]
    fn test_bounds_length_checked() {
        let content = MINIMAL.replace("[0.1, 10.0], ", "");
        assert!(matches!(
            Settings::from_toml_str(&content),
            Err(ScanError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_free_form_model_options_kept() {
        let content = MINIMAL.replace(
            "init_hyperparameters",
            "compute_device = \"cpu\"\nseed = 7\ninit_hyperparameters",
        );
        let settings = Settings::from_toml_str(&content).unwrap();
        assert_eq!(settings.gp.fvgp.options["compute_device"], "cpu");
        assert_eq!(settings.gp.fvgp.options["seed"], 7);
    }
}

//! Scan Configuration System
//!
//! This module provides configuration management for scan campaigns using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `SMARTSCAN_`
//! 2. TOML or YAML configuration file (default: `config/smartscan.toml`)
//!
//! # Example
//!
//! ```no_run
//! use smartscan::config::Settings;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load_from("config/smartscan.toml")?;
//!     println!("Max points: {}", settings.scanning.max_points);
//!     println!("Tasks: {}", settings.tasks.len());
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! Any configuration value can be overridden via environment variables with the
//! `SMARTSCAN_` prefix and key path separated by double underscores:
//!
//! ```text
//! # Shorter campaign
//! SMARTSCAN_SCANNING__DURATION="30m"
//!
//! # Different instrument host
//! SMARTSCAN_TCP__HOST=192.168.1.20
//! ```

pub mod settings;

pub use settings::{
    AskMethod, AskSettings, AxisRange, FunctionSettings, FvgpSettings, GpSettings, LogFormat,
    LoggingSettings, NormalizeMode, ScanningSettings, Settings, SimulatorSettings, TaskSettings,
    TcpSettings, TimingSettings, TrainingSettings,
};

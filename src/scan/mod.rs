//! The scan campaign: orchestrator, concurrent loops and their shared state.
//!
//! | Module | Role |
//! |---|---|
//! | [`orchestrator`] | startup, loop supervision, finalization |
//! | [`acquisition`] | poll `MEASURE`, feed the position store |
//! | [`model_loop`] | train the surrogate model, ask for new positions |
//! | [`timer`] | enforce the time budget |
//! | [`visualization`] | snapshots for display consumers |
//! | [`control`] | stop, pause and hand-off flags shared by every loop |

pub mod acquisition;
pub mod console;
pub mod control;
pub mod initial_points;
pub mod model_loop;
pub mod orchestrator;
pub mod persistence;
pub mod timer;
pub mod visualization;

pub use control::ScanControl;
pub use orchestrator::{ScanHandle, ScanSummary, SmartScan};
pub use persistence::{ArtifactPaths, HyperparameterHistory};
pub use visualization::{ScanSnapshot, SnapshotWriter, Visualizer};

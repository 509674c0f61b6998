//! Instrument transport.
//!
//! The orchestrator talks to the instrument through a small command set:
//!
//! | Command | Reply |
//! |---|---|
//! | `START` / `END` | acknowledgement, `ERROR <msg>` on rejection |
//! | `STATUS` | a status word, `READY` when measurements can be taken |
//! | `ADD_POINT <x1> .. <xn>` | acknowledgement |
//! | `MEASURE` | `ERROR <msg>`, `NO_DATA <msg>` or `MEASURE <n_pos> <pos..> <data..>` |
//!
//! Connection details (grid axes, file name, measurement shape) are gathered by
//! [`Transport::connect`]. Two implementations ship with the crate:
//! [`TcpTransport`] for a real instrument server and [`SimulatedTransport`]
//! for dry runs.

pub mod protocol;
pub mod simulator;
pub mod tcp;

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::ScanResult;
use crate::grid::InstrumentGrid;

pub use protocol::{parse_measure_reply, MeasureReply};
pub use simulator::SimulatedTransport;
pub use tcp::TcpTransport;

/// Instrument geometry and output location, known after connecting.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentInfo {
    /// Reachable coordinates per axis
    pub grid: InstrumentGrid,
    /// Base file name for the campaign artifacts
    pub filename: PathBuf,
    /// Shape of every raw measurement
    pub measurement_shape: Vec<usize>,
}

impl InstrumentInfo {
    /// `[min, max]` per axis.
    pub fn limits(&self) -> Vec<[f64; 2]> {
        self.grid.limits()
    }

    /// Spacing per axis.
    pub fn step_size(&self) -> Vec<f64> {
        self.grid.step_size()
    }
}

/// Command interface to a scanning instrument.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin a scan on the instrument.
    async fn start(&self) -> ScanResult<()>;

    /// Finish the scan.
    async fn end(&self) -> ScanResult<()>;

    /// Current instrument status word.
    async fn status(&self) -> ScanResult<String>;

    /// Query grid axes, output file name and measurement shape.
    async fn connect(&self) -> ScanResult<InstrumentInfo>;

    /// Queue a position for measurement.
    async fn add_point(&self, position: &[f64]) -> ScanResult<()>;

    /// Fetch the next measurement reply, unparsed.
    async fn measure(&self) -> ScanResult<String>;
}

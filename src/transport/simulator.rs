//! In-process instrument simulator.
//!
//! Behaves like an instrument server: commanded points are queued, each takes
//! `dwell_time` to measure, and `MEASURE` answers `NO_DATA` until the current
//! point is done. With `repeat_last`, an idle simulator keeps integrating at
//! the last measured point, like a real instrument parked on a position.
//! Measurements are synthetic spectra whose peak height and
//! position depend on where the point lies in the scan range, plus Gaussian
//! noise. Errors can be injected at a configurable rate.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SimulatorSettings;
use crate::core::{Position, RawMeasurement};
use crate::error::{ScanError, ScanResult};
use crate::grid::InstrumentGrid;
use crate::transport::protocol::format_measure_reply;
use crate::transport::{InstrumentInfo, Transport};

/// Center of the simulated signal, in unit coordinates.
const SIGNAL_CENTER: f64 = 0.6;
const SIGNAL_WIDTH: f64 = 0.2;
const PEAK_WIDTH: f64 = 0.08;
const BACKGROUND: f64 = 0.1;

struct SimState {
    running: bool,
    queue: VecDeque<Position>,
    current: Option<(Position, Instant)>,
    last: Option<Position>,
    rng: StdRng,
}

/// In-process instrument speaking the same command set as the TCP server.
pub struct SimulatedTransport {
    settings: SimulatorSettings,
    grid: InstrumentGrid,
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    /// Simulator over the configured axes. Fails on an invalid axis range.
    pub fn new(settings: SimulatorSettings) -> ScanResult<Self> {
        let axes = settings
            .axes
            .iter()
            .map(|a| InstrumentGrid::axis_from_range(a.start, a.stop, a.step))
            .collect::<ScanResult<Vec<_>>>()?;
        let grid = InstrumentGrid::new(axes)?;
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            settings,
            grid,
            state: Mutex::new(SimState {
                running: false,
                queue: VecDeque::new(),
                current: None,
                last: None,
                rng,
            }),
        })
    }

    /// Number of points waiting to be measured, including the one in progress.
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.queue.len() + usize::from(state.current.is_some())
    }

    fn unit_coordinates(&self, position: &[f64]) -> Vec<f64> {
        position
            .iter()
            .zip(self.grid.limits())
            .map(|(x, [lo, hi])| if hi > lo { (x - lo) / (hi - lo) } else { 0.5 })
            .collect()
    }

    fn synthesize(&self, position: &[f64], rng: &mut StdRng) -> ScanResult<RawMeasurement> {
        let unit = self.unit_coordinates(position);
        let distance_sq: f64 = unit.iter().map(|u| (u - SIGNAL_CENTER).powi(2)).sum();
        let amplitude = (-distance_sq / (2.0 * SIGNAL_WIDTH * SIGNAL_WIDTH)).exp();
        let peak_at = unit.first().copied().unwrap_or(0.5);

        let shape = &self.settings.spectrum_shape;
        let len: usize = shape.iter().product();
        let last = shape.last().copied().unwrap_or(1).max(1);
        let data = (0..len)
            .map(|i| {
                let t = if last > 1 {
                    (i % last) as f64 / (last - 1) as f64
                } else {
                    0.5
                };
                let peak = amplitude * (-(t - peak_at).powi(2) / (2.0 * PEAK_WIDTH * PEAK_WIDTH)).exp();
                BACKGROUND + peak + self.settings.noise * standard_normal(rng)
            })
            .collect();
        RawMeasurement::from_flat(shape, data)
    }
}

/// Box-Muller transform.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn start(&self) -> ScanResult<()> {
        let mut state = self.state.lock();
        if state.running {
            return Err(ScanError::TransportRejected("START: scan already running".to_string()));
        }
        state.running = true;
        info!(axes = self.grid.n_dim(), "Simulated instrument started");
        Ok(())
    }

    async fn end(&self) -> ScanResult<()> {
        let mut state = self.state.lock();
        state.running = false;
        state.queue.clear();
        state.current = None;
        state.last = None;
        info!("Simulated instrument stopped");
        Ok(())
    }

    async fn status(&self) -> ScanResult<String> {
        Ok("READY".to_string())
    }

    async fn connect(&self) -> ScanResult<InstrumentInfo> {
        tokio::fs::create_dir_all(&self.settings.output_dir).await?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        Ok(InstrumentInfo {
            grid: self.grid.clone(),
            filename: self.settings.output_dir.join(format!("simulated_scan_{stamp}")),
            measurement_shape: self.settings.spectrum_shape.clone(),
        })
    }

    async fn add_point(&self, position: &[f64]) -> ScanResult<()> {
        if position.len() != self.grid.n_dim() {
            return Err(ScanError::TransportRejected(format!(
                "ADD_POINT: expected {} coordinates, got {}",
                self.grid.n_dim(),
                position.len()
            )));
        }
        self.state.lock().queue.push_back(position.to_vec());
        debug!(?position, "Simulated instrument queued point");
        Ok(())
    }

    async fn measure(&self) -> ScanResult<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.current.is_none() {
            let next = match state.queue.pop_front() {
                Some(point) => Some(point),
                None if self.settings.repeat_last => state.last.clone(),
                None => None,
            };
            match next {
                Some(point) => state.current = Some((point, Instant::now())),
                None => return Ok("NO_DATA queue empty".to_string()),
            }
        }
        let Some((point, started)) = state.current.clone() else {
            return Ok("NO_DATA queue empty".to_string());
        };
        if started.elapsed() < self.settings.dwell_time {
            return Ok("NO_DATA measuring".to_string());
        }
        if self.settings.error_rate > 0.0 && state.rng.gen_bool(self.settings.error_rate.min(1.0)) {
            // the point stays current and is retried on the next MEASURE
            state.current = Some((point, Instant::now()));
            return Ok("ERROR simulated acquisition failure".to_string());
        }
        state.current = None;
        state.last = Some(point.clone());

        let steps = self.grid.step_size();
        let reported: Position = point
            .iter()
            .zip(&steps)
            .map(|(x, step)| {
                if self.settings.jitter > 0.0 {
                    let j = self.settings.jitter * step;
                    x + state.rng.gen_range(-j..=j)
                } else {
                    *x
                }
            })
            .collect();
        let raw = self.synthesize(&point, &mut state.rng)?;
        Ok(format_measure_reply(&reported, &raw))
    }
}

impl std::fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedTransport")
            .field("axes", &self.grid.n_dim())
            .field("spectrum_shape", &self.settings.spectrum_shape)
            .field("dwell_time", &self.settings.dwell_time)
            .finish()
    }
}

/// Simulator settings for tests and dry runs: a 2D grid and short dwell time.
pub fn quick_settings(output_dir: impl Into<std::path::PathBuf>) -> SimulatorSettings {
    use crate::config::AxisRange;
    SimulatorSettings {
        axes: vec![
            AxisRange { start: 0.0, stop: 10.0, step: 1.0 },
            AxisRange { start: 0.0, stop: 10.0, step: 1.0 },
        ],
        spectrum_shape: vec![16],
        dwell_time: Duration::from_millis(10),
        noise: 0.0,
        jitter: 0.0,
        error_rate: 0.0,
        repeat_last: true,
        output_dir: output_dir.into(),
        seed: Some(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{parse_measure_reply, MeasureReply};

    #[tokio::test(start_paused = true)]
    async fn test_measures_queued_points_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedTransport::new(quick_settings(dir.path())).unwrap();
        sim.start().await.unwrap();
        let info = sim.connect().await.unwrap();
        assert_eq!(info.grid.n_dim(), 2);
        assert!(info.filename.starts_with(dir.path()));

        assert!(sim.measure().await.unwrap().starts_with("NO_DATA"));
        sim.add_point(&[2.0, 3.0]).await.unwrap();
        sim.add_point(&[4.0, 5.0]).await.unwrap();
        assert!(sim.measure().await.unwrap().starts_with("NO_DATA"));

        tokio::time::advance(Duration::from_millis(20)).await;
        let reply = sim.measure().await.unwrap();
        match parse_measure_reply(&reply, 2, &[16]).unwrap() {
            MeasureReply::Measure { position, raw } => {
                assert_eq!(position, vec![2.0, 3.0]);
                assert_eq!(raw.len(), 16);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sim.pending(), 1);
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedTransport::new(quick_settings(dir.path())).unwrap();
        sim.start().await.unwrap();
        assert!(matches!(sim.start().await, Err(ScanError::TransportRejected(_))));
        sim.end().await.unwrap();
        assert!(sim.start().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_injection() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = quick_settings(dir.path());
        settings.error_rate = 1.0;
        let sim = SimulatedTransport::new(settings).unwrap();
        sim.add_point(&[1.0, 1.0]).await.unwrap();
        assert!(sim.measure().await.unwrap().starts_with("NO_DATA"));
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(sim.measure().await.unwrap().starts_with("ERROR"));
        assert_eq!(sim.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_simulator_repeats_last_point() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedTransport::new(quick_settings(dir.path())).unwrap();
        sim.add_point(&[7.0, 1.0]).await.unwrap();
        assert!(sim.measure().await.unwrap().starts_with("NO_DATA"));
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(sim.measure().await.unwrap().starts_with("MEASURE"));
        assert_eq!(sim.measure().await.unwrap(), "NO_DATA measuring");
        tokio::time::advance(Duration::from_millis(20)).await;
        let reply = sim.measure().await.unwrap();
        match parse_measure_reply(&reply, 2, &[16]).unwrap() {
            MeasureReply::Measure { position, .. } => assert_eq!(position, vec![7.0, 1.0]),
            other => panic!("unexpected {other:?}"),
        }

        let mut settings = quick_settings(dir.path());
        settings.repeat_last = false;
        let sim = SimulatedTransport::new(settings).unwrap();
        sim.add_point(&[7.0, 1.0]).await.unwrap();
        sim.measure().await.unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(sim.measure().await.unwrap().starts_with("MEASURE"));
        assert_eq!(sim.measure().await.unwrap(), "NO_DATA queue empty");
    }

    #[test]
    fn test_signal_peaks_near_center() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedTransport::new(quick_settings(dir.path())).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let near = sim.synthesize(&[6.0, 6.0], &mut rng).unwrap();
        let far = sim.synthesize(&[0.0, 10.0], &mut rng).unwrap();
        let max = |m: &RawMeasurement| m.data().iter().copied().fold(f64::MIN, f64::max);
        assert!(max(&near) > max(&far));
    }
}

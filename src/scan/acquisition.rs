//! Acquisition loop: poll the instrument for measurements and record them.

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::TimingSettings;
use crate::error::ScanResult;
use crate::scan::control::ScanControl;
use crate::store::{PositionStore, RecordOutcome};
use crate::transport::{parse_measure_reply, InstrumentInfo, MeasureReply, Transport};

/// Run until stop is requested.
///
/// Instrument errors, empty replies, unknown codes and malformed payloads are
/// logged and skipped. Only a failure to record a well-formed measurement that
/// points at a configuration problem (such as a reduction producing the wrong
/// number of tasks) ends the loop with an error.
pub async fn acquisition_loop(
    transport: &dyn Transport,
    store: &RwLock<PositionStore>,
    control: &ScanControl,
    info: &InstrumentInfo,
    timing: &TimingSettings,
) -> ScanResult<()> {
    info!("Starting acquisition loop");
    if control.sleep(timing.startup_delay).await {
        return Ok(());
    }
    let n_dim = info.grid.n_dim();

    while !control.is_stopped() {
        if control.is_paused() {
            control.sleep(timing.pause_poll).await;
            continue;
        }

        let reply = match transport.measure().await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "MEASURE request failed");
                control.sleep(timing.error_backoff).await;
                continue;
            }
        };

        match parse_measure_reply(&reply, n_dim, &info.measurement_shape) {
            Ok(MeasureReply::Error(message)) => {
                error!(%message, "Instrument reported an error");
                control.sleep(timing.error_backoff).await;
            }
            Ok(MeasureReply::NoData(message)) => {
                debug!(%message, "No data available");
                control.sleep(timing.no_data_backoff).await;
            }
            Ok(MeasureReply::Unknown(code)) => {
                warn!(%code, "Unknown reply to MEASURE");
                control.sleep(timing.no_data_backoff).await;
            }
            Ok(MeasureReply::Measure { position, raw }) => {
                let outcome = store.write().record(position, raw);
                match outcome {
                    Ok(RecordOutcome::New { position, tasks }) => {
                        info!(?position, ?tasks, "New position measured");
                        control.mark_data_ready();
                    }
                    Ok(RecordOutcome::Merged {
                        position,
                        tasks,
                        count,
                    }) => {
                        info!(?position, ?tasks, count, "Repeated position measured");
                        control.mark_data_ready();
                    }
                    Err(e) if e.is_transient() => {
                        error!(severity = "critical", error = %e, "Could not reduce measurement, skipping");
                    }
                    Err(e) => return Err(e),
                }
                tokio::task::yield_now().await;
            }
            Err(e) => {
                error!(
                    severity = "critical",
                    error = %e,
                    reply_len = reply.len(),
                    "Malformed MEASURE reply, skipping"
                );
            }
        }
    }
    debug!("Acquisition loop finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RawMeasurement;
    use crate::error::ScanError;
    use crate::grid::InstrumentGrid;
    use crate::tasks::{ReductionTask, RoiStatistic, Statistic, TaskReducer};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    /// Replays canned MEASURE replies, then requests stop.
    struct Replay {
        replies: Mutex<VecDeque<ScanResult<String>>>,
        control: Arc<ScanControl>,
    }

    #[async_trait]
    impl Transport for Replay {
        async fn start(&self) -> ScanResult<()> {
            Ok(())
        }
        async fn end(&self) -> ScanResult<()> {
            Ok(())
        }
        async fn status(&self) -> ScanResult<String> {
            Ok("READY".into())
        }
        async fn connect(&self) -> ScanResult<InstrumentInfo> {
            Ok(info())
        }
        async fn add_point(&self, _position: &[f64]) -> ScanResult<()> {
            Ok(())
        }
        async fn measure(&self) -> ScanResult<String> {
            let next = self.replies.lock().pop_front();
            match next {
                Some(reply) => reply,
                None => {
                    self.control.request_stop();
                    Ok("NO_DATA done".into())
                }
            }
        }
    }

    fn info() -> InstrumentInfo {
        InstrumentInfo {
            grid: InstrumentGrid::new(vec![vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0]]).unwrap(),
            filename: PathBuf::from("scan.h5"),
            measurement_shape: vec![2],
        }
    }

    fn store(labels: &[&str]) -> RwLock<PositionStore> {
        let tasks: Vec<Arc<dyn ReductionTask>> = vec![Arc::new(RoiStatistic::new(Statistic::Mean, None))];
        let reducer = TaskReducer::new(labels.iter().map(|l| l.to_string()).collect(), tasks);
        let mut store = PositionStore::new(reducer, true, 0.01);
        store.set_grid(info().grid);
        RwLock::new(store)
    }

    fn timing() -> TimingSettings {
        TimingSettings {
            startup_delay: Duration::ZERO,
            ..TimingSettings::default()
        }
    }

    async fn replay(replies: Vec<ScanResult<String>>, store: &RwLock<PositionStore>) -> (ScanResult<()>, Arc<ScanControl>) {
        let control = Arc::new(ScanControl::new());
        let transport = Replay {
            replies: Mutex::new(replies.into()),
            control: control.clone(),
        };
        let result = acquisition_loop(&transport, store, &control, &info(), &timing()).await;
        (result, control)
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_errors_and_no_data_leave_store_untouched() {
        let store = store(&["mean"]);
        let (result, control) = replay(
            vec![
                Ok("ERROR stage fault".into()),
                Ok("NO_DATA busy".into()),
                Err(ScanError::Transport("connection reset".into())),
                Ok("WHAT 1 2".into()),
                Ok("MEASURE 2 1.0".into()),
            ],
            &store,
        )
        .await;
        assert!(result.is_ok());
        assert!(store.read().is_empty());
        assert!(!control.take_data_ready());
        assert!(logs_contain("Malformed MEASURE reply"));
        assert!(logs_contain("Unknown reply to MEASURE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_measurement_recorded_and_flagged() {
        let store = store(&["mean"]);
        let (result, control) = replay(
            vec![
                Ok("MEASURE 2 1.1 0.9 2 4".into()),
                Ok("NO_DATA".into()),
                Ok("MEASURE 2 0.9 1.2 4 6".into()),
            ],
            &store,
        )
        .await;
        assert!(result.is_ok());
        assert!(control.take_data_ready());
        let store = store.read();
        assert_eq!(store.n_positions(), 1);
        assert_eq!(store.n_spectra(), 2);
        assert_eq!(store.task_values(), vec![vec![4.0]]);
        assert_eq!(
            store.last_spectrum(),
            Some(&RawMeasurement::from_flat(&[2], vec![4.0, 6.0]).unwrap())
        );
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_non_finite_positions_are_skipped() {
        let store = store(&["mean"]);
        let (result, control) = replay(
            vec![
                Ok("MEASURE 2 nan nan 1 2".into()),
                Ok("MEASURE 2 inf inf 3 4".into()),
                Ok("MEASURE 2 1 1 nan 4".into()),
            ],
            &store,
        )
        .await;
        assert!(result.is_ok());
        assert!(store.read().is_empty());
        assert_eq!(store.read().n_spectra(), 0);
        assert!(!control.take_data_ready());
        assert!(logs_contain("Malformed MEASURE reply"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_count_mismatch_is_fatal() {
        let store = store(&["mean", "max"]);
        let (result, _) = replay(vec![Ok("MEASURE 2 1 1 2 4".into())], &store).await;
        assert!(matches!(result, Err(ScanError::DimensionMismatch { .. })));
    }
}

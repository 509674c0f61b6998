//! Cross-loop control flags.
//!
//! One `ScanControl` is shared by every loop of a campaign. Stop and pause are
//! watch channels so loops can await them; data-ready and replot are one-shot
//! flags consumed with an atomic test-and-clear.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Shared campaign flags and counters.
#[derive(Debug)]
pub struct ScanControl {
    stop_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
    data_ready: AtomicBool,
    replot: AtomicBool,
    iteration: AtomicU64,
    remaining_secs: AtomicU64,
}

impl Default for ScanControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanControl {
    /// Flags cleared, counters at zero.
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (pause_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            pause_tx,
            data_ready: AtomicBool::new(false),
            replot: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            remaining_secs: AtomicU64::new(0),
        }
    }

    /// Request a cooperative stop. Once set, stop is never cleared.
    pub fn request_stop(&self) {
        self.stop_tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
    }

    /// Whether stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Hold every loop until [`ScanControl::resume`]. Idempotent.
    pub fn pause(&self) {
        if !self.is_paused() {
            info!("Scan paused");
        }
        self.pause_tx.send_replace(true);
    }

    /// Release a pause. Idempotent.
    pub fn resume(&self) {
        if self.is_paused() {
            info!("Scan resumed");
        }
        self.pause_tx.send_replace(false);
    }

    /// Whether the campaign is paused.
    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Signal the model loop that new data was recorded.
    pub fn mark_data_ready(&self) {
        self.data_ready.store(true, Ordering::Release);
    }

    /// Atomically read and clear the data-ready flag.
    ///
    /// A record arriving after the clear sets the flag again and is picked up
    /// on the next tick.
    pub fn take_data_ready(&self) -> bool {
        self.data_ready.swap(false, Ordering::AcqRel)
    }

    /// Ask the visualizer to redraw.
    pub fn mark_replot(&self) {
        self.replot.store(true, Ordering::Release);
    }

    /// Atomically read and clear the replot flag.
    pub fn take_replot(&self) -> bool {
        self.replot.swap(false, Ordering::AcqRel)
    }

    /// Number of model iterations run so far.
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Acquire)
    }

    /// Increment the model-loop iteration counter and return the new value.
    pub fn next_iteration(&self) -> u64 {
        self.iteration.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Time budget left, as last published by the timer.
    pub fn remaining(&self) -> Duration {
        Duration::from_secs(self.remaining_secs.load(Ordering::Acquire))
    }

    pub(crate) fn set_remaining(&self, remaining: Duration) {
        self.remaining_secs.store(remaining.as_secs(), Ordering::Release);
    }

    /// Resolves once stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration`, returning early if stop is requested.
    ///
    /// Returns `true` when the sleep was cut short by a stop.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_stopped(),
            _ = self.stopped() => true,
        }
    }
}

//! Lifecycle timer: enforce the campaign's time budget.
//!
//! The countdown only runs while the scan is not paused. The wall-clock check
//! uses active time (elapsed minus time spent paused), so a pause extends the
//! deadline by its own length.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ScanResult;
use crate::scan::control::ScanControl;

fn log_projected_end(remaining: Duration) {
    let end = chrono::Duration::from_std(remaining)
        .ok()
        .and_then(|d| chrono::Local::now().checked_add_signed(d));
    match end {
        Some(end) => info!(
            remaining = ?remaining,
            end = %end.format("%Y-%m-%d %H:%M:%S"),
            "Scan will end at"
        ),
        None => info!(remaining = ?remaining, "Scan end time out of range"),
    }
}

/// Count `budget` down in `tick` steps and request a stop when it runs out.
pub async fn timer_loop(control: &ScanControl, budget: Duration, tick: Duration) -> ScanResult<()> {
    let started = Instant::now();
    let mut remaining = budget;
    let mut paused_for = Duration::ZERO;
    let mut was_paused = false;
    control.set_remaining(remaining);
    log_projected_end(remaining);

    loop {
        if control.sleep(tick).await {
            debug!("Timer loop stopped");
            return Ok(());
        }
        if control.is_paused() {
            paused_for += tick;
            was_paused = true;
            continue;
        }
        if was_paused {
            was_paused = false;
            log_projected_end(remaining);
        }

        remaining = remaining.saturating_sub(tick);
        control.set_remaining(remaining);
        let active = started.elapsed().saturating_sub(paused_for);
        if remaining.is_zero() || active >= budget {
            warn!(budget = ?budget, "Time budget exhausted, stopping scan");
            control.request_stop();
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_budget_stops_scan() {
        let control = ScanControl::new();
        let begin = Instant::now();
        timer_loop(&control, Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(control.is_stopped());
        assert_eq!(control.remaining(), Duration::ZERO);
        assert_eq!(begin.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_extends_deadline() {
        let control = Arc::new(ScanControl::new());
        let timer = {
            let control = control.clone();
            tokio::spawn(async move {
                timer_loop(&control, Duration::from_secs(5), Duration::from_secs(1)).await
            })
        };
        let begin = Instant::now();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        control.pause();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!control.is_stopped());
        assert_eq!(control.remaining(), Duration::from_secs(3));
        control.resume();

        timer.await.unwrap().unwrap();
        assert!(control.is_stopped());
        assert!(begin.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_stop_ends_timer() {
        let control = Arc::new(ScanControl::new());
        let timer = {
            let control = control.clone();
            tokio::spawn(async move {
                timer_loop(&control, Duration::from_secs(3600), Duration::from_secs(1)).await
            })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        control.request_stop();
        timer.await.unwrap().unwrap();
        assert!(control.remaining() > Duration::from_secs(3500));
    }
}

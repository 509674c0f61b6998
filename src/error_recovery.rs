//! Startup recovery for the instrument handshake.
//
// A rejected START usually means the server still runs a previous scan. The
// recovery is to END it, give the server time to settle, and START once more.
// STATUS is polled until the instrument answers, then must report READY.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{ScanError, ScanResult};
use crate::transport::Transport;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_delay: Duration::from_secs(10),
        }
    }
}

/// Send START, recovering from a rejection with END + backoff + START.
///
/// Only rejections are retried; any other failure is returned immediately as
/// a connect error.
pub async fn start_with_retry(transport: &dyn Transport, policy: &RetryPolicy) -> ScanResult<()> {
    let mut last_rejection = String::new();
    for attempt in 1..=policy.max_attempts.max(1) {
        match transport.start().await {
            Ok(()) => {
                info!(attempt, "Instrument started");
                return Ok(());
            }
            Err(ScanError::TransportRejected(msg)) => {
                warn!(attempt, reason = %msg, "START rejected, ending previous scan");
                last_rejection = msg;
                if attempt == policy.max_attempts {
                    break;
                }
                if let Err(e) = transport.end().await {
                    warn!(error = %e, "END during START recovery failed");
                }
                sleep(policy.backoff_delay).await;
            }
            Err(ScanError::TransportConnect(msg)) => return Err(ScanError::TransportConnect(msg)),
            Err(e) => return Err(ScanError::TransportConnect(e.to_string())),
        }
    }
    Err(ScanError::TransportConnect(format!(
        "START rejected after {} attempts: {last_rejection}",
        policy.max_attempts
    )))
}

/// Poll STATUS until the instrument answers, then require `READY`.
///
/// Transport failures count as "no answer yet" and are retried up to
/// `policy.max_attempts` times.
pub async fn wait_until_ready(transport: &dyn Transport, policy: &RetryPolicy) -> ScanResult<()> {
    for attempt in 1..=policy.max_attempts.max(1) {
        match transport.status().await {
            Ok(status) => {
                let status = status.trim();
                if status.eq_ignore_ascii_case("READY") {
                    info!("Instrument ready");
                    return Ok(());
                }
                return Err(ScanError::TransportStatus(status.to_string()));
            }
            Err(e) => {
                debug!(attempt, error = %e, "STATUS not answered yet");
                sleep(policy.backoff_delay).await;
            }
        }
    }
    Err(ScanError::TransportStatus(format!(
        "no answer after {} attempts",
        policy.max_attempts
    )))
}

//! Timing constants and async timeout helpers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Liveness countdown for a session with no inbound traffic
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between client pings while connected
pub const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Age after which an unconfirmed event is retransmitted
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_millis(500);

/// Bounded wait for socket reads and queue pops, so loops recheck their flag
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on waiting for a loop to exit after `stop()`
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `future` with a deadline, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Wait for a loop task to finish after its running flag was cleared, aborting
/// it if it takes longer than [`SHUTDOWN_TIMEOUT`].
pub(crate) async fn join_task<T>(mut handle: JoinHandle<T>, name: &'static str) -> Option<T> {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(task = name, error = %e, "Task ended abnormally");
            None
        }
        Err(_) => {
            warn!(task = name, "Task did not stop in time, aborting");
            handle.abort();
            None
        }
    }
}

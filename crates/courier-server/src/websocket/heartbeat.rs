//! Heartbeat liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client stopped responding within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Watch a connection for signs of life.
///
/// At each `interval` tick the alive flag is checked and reset. If nothing
/// arrived since the previous tick the missed counter increments; once it
/// reaches `timeout / interval` (at least 1) the connection is considered
/// dead. Any inbound frame (pong, ping or text) counts as alive.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let interval = interval.max(Duration::from_millis(1));
    let mut check = time::interval_at(time::Instant::now() + interval, interval);
    let mut missed: u32 = 0;
    let max_missed = u32::try_from(timeout.as_millis() / interval.as_millis())
        .unwrap_or(u32::MAX)
        .max(1);

    loop {
        tokio::select! {
            _ = check.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

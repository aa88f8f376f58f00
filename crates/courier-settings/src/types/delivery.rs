//! Delivery pipeline settings.

use serde::{Deserialize, Serialize};

/// Per-connection queueing, timeouts and pruning thresholds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// Upper bound for one transport send and for waiting on a full queue.
    pub send_timeout_ms: u64,
    /// Outbound frames buffered per connection.
    pub queue_capacity: usize,
    /// Consecutive hard failures (closed, I/O, isolation) before pruning.
    pub hard_failure_threshold: u32,
    /// Consecutive transient failures (timeout, backpressure) before pruning.
    pub transient_failure_threshold: u32,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5_000,
            queue_capacity: 256,
            hard_failure_threshold: 1,
            transient_failure_threshold: 3,
        }
    }
}

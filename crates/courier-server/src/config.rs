//! Server configuration.

use std::time::Duration;

use courier_settings::{CourierSettings, DeliverySettings};
use serde::{Deserialize, Serialize};

/// Configuration for the courier server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Heartbeat ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is dropped, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Let the hub fabricate user contexts when none is supplied.
    pub allow_synthetic_context: bool,
    /// Delivery pipeline tuning.
    pub delivery: DeliveryConfig,
}

impl ServerConfig {
    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat timeout as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Configuration handed to the connection hub.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            delivery: self.delivery.clone(),
            ping_interval: Some(self.heartbeat_interval()),
            allow_synthetic_context: self.allow_synthetic_context,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_message_size: 1024 * 1024,
            allow_synthetic_context: false,
            delivery: DeliveryConfig::default(),
        }
    }
}

impl From<&CourierSettings> for ServerConfig {
    fn from(settings: &CourierSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            heartbeat_interval_ms: settings.server.heartbeat_interval_ms,
            heartbeat_timeout_ms: settings.server.heartbeat_timeout_ms,
            max_message_size: settings.server.max_message_size,
            allow_synthetic_context: settings.server.allow_synthetic_context,
            delivery: DeliveryConfig::from(&settings.delivery),
        }
    }
}

/// Per-connection queueing, timeouts and pruning thresholds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Bound on one transport send and on waiting for queue space.
    pub send_timeout_ms: u64,
    /// Outbound frames buffered per connection.
    pub queue_capacity: usize,
    /// Consecutive hard failures before a connection is pruned.
    pub hard_failure_threshold: u32,
    /// Consecutive transient failures before a connection is pruned.
    pub transient_failure_threshold: u32,
}

impl DeliveryConfig {
    /// Send timeout as a `Duration`.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::from(&DeliverySettings::default())
    }
}

impl From<&DeliverySettings> for DeliveryConfig {
    fn from(settings: &DeliverySettings) -> Self {
        Self {
            send_timeout_ms: settings.send_timeout_ms,
            queue_capacity: settings.queue_capacity.max(1),
            hard_failure_threshold: settings.hard_failure_threshold.max(1),
            transient_failure_threshold: settings.transient_failure_threshold.max(1),
        }
    }
}

/// Configuration for [`ConnectionHub`](crate::websocket::manager::ConnectionHub).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HubConfig {
    /// Delivery pipeline tuning shared by every user scope.
    pub delivery: DeliveryConfig,
    /// Interval for transport-level pings sent by connection writers.
    pub ping_interval: Option<Duration>,
    /// Test/diagnostic mode: synthesize a context instead of failing.
    pub allow_synthetic_context: bool,
}

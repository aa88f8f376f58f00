//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file only needs the keys it changes.

mod delivery;
mod mode;
mod server;

pub use delivery::*;
pub use mode::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "delivery": { "sendTimeoutMs": 2000 },
///   "mode": "unified"
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    /// Network listener and heartbeat.
    pub server: ServerSettings,
    /// Per-connection delivery tuning.
    pub delivery: DeliverySettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Manager operating mode.
    pub mode: ManagerMode,
}

impl CourierSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("server.host must not be empty".into()));
        }
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeatTimeoutMs ({}) must be at least heartbeatIntervalMs ({})",
                self.server.heartbeat_timeout_ms, self.server.heartbeat_interval_ms
            )));
        }
        if self.delivery.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "delivery.queueCapacity must be positive".into(),
            ));
        }
        if self.delivery.send_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "delivery.sendTimeoutMs must be positive".into(),
            ));
        }
        if self.delivery.hard_failure_threshold == 0 || self.delivery.transient_failure_threshold == 0 {
            return Err(SettingsError::InvalidValue(
                "delivery failure thresholds must be positive".into(),
            ));
        }
        Ok(())
    }
}

//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Call once at
/// startup, before any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Handle backed by a recorder that is not installed globally (tests).
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// Metric name constants to avoid typos across modules.

/// Connections opened (counter).
pub const CONNECTIONS_OPENED_TOTAL: &str = "ws_connections_total";
/// Connections closed (counter, labels: reason).
pub const CONNECTIONS_CLOSED_TOTAL: &str = "ws_disconnections_total";
/// Live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Connections removed after repeated delivery failures (counter).
pub const CONNECTIONS_PRUNED_TOTAL: &str = "ws_connections_pruned_total";
/// Heartbeat timeouts (counter).
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "ws_heartbeat_timeouts_total";
/// `send_to_user` calls (counter, labels: status).
pub const EVENTS_SENT_TOTAL: &str = "events_sent_total";
/// Per-connection delivery attempts (counter, labels: outcome).
pub const DELIVERIES_TOTAL: &str = "deliveries_total";
/// Per-connection delivery failures (counter, labels: kind).
pub const DELIVERY_FAILURES_TOTAL: &str = "delivery_failures_total";
/// Time from enqueue to transport acknowledgement (histogram).
pub const DELIVERY_DURATION_SECONDS: &str = "delivery_duration_seconds";
/// Payloads that needed a string fallback during serialization (counter).
pub const SERIALIZATION_DEGRADED_TOTAL: &str = "serialization_degraded_total";
/// Outbound `user_id` fields rewritten by the isolation guard (counter).
pub const ISOLATION_REWRITES_TOTAL: &str = "isolation_rewrites_total";
/// Deliveries refused for owner or token mismatch (counter).
pub const ISOLATION_VIOLATIONS_TOTAL: &str = "isolation_violations_total";

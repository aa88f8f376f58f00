//! # courierd
//!
//! Courier delivery server binary: loads settings, starts logging and
//! metrics, serves WebSocket clients until SIGINT/SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use courier_server::{ConnectionHub, CourierServer, ServerConfig};
use courier_settings::CourierSettings;

/// Grace period for in-flight tasks after connections are closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Courier per-user event delivery server.
#[derive(Parser, Debug)]
#[command(name = "courierd", about = "Per-user WebSocket event delivery server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.courier/settings.json`).
    #[arg(long, env = "COURIER_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Settings with CLI flags layered on top.
    fn resolve(&self, mut settings: CourierSettings) -> CourierSettings {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json {
            settings.logging.json = true;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(courier_settings::settings_path);
    let settings = courier_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    let settings = cli.resolve(settings);

    courier_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics = courier_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let config = ServerConfig::from(&settings);
    tracing::info!(
        path = %settings_path.display(),
        mode = settings.mode.as_str(),
        heartbeat_interval_ms = config.heartbeat_interval_ms,
        send_timeout_ms = config.delivery.send_timeout_ms,
        "settings loaded"
    );

    let hub = ConnectionHub::new(config.hub_config());
    let server = CourierServer::new(config, hub, metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind listener")?;
    tracing::info!(%addr, "courierd ready");

    wait_for_signal().await;

    let closed = server
        .shutdown()
        .graceful_shutdown(server.hub(), vec![handle], Some(SHUTDOWN_GRACE))
        .await;
    tracing::info!(closed, "courierd stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                let _ = signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::try_parse_from(["courierd"]).unwrap();
        let settings = cli.resolve(CourierSettings::default());
        assert_eq!(settings, CourierSettings::default());
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::try_parse_from([
            "courierd",
            "--host",
            "0.0.0.0",
            "--port",
            "9100",
            "--log-level",
            "debug",
            "--json",
        ])
        .unwrap();
        let settings = cli.resolve(CourierSettings::default());
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn settings_path_flag() {
        let cli = Cli::try_parse_from(["courierd", "--settings", "/etc/courier.json"]).unwrap();
        assert_eq!(cli.settings, Some(PathBuf::from("/etc/courier.json")));
    }

    #[test]
    fn invalid_port_is_rejected() {
        assert!(Cli::try_parse_from(["courierd", "--port", "70000"]).is_err());
    }
}

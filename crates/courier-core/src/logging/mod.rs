//! Structured logging with `tracing`.
//!
//! - [`init_subscriber`] sets up the global subscriber (compact stderr, or
//!   JSON lines when `json` is set).
//! - [`capture_logs`] installs a thread-local in-memory layer for tests.
//!
//! `RUST_LOG`, when set, takes precedence over the configured level.

pub mod test_utils;

pub use test_utils::{LogCapture, LogRecord, capture_logs};

/// Initialize the global tracing subscriber on stderr.
///
/// Call once at startup; later calls are no-ops.
pub fn init_subscriber(level: &str, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json();
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact();
        // set_global_default is a no-op if already set
        let _ = subscriber.try_init();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

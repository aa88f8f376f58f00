//! Log capture for tests that assert on delivery warnings.
//!
//! Events are recorded with their structured fields so tests can check
//! which connection or user a warning was about, not just its text.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// One recorded event.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Event level.
    pub level: Level,
    /// Emitting module path.
    pub target: String,
    /// The `message` field.
    pub message: String,
    /// Every other field, rendered to text.
    pub fields: BTreeMap<String, String>,
}

impl LogRecord {
    /// Rendered value of `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    fn matches(&self, level: Level, message: &str) -> bool {
        self.level == level && self.message.contains(message)
    }
}

/// Handle onto the events recorded since [`capture_logs`] was called.
#[derive(Clone, Default)]
pub struct LogCapture {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl LogCapture {
    /// Snapshot of every record.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// First record at `level` whose message contains `message`.
    pub fn find(&self, level: Level, message: &str) -> Option<LogRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.matches(level, message))
            .cloned()
    }

    /// Whether any record at `level` contains `message`.
    pub fn contains(&self, level: Level, message: &str) -> bool {
        self.records.lock().iter().any(|r| r.matches(level, message))
    }

    /// Records at `level` whose message contains `message`.
    pub fn count(&self, level: Level, message: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.matches(level, message))
            .count()
    }

    /// Records tagged with `conn_id`.
    pub fn for_connection(&self, conn_id: &str) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.field("conn_id") == Some(conn_id))
            .cloned()
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn reset(&self) {
        self.records.lock().clear();
    }
}

impl fmt::Debug for LogCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogCapture")
            .field("records", &self.records.lock().len())
            .finish()
    }
}

#[derive(Default)]
struct Recorder {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for Recorder {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = rendered;
        } else {
            let _ = self.fields.insert(field.name().to_owned(), rendered);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        } else {
            let _ = self.fields.insert(field.name().to_owned(), value.to_owned());
        }
    }
}

struct CaptureLayer(LogCapture);

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut recorder = Recorder::default();
        event.record(&mut recorder);
        let metadata = event.metadata();
        self.0.records.lock().push(LogRecord {
            level: *metadata.level(),
            target: metadata.target().to_owned(),
            message: recorder.message,
            fields: recorder.fields,
        });
    }
}

/// Record every event on the current thread until the guard drops.
///
/// The subscriber is thread-local: async tests must run on the default
/// current-thread runtime or events from worker threads are missed.
pub fn capture_logs() -> (LogCapture, DefaultGuard) {
    let capture = LogCapture::default();
    let guard = tracing_subscriber::registry()
        .with(CaptureLayer(capture.clone()))
        .with(LevelFilter::TRACE)
        .set_default();
    (capture, guard)
}

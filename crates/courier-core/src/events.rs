//! Event types and the wire envelope.
//!
//! Every frame sent to a client is an [`Envelope`]:
//!
//! ```json
//! {"type": "tool_executing",
//!  "payload": {"tool_name": "grep", "timestamp": "...", "user_id": "u1"},
//!  "timestamp": "..."}
//! ```
//!
//! The five agent lifecycle types form a closed set. Each one has a small
//! table of minimum payload fields that are filled in when the producer
//! leaves them out; anything else is carried as [`EventType::Custom`] with
//! no defaults.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{ThreadId, UserId};

// ─────────────────────────────────────────────────────────────────────────────
// EventType
// ─────────────────────────────────────────────────────────────────────────────

/// Event type carried in the envelope's `type` field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// Agent run began.
    AgentStarted,
    /// Agent produced an intermediate thought.
    AgentThinking,
    /// A tool call is running.
    ToolExecuting,
    /// A tool call finished.
    ToolCompleted,
    /// Agent run finished.
    AgentCompleted,
    /// Any other event name.
    Custom(String),
}

impl EventType {
    /// The five agent lifecycle types.
    pub const LIFECYCLE: [EventType; 5] = [
        Self::AgentStarted,
        Self::AgentThinking,
        Self::ToolExecuting,
        Self::ToolCompleted,
        Self::AgentCompleted,
    ];

    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentStarted => "agent_started",
            Self::AgentThinking => "agent_thinking",
            Self::ToolExecuting => "tool_executing",
            Self::ToolCompleted => "tool_completed",
            Self::AgentCompleted => "agent_completed",
            Self::Custom(name) => name,
        }
    }

    /// Parse a wire name. Unknown names become [`EventType::Custom`].
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "agent_started" => Self::AgentStarted,
            "agent_thinking" => Self::AgentThinking,
            "tool_executing" => Self::ToolExecuting,
            "tool_completed" => Self::ToolCompleted,
            "agent_completed" => Self::AgentCompleted,
            other => Self::Custom(other.to_owned()),
        }
    }

    /// Whether this is one of the five lifecycle types.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    /// Insert the type's minimum payload fields that are missing.
    ///
    /// Present fields are never overwritten.
    pub fn fill_defaults(&self, payload: &mut Map<String, Value>) {
        match self {
            Self::AgentStarted => fill(payload, "agent_name", || Value::from("agent")),
            Self::AgentThinking => fill(payload, "thought", || Value::from("")),
            Self::ToolExecuting => fill(payload, "tool_name", || Value::from("unknown")),
            Self::ToolCompleted => {
                fill(payload, "tool_name", || Value::from("unknown"));
                let errored = payload.get("error").is_some_and(|e| !e.is_null());
                fill(payload, "success", || Value::Bool(!errored));
                fill(payload, "duration", || Value::from(0));
            }
            Self::AgentCompleted => fill(payload, "status", || Value::from("completed")),
            Self::Custom(_) => {}
        }
    }
}

fn fill(payload: &mut Map<String, Value>, key: &str, default: impl FnOnce() -> Value) {
    if payload.get(key).is_none_or(Value::is_null) {
        let _ = payload.insert(key.to_owned(), default());
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Custom(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Render a time the way every envelope does (RFC 3339, millis, `Z`).
#[must_use]
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Wire envelope `{type, payload, timestamp}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Event body; always an object once built through this module.
    pub payload: Value,
    /// Emission time.
    pub timestamp: String,
}

impl Envelope {
    /// Wrap a payload, stamping it with the current time.
    ///
    /// A non-object payload is wrapped as `{"value": payload}`; `null` becomes
    /// an empty object.
    pub fn new(event_type: impl Into<EventType>, payload: Value) -> Self {
        let timestamp = iso_timestamp(Utc::now());
        let mut payload = into_object(payload);
        if !payload.contains_key("timestamp") {
            let _ = payload.insert("timestamp".into(), Value::from(timestamp.clone()));
        }
        Self {
            event_type: event_type.into(),
            payload: Value::Object(payload),
            timestamp,
        }
    }

    /// Build a user-addressed event.
    ///
    /// The payload is `{...data, <type defaults>, timestamp, user_id,
    /// thread_id?}`. `user_id` and `thread_id` always reflect the target,
    /// whatever `data` contained.
    pub fn for_user(
        event_type: EventType,
        data: Value,
        user_id: &UserId,
        thread_id: Option<&ThreadId>,
        at: DateTime<Utc>,
    ) -> Self {
        let timestamp = iso_timestamp(at);
        let mut payload = into_object(data);
        event_type.fill_defaults(&mut payload);
        if payload.get("timestamp").is_none_or(Value::is_null) {
            let _ = payload.insert("timestamp".into(), Value::from(timestamp.clone()));
        }
        let _ = payload.insert("user_id".into(), Value::from(user_id.as_str()));
        if let Some(thread) = thread_id {
            let _ = payload.insert("thread_id".into(), Value::from(thread.as_str()));
        }
        Self {
            event_type,
            payload: Value::Object(payload),
            timestamp,
        }
    }

    /// Convert into a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        let mut map = Map::with_capacity(3);
        let _ = map.insert("type".into(), Value::from(String::from(self.event_type)));
        let _ = map.insert("payload".into(), self.payload);
        let _ = map.insert("timestamp".into(), Value::from(self.timestamp));
        Value::Object(map)
    }
}

fn into_object(data: Value) -> Map<String, Value> {
    match data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::with_capacity(1);
            let _ = map.insert("value".into(), other);
            map
        }
    }
}

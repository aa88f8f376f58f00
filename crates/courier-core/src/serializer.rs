//! Wire-safe payload serialization.
//!
//! Producers hand the dispatcher loosely-typed payloads: enums, timestamps,
//! nested maps and lists, nodes shared between several places (and possibly
//! referencing themselves), or objects that only know how to describe
//! themselves. [`serialize`] turns any of those into a `serde_json::Value`
//! holding nothing but strings, numbers, booleans, null, and nested maps/lists.
//!
//! The conversion is total: it never panics and never returns an error.
//! Anything that cannot be converted degrades to a string naming the type
//! (`"<Map object (circular reference)>"`) and sets
//! [`SerializedPayload::degraded`].
//!
//! Cycle safety: shared nodes are tracked by pointer on the current traversal
//! path, and recursion is capped at [`MAX_DEPTH`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use serde_json::{Map, Number, Value};

/// Maximum nesting depth before the walk gives up on a branch.
pub const MAX_DEPTH: usize = 64;

/// A payload node that can be referenced from several places.
pub type SharedPayload = Arc<RwLock<Payload>>;

/// An enum that knows its wire representation.
///
/// Implementors expose the variant identifier and, optionally, a semantic
/// string value. Numeric discriminants are never put on the wire.
pub trait WireEnum {
    /// Name of the enum type (used to detect transport-state enums).
    fn type_name(&self) -> &'static str;
    /// Identifier of the variant, e.g. `"Open"`.
    fn variant_name(&self) -> &'static str;
    /// Semantic string value, if the enum carries one.
    fn wire_value(&self) -> Option<&'static str> {
        None
    }
}

/// Dynamically-typed event payload.
#[derive(Clone)]
pub enum Payload {
    /// JSON null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point (non-finite values degrade to their string form).
    Float(f64),
    /// String.
    Str(String),
    /// Enum value captured through [`WireEnum`].
    Enum {
        /// Enum type name.
        type_name: String,
        /// Variant identifier.
        variant: String,
        /// Semantic string value, if any.
        value: Option<String>,
    },
    /// Point in time.
    Timestamp(DateTime<Utc>),
    /// Calendar date.
    Date(NaiveDate),
    /// Elapsed time, rendered as seconds.
    Duration(std::time::Duration),
    /// Ordered mapping.
    Map(Vec<(String, Payload)>),
    /// Ordered sequence.
    List(Vec<Payload>),
    /// Shared node, possibly part of a cycle.
    Shared(SharedPayload),
    /// Object with no structured representation.
    Opaque {
        /// Rust type name for debuggability.
        type_name: String,
        /// Best-effort textual representation.
        repr: Option<String>,
    },
    /// Already-structured JSON.
    Json(Value),
}

impl Payload {
    /// Build an ordered map payload.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Payload)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Wrap a payload in a shareable node.
    #[must_use]
    pub fn shared(inner: Payload) -> SharedPayload {
        Arc::new(RwLock::new(inner))
    }

    /// Capture an enum value.
    pub fn from_enum<E: WireEnum + ?Sized>(value: &E) -> Self {
        Self::Enum {
            type_name: value.type_name().to_owned(),
            variant: value.variant_name().to_owned(),
            value: value.wire_value().map(str::to_owned),
        }
    }

    /// Describe an arbitrary value by its type name and `Debug` output.
    pub fn opaque<T: fmt::Debug>(value: &T) -> Self {
        Self::Opaque {
            type_name: short_type_name::<T>().to_owned(),
            repr: Some(format!("{value:?}")),
        }
    }

    /// Label used in fallback strings.
    fn kind(&self) -> &str {
        match self {
            Self::Null => "Null",
            Self::Bool(_) => "Bool",
            Self::Int(_) | Self::UInt(_) => "Int",
            Self::Float(_) => "Float",
            Self::Str(_) => "Str",
            Self::Enum { type_name, .. } | Self::Opaque { type_name, .. } => type_name,
            Self::Timestamp(_) => "Timestamp",
            Self::Date(_) => "Date",
            Self::Duration(_) => "Duration",
            Self::Map(_) => "Map",
            Self::List(_) => "List",
            Self::Shared(_) => "SharedPayload",
            Self::Json(_) => "Json",
        }
    }
}

impl fmt::Debug for Payload {
    // Shared nodes may be cyclic, so they are never followed here.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Int(i) => f.debug_tuple("Int").field(i).finish(),
            Self::UInt(u) => f.debug_tuple("UInt").field(u).finish(),
            Self::Float(x) => f.debug_tuple("Float").field(x).finish(),
            Self::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Self::Enum { type_name, variant, .. } => write!(f, "Enum({type_name}::{variant})"),
            Self::Timestamp(t) => f.debug_tuple("Timestamp").field(t).finish(),
            Self::Date(d) => f.debug_tuple("Date").field(d).finish(),
            Self::Duration(d) => f.debug_tuple("Duration").field(d).finish(),
            Self::Map(entries) => f.debug_map().entries(entries.iter().map(|(k, v)| (k, v))).finish(),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Shared(node) => write!(f, "Shared({:p})", Arc::as_ptr(node)),
            Self::Opaque { type_name, .. } => write!(f, "Opaque({type_name})"),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
        }
    }
}

impl From<bool> for Payload {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Payload {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Payload {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Payload {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<DateTime<Utc>> for Payload {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize(self).serialize(serializer)
    }
}

/// Serialized value plus whether any branch fell back to a string.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedPayload {
    /// Wire-safe value.
    pub value: Value,
    /// At least one node could not be converted structurally.
    pub degraded: bool,
}

/// Convert a payload into a wire-safe JSON value.
pub fn serialize(payload: &Payload) -> Value {
    serialize_checked(payload).value
}

/// Like [`serialize`], also reporting whether the output was degraded.
pub fn serialize_checked(payload: &Payload) -> SerializedPayload {
    let mut walker = Walker::default();
    let value = walker.walk(payload, 0);
    if walker.degraded {
        tracing::debug!(kind = payload.kind(), "payload serialization degraded to string fallback");
    }
    SerializedPayload {
        value,
        degraded: walker.degraded,
    }
}

/// Convert any `Serialize` value, falling back to a type-named string.
pub fn serialize_value<T: Serialize + ?Sized>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(type_name = std::any::type_name::<T>(), error = %e, "value not serializable, using fallback");
            Value::String(format!(
                "<{} object (unserializable: {e})>",
                short_type_name::<T>()
            ))
        }
    }
}

/// Whether an enum type is a transport/connection state enum.
///
/// These always render as the lower-cased variant name so that readers on the
/// other side see `"open"` rather than a framework-specific number.
fn is_state_enum(type_name: &str) -> bool {
    type_name.ends_with("State")
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[derive(Default)]
struct Walker {
    /// Shared nodes on the current path, with the kind of their content.
    on_path: HashMap<usize, String>,
    degraded: bool,
}

impl Walker {
    fn fallback(&mut self, label: &str, reason: &str) -> Value {
        self.degraded = true;
        Value::String(format!("<{label} object ({reason})>"))
    }

    fn walk(&mut self, payload: &Payload, depth: usize) -> Value {
        if depth > MAX_DEPTH {
            return self.fallback(payload.kind(), "max depth exceeded");
        }
        match payload {
            Payload::Null => Value::Null,
            Payload::Bool(b) => Value::Bool(*b),
            Payload::Int(i) => Value::from(*i),
            Payload::UInt(u) => Value::from(*u),
            Payload::Float(x) => match Number::from_f64(*x) {
                Some(n) => Value::Number(n),
                None => {
                    self.degraded = true;
                    Value::String(x.to_string())
                }
            },
            Payload::Str(s) => Value::String(s.clone()),
            Payload::Enum {
                type_name,
                variant,
                value,
            } => {
                if is_state_enum(type_name) {
                    Value::String(variant.to_lowercase())
                } else {
                    Value::String(value.clone().unwrap_or_else(|| variant.to_lowercase()))
                }
            }
            Payload::Timestamp(t) => Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Payload::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            Payload::Duration(d) => Number::from_f64(d.as_secs_f64()).map_or(Value::Null, Value::Number),
            Payload::Map(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, value) in entries {
                    let v = self.walk(value, depth + 1);
                    let _ = map.insert(key.clone(), v);
                }
                Value::Object(map)
            }
            Payload::List(items) => {
                Value::Array(items.iter().map(|item| self.walk(item, depth + 1)).collect())
            }
            Payload::Shared(node) => self.walk_shared(node, depth),
            Payload::Opaque { type_name, repr } => {
                self.degraded = true;
                Value::String(repr.clone().unwrap_or_else(|| format!("<{type_name} object>")))
            }
            Payload::Json(v) => v.clone(),
        }
    }

    fn walk_shared(&mut self, node: &SharedPayload, depth: usize) -> Value {
        let key = Arc::as_ptr(node) as usize;
        if let Some(kind) = self.on_path.get(&key) {
            let kind = kind.clone();
            return self.fallback(&kind, "circular reference");
        }
        // Never block: a writer holding the node means we render a placeholder.
        let Some(guard) = node.try_read() else {
            return self.fallback("SharedPayload", "locked");
        };
        let _ = self.on_path.insert(key, guard.kind().to_owned());
        let value = self.walk(&guard, depth + 1);
        let _ = self.on_path.remove(&key);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[derive(Debug, Clone, Copy)]
    #[allow(dead_code)]
    enum WebSocketState {
        Connecting = 0,
        Open = 1,
        Closing = 2,
        Closed = 3,
    }

    impl WireEnum for WebSocketState {
        fn type_name(&self) -> &'static str {
            "WebSocketState"
        }
        fn variant_name(&self) -> &'static str {
            match self {
                Self::Connecting => "CONNECTING",
                Self::Open => "OPEN",
                Self::Closing => "CLOSING",
                Self::Closed => "CLOSED",
            }
        }
    }

    enum AgentPhase {
        Planning,
        Executing,
    }

    impl WireEnum for AgentPhase {
        fn type_name(&self) -> &'static str {
            "AgentPhase"
        }
        fn variant_name(&self) -> &'static str {
            match self {
                Self::Planning => "Planning",
                Self::Executing => "Executing",
            }
        }
        fn wire_value(&self) -> Option<&'static str> {
            match self {
                Self::Planning => Some("plan"),
                Self::Executing => None,
            }
        }
    }

    #[test]
    fn primitives_pass_through() {
        assert_eq!(serialize(&Payload::Null), Value::Null);
        assert_eq!(serialize(&Payload::Bool(true)), json!(true));
        assert_eq!(serialize(&Payload::Int(-7)), json!(-7));
        assert_eq!(serialize(&Payload::UInt(u64::MAX)), json!(u64::MAX));
        assert_eq!(serialize(&Payload::Float(1.5)), json!(1.5));
        assert_eq!(serialize(&Payload::from("hi")), json!("hi"));
    }

    #[test]
    fn state_enum_renders_lowercase_name_not_number() {
        let v = serialize(&Payload::from_enum(&WebSocketState::Open));
        assert_eq!(v, json!("open"));
    }

    #[test]
    fn enum_prefers_semantic_value() {
        assert_eq!(serialize(&Payload::from_enum(&AgentPhase::Planning)), json!("plan"));
        assert_eq!(serialize(&Payload::from_enum(&AgentPhase::Executing)), json!("executing"));
    }

    #[test]
    fn timestamps_are_iso8601() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(serialize(&Payload::from(t)), json!("2026-03-01T12:30:00.000Z"));
        let d = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(serialize(&Payload::Date(d)), json!("2026-03-01"));
    }

    #[test]
    fn map_preserves_key_order() {
        let p = Payload::map([
            ("zeta", Payload::Int(1)),
            ("alpha", Payload::Int(2)),
            ("mid", Payload::Int(3)),
        ]);
        let v = serialize(&p);
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn nested_structures_recurse() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let p = Payload::map([
            ("state", Payload::from_enum(&WebSocketState::Closed)),
            ("events", Payload::List(vec![Payload::from(t), Payload::Null])),
        ]);
        assert_eq!(
            serialize(&p),
            json!({"state": "closed", "events": ["2026-01-01T00:00:00.000Z", null]})
        );
    }

    #[test]
    fn self_reference_falls_back_to_string() {
        let node = Payload::shared(Payload::Map(vec![("name".into(), Payload::from("root"))]));
        if let Payload::Map(entries) = &mut *node.write() {
            entries.push(("self".into(), Payload::Shared(Arc::clone(&node))));
        }

        let out = serialize_checked(&Payload::Shared(Arc::clone(&node)));
        assert!(out.degraded);
        assert_eq!(out.value["name"], "root");
        assert_eq!(out.value["self"], "<Map object (circular reference)>");

        // Break the cycle so the Arc is freed.
        *node.write() = Payload::Null;
    }

    #[test]
    fn shared_node_repeated_without_cycle_is_expanded_twice() {
        let node = Payload::shared(Payload::from("same"));
        let p = Payload::List(vec![
            Payload::Shared(Arc::clone(&node)),
            Payload::Shared(Arc::clone(&node)),
        ]);
        let out = serialize_checked(&p);
        assert!(!out.degraded);
        assert_eq!(out.value, json!(["same", "same"]));
    }

    #[test]
    fn write_locked_node_does_not_block() {
        let node = Payload::shared(Payload::Int(1));
        let _guard = node.write();
        let v = serialize(&Payload::Shared(Arc::clone(&node)));
        assert_eq!(v, json!("<SharedPayload object (locked)>"));
    }

    #[test]
    fn depth_is_bounded() {
        let mut p = Payload::Int(0);
        for _ in 0..(MAX_DEPTH + 10) {
            p = Payload::List(vec![p]);
        }
        let out = serialize_checked(&p);
        assert!(out.degraded);
        assert!(out.value.to_string().contains("max depth exceeded"));
    }

    #[test]
    fn opaque_uses_type_name() {
        struct Socket;
        let p = Payload::Opaque {
            type_name: "Socket".into(),
            repr: None,
        };
        let _ = Socket;
        assert_eq!(serialize(&p), json!("<Socket object>"));

        #[derive(Debug)]
        struct Handle(u8);
        assert_eq!(serialize(&Payload::opaque(&Handle(3))), json!("Handle(3)"));
    }

    #[test]
    fn non_finite_float_degrades() {
        let out = serialize_checked(&Payload::Float(f64::NAN));
        assert!(out.degraded);
        assert_eq!(out.value, json!("NaN"));
    }

    #[test]
    fn serialize_value_falls_back_for_non_string_keys() {
        use std::collections::BTreeMap;
        let mut bad: BTreeMap<(u8, u8), u8> = BTreeMap::new();
        let _ = bad.insert((1, 2), 3);
        let v = serialize_value(&bad);
        let s = v.as_str().unwrap();
        assert!(s.starts_with("<BTreeMap object (unserializable"));
    }

    #[test]
    fn serialize_value_passes_plain_structs() {
        #[derive(Serialize)]
        struct Tool {
            name: &'static str,
            ok: bool,
        }
        let v = serialize_value(&Tool { name: "grep", ok: true });
        assert_eq!(v, json!({"name": "grep", "ok": true}));
    }

    #[test]
    fn payload_implements_serialize() {
        let p = Payload::map([("state", Payload::from_enum(&WebSocketState::Open))]);
        let s = serde_json::to_string(&p).unwrap();
        assert_eq!(s, r#"{"state":"open"}"#);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_payload() -> impl Strategy<Value = Payload> {
            let leaf = prop_oneof![
                Just(Payload::Null),
                any::<bool>().prop_map(Payload::Bool),
                any::<i64>().prop_map(Payload::Int),
                any::<f64>().prop_map(Payload::Float),
                ".{0,16}".prop_map(Payload::Str),
                (0i64..4_102_444_800).prop_map(|secs| {
                    Payload::Timestamp(DateTime::from_timestamp(secs, 0).unwrap_or_default())
                }),
            ];
            leaf.prop_recursive(6, 96, 8, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..8).prop_map(Payload::List),
                    prop::collection::vec(("[a-z]{1,8}", inner.clone()), 0..8)
                        .prop_map(Payload::Map),
                    inner.prop_map(|p| Payload::Shared(Payload::shared(p))),
                ]
            })
        }

        proptest! {
            #[test]
            fn serialize_is_total_and_json_encodable(p in arb_payload()) {
                let v = serialize(&p);
                prop_assert!(serde_json::to_string(&v).is_ok());
            }

            #[test]
            fn integers_round_trip(i in any::<i64>()) {
                prop_assert_eq!(serialize(&Payload::Int(i)), Value::from(i));
            }

            #[test]
            fn strings_round_trip(s in ".*") {
                prop_assert_eq!(serialize(&Payload::Str(s.clone())), Value::String(s));
            }
        }
    }
}

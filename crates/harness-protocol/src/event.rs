//! Event records: lifecycle and telemetry schemas sharing one log format.
//!
//! A log line is a *lifecycle* record when it carries `event_type`, and a
//! *telemetry* record when it carries `kind` and `name`. [`EventRecord`]
//! is the tagged union over both; it serializes untagged so each line is
//! exactly the schema's own fields.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::ids::{ContentHash, CycleId, RunId, WorkOrderId};

/// Open-ended JSON object used for `detail`, `meta` and `summary` fields.
pub type Payload = BTreeMap<String, Value>;

pub const LIFECYCLE_EVENT_VERSION: &str = "abm.event.v1";

/// Lifecycle event types, forward-compatible: unknown names are kept
/// verbatim in [`LifecycleEventType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LifecycleEventType {
    CycleStart,
    AttemptStart,
    VerifyStart,
    VerifyResult,
    AttemptEnd,
    StateTransition,
    CycleEnd,
    Other(String),
}

impl LifecycleEventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::CycleStart => "cycle_start",
            Self::AttemptStart => "attempt_start",
            Self::VerifyStart => "verify_start",
            Self::VerifyResult => "verify_result",
            Self::AttemptEnd => "attempt_end",
            Self::StateTransition => "state_transition",
            Self::CycleEnd => "cycle_end",
            Self::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "cycle_start" => Self::CycleStart,
            "attempt_start" => Self::AttemptStart,
            "verify_start" => Self::VerifyStart,
            "verify_result" => Self::VerifyResult,
            "attempt_end" => Self::AttemptEnd,
            "state_transition" => Self::StateTransition,
            "cycle_end" => Self::CycleEnd,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for LifecycleEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LifecycleEventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LifecycleEventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

/// One control-loop milestone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_version: String,
    pub event_type: LifecycleEventType,
    pub timestamp_utc: String,
    pub run_id: RunId,
    pub dispatch_hash: ContentHash,
    pub head: String,
    pub work_order_id: Option<WorkOrderId>,
    pub cycle_id: Option<CycleId>,
    pub agent_id: String,
    #[serde(default)]
    pub detail: Payload,
}

/// Measurement sample: a step duration, an error, a retry, token usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ms: Option<f64>,
    #[serde(default)]
    pub meta: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

impl TelemetryEvent {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            ms: None,
            meta: Payload::new(),
            ts: None,
        }
    }

    pub fn with_ms(mut self, ms: f64) -> Self {
        self.ms = Some(ms);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    Lifecycle(LifecycleEvent),
    Telemetry(TelemetryEvent),
}

impl EventRecord {
    pub fn as_lifecycle(&self) -> Option<&LifecycleEvent> {
        match self {
            Self::Lifecycle(event) => Some(event),
            Self::Telemetry(_) => None,
        }
    }

    pub fn as_telemetry(&self) -> Option<&TelemetryEvent> {
        match self {
            Self::Telemetry(event) => Some(event),
            Self::Lifecycle(_) => None,
        }
    }
}

impl From<LifecycleEvent> for EventRecord {
    fn from(event: LifecycleEvent) -> Self {
        Self::Lifecycle(event)
    }
}

impl From<TelemetryEvent> for EventRecord {
    fn from(event: TelemetryEvent) -> Self {
        Self::Telemetry(event)
    }
}

impl Serialize for EventRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Lifecycle(event) => event.serialize(serializer),
            Self::Telemetry(event) => event.serialize(serializer),
        }
    }
}

/// Discriminates on which schema's required fields are present.
impl<'de> Deserialize<'de> for EventRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let raw = Value::deserialize(deserializer)?;
        let Some(obj) = raw.as_object() else {
            return Err(D::Error::custom("event record must be a JSON object"));
        };
        if obj.contains_key("event_type") {
            serde_json::from_value(raw)
                .map(Self::Lifecycle)
                .map_err(|e| D::Error::custom(format!("invalid lifecycle event: {e}")))
        } else if obj.contains_key("kind") && obj.contains_key("name") {
            serde_json::from_value(raw)
                .map(Self::Telemetry)
                .map_err(|e| D::Error::custom(format!("invalid telemetry event: {e}")))
        } else {
            Err(D::Error::custom(
                "event record has neither event_type nor kind+name",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lifecycle() -> LifecycleEvent {
        LifecycleEvent {
            event_version: LIFECYCLE_EVENT_VERSION.to_owned(),
            event_type: LifecycleEventType::CycleStart,
            timestamp_utc: "2026-01-01T00:00:00Z".to_owned(),
            run_id: RunId::from("run-1"),
            dispatch_hash: ContentHash::from_hex("ab".repeat(32)),
            head: "abc123".to_owned(),
            work_order_id: Some(WorkOrderId::from("WO-1")),
            cycle_id: Some(CycleId::from_index(1)),
            agent_id: "harness".to_owned(),
            detail: Payload::new(),
        }
    }

    #[test]
    fn lifecycle_line_carries_nulls_for_absent_ids() {
        let mut event = lifecycle();
        event.work_order_id = None;
        event.cycle_id = None;
        let value = serde_json::to_value(EventRecord::from(event)).unwrap();
        assert_eq!(value["work_order_id"], Value::Null);
        assert_eq!(value["cycle_id"], Value::Null);
        assert_eq!(value["event_type"], "cycle_start");
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn discriminates_by_present_fields() {
        let line = serde_json::to_string(&EventRecord::from(lifecycle())).unwrap();
        let parsed: EventRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.as_lifecycle(), Some(&lifecycle()));

        let telemetry: EventRecord =
            serde_json::from_value(json!({"kind": "step", "name": "build", "ms": 12.5})).unwrap();
        let telemetry = telemetry.as_telemetry().unwrap();
        assert_eq!(telemetry.ms, Some(12.5));
        assert!(telemetry.meta.is_empty());
    }

    #[test]
    fn rejects_records_matching_neither_schema() {
        let err = serde_json::from_value::<EventRecord>(json!({"kind": "step"})).unwrap_err();
        assert!(err.to_string().contains("neither event_type nor kind+name"));
        assert!(serde_json::from_value::<EventRecord>(json!([1])).is_err());
    }

    #[test]
    fn unknown_event_types_are_preserved() {
        let mut value = serde_json::to_value(lifecycle()).unwrap();
        value["event_type"] = json!("operator_note");
        let parsed: LifecycleEvent = serde_json::from_value(value).unwrap();
        assert_eq!(
            parsed.event_type,
            LifecycleEventType::Other("operator_note".to_owned())
        );
        assert_eq!(serde_json::to_value(&parsed).unwrap()["event_type"], "operator_note");
    }

    #[test]
    fn telemetry_builder_omits_absent_optionals() {
        let event = TelemetryEvent::new("error", "acceptance:unit")
            .with_meta("error_class", "timeout");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"kind": "error", "name": "acceptance:unit", "meta": {"error_class": "timeout"}}));
    }
}

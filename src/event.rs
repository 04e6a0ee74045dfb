//! Event model shared by the slicer, the fold, the runtime and the daemon.
//!
//! Events are immutable once appended. Everything in this module is plain
//! data plus pure helpers; no I/O happens here.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Tenant used when tenancy is [`TenancyStyle::Single`](crate::TenancyStyle::Single)
/// or when a session does not name one.
pub const DEFAULT_TENANT: &str = "*DEFAULT*";

/// Reserved stream that receives tombstone events.
pub const TOMBSTONE_STREAM: &str = "mt_tombstone";

/// Event type tag of tombstone events.
pub const TOMBSTONE_EVENT_TYPE: &str = "tombstone";

/// Which identity shape streams use in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamIdentity {
    /// Streams are identified by UUIDs.
    #[default]
    AsGuid,
    /// Streams are identified by string keys.
    AsString,
}

/// Identity of a stream or of an aggregate document.
///
/// Single-stream aggregates share their stream's identity; multi-stream
/// aggregates use whatever identity rules resolve to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identity {
    /// UUID identity.
    Guid(Uuid),
    /// String key identity.
    Key(String),
}

impl Identity {
    /// The identity shape of this value.
    pub fn kind(&self) -> StreamIdentity {
        match self {
            Identity::Guid(_) => StreamIdentity::AsGuid,
            Identity::Key(_) => StreamIdentity::AsString,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Guid(id) => write!(f, "{id}"),
            Identity::Key(key) => f.write_str(key),
        }
    }
}

impl From<Uuid> for Identity {
    fn from(id: Uuid) -> Self {
        Identity::Guid(id)
    }
}

impl From<&str> for Identity {
    fn from(key: &str) -> Self {
        Identity::Key(key.to_owned())
    }
}

impl From<String> for Identity {
    fn from(key: String) -> Self {
        Identity::Key(key)
    }
}

/// Infrastructure metadata stamped on every appended event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Correlation ID from the session context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Causation ID from the session context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Identity of whoever caused the append, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Free-form headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Value>,
}

/// An appended event as seen by projections.
///
/// `sequence` is the global position (1-based, gapless across the store,
/// tombstones included); `version` is the 1-based position inside `stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: Uuid,
    /// Global sequence number.
    pub sequence: u64,
    /// Stream the event was appended to.
    pub stream: Identity,
    /// Version of the stream after this event.
    pub version: u64,
    /// Owning tenant.
    pub tenant_id: String,
    /// Event type tag (e.g. `"TripStarted"`).
    pub event_type: String,
    /// Append time, Unix epoch milliseconds.
    pub timestamp: u64,
    /// Event payload.
    pub data: Value,
    /// Aggregate type the stream is tagged with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_type: Option<String>,
    /// Correlation, causation and header metadata.
    #[serde(default)]
    pub metadata: EventMetadata,
    /// Logical archive flag. Archived events are hidden from async projections.
    #[serde(default)]
    pub is_archived: bool,
}

impl Event {
    /// Build a tombstone occupying `sequence`.
    pub fn tombstone(sequence: u64, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            stream: Identity::Key(TOMBSTONE_STREAM.to_owned()),
            version: 0,
            tenant_id: DEFAULT_TENANT.to_owned(),
            event_type: TOMBSTONE_EVENT_TYPE.to_owned(),
            timestamp,
            data: Value::Null,
            aggregate_type: None,
            metadata: EventMetadata::default(),
            is_archived: false,
        }
    }

    /// Returns `true` for tombstones written by the failure-recovery path.
    pub fn is_tombstone(&self) -> bool {
        self.event_type == TOMBSTONE_EVENT_TYPE
            && matches!(&self.stream, Identity::Key(key) if key == TOMBSTONE_STREAM)
    }

    /// Derive a child event for fan-out.
    ///
    /// The child keeps every positional field of `self` (sequence, version,
    /// stream, tenant, timestamp, metadata) and only swaps type and payload.
    pub fn with_data(&self, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            ..self.clone()
        }
    }
}

/// An event submitted for append, before the store assigns positions.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Event type tag.
    pub event_type: String,
    /// Event payload.
    pub data: Value,
}

impl NewEvent {
    /// Create a new event from a raw type tag and payload.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    /// Encode an adjacently tagged domain event.
    ///
    /// The domain enum must use `#[serde(tag = "type", content = "data")]`.
    /// The `"type"` field becomes [`NewEvent::event_type`] and the `"data"`
    /// field (null for unit variants) becomes [`NewEvent::data`].
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the event cannot be serialized or does
    /// not serialize to a tagged object.
    pub fn encode<E: Serialize>(event: &E) -> serde_json::Result<Self> {
        encode_domain_event(event)
    }
}

/// Encode an adjacently tagged domain event into a [`NewEvent`].
///
/// # Errors
///
/// Returns `serde_json::Error` if the value is not an object with a string
/// `"type"` field.
pub fn encode_domain_event<E: Serialize>(event: &E) -> serde_json::Result<NewEvent> {
    // Produces `{"type": "Started"}` or `{"type": "Moved", "data": {...}}`.
    let value = serde_json::to_value(event)?;
    let Value::Object(mut obj) = value else {
        return Err(serde::ser::Error::custom(
            "domain event must serialize to an adjacently tagged object",
        ));
    };
    let event_type = match obj.remove("type") {
        Some(Value::String(tag)) => tag,
        _ => {
            return Err(serde::ser::Error::custom(
                "domain event is missing a string 'type' tag",
            ));
        }
    };
    let data = obj.remove("data").unwrap_or(Value::Null);
    Ok(NewEvent { event_type, data })
}

/// Current wall-clock time as Unix epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    #[serde(tag = "type", content = "data")]
    enum TripEvent {
        Started,
        Moved { miles: u32 },
    }

    #[test]
    fn identity_display_and_kind() {
        let id = Uuid::new_v4();
        assert_eq!(Identity::from(id).to_string(), id.to_string());
        assert_eq!(Identity::from(id).kind(), StreamIdentity::AsGuid);
        assert_eq!(Identity::from("abc").to_string(), "abc");
        assert_eq!(Identity::from("abc").kind(), StreamIdentity::AsString);
    }

    #[test]
    fn encode_unit_variant_has_null_data() {
        let new = encode_domain_event(&TripEvent::Started).expect("encode should succeed");
        assert_eq!(new.event_type, "Started");
        assert!(new.data.is_null());
    }

    #[test]
    fn encode_variant_with_fields_extracts_data() {
        let new = NewEvent::encode(&TripEvent::Moved { miles: 12 }).expect("encode should succeed");
        assert_eq!(new.event_type, "Moved");
        assert_eq!(new.data, json!({"miles": 12}));
    }

    #[test]
    fn encode_rejects_untagged_values() {
        assert!(encode_domain_event(&42u32).is_err());
        assert!(encode_domain_event(&json!({"kind": "Started"})).is_err());
    }

    #[test]
    fn tombstone_is_recognised() {
        let tomb = Event::tombstone(7, 0);
        assert!(tomb.is_tombstone());
        assert_eq!(tomb.sequence, 7);

        let mut regular = tomb.clone();
        regular.stream = Identity::from("t-1");
        assert!(!regular.is_tombstone());
    }

    #[test]
    fn with_data_keeps_position() {
        let source = Event {
            id: Uuid::new_v4(),
            sequence: 12,
            stream: Identity::from("t-1"),
            version: 3,
            tenant_id: "blue".into(),
            event_type: "Travelled".into(),
            timestamp: 99,
            data: json!({"legs": 2}),
            aggregate_type: Some("trip".into()),
            metadata: EventMetadata::default(),
            is_archived: false,
        };
        let child = source.with_data("Leg", json!({"n": 1}));
        assert_eq!(child.sequence, 12);
        assert_eq!(child.version, 3);
        assert_eq!(child.tenant_id, "blue");
        assert_eq!(child.event_type, "Leg");
        assert_ne!(child.id, source.id);
    }

    #[test]
    fn metadata_skips_empty_fields() {
        let json = serde_json::to_string(&EventMetadata::default()).expect("serialize");
        assert_eq!(json, "{}");
    }
}

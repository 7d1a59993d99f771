//! Thing events and the envelope they are persisted in.
//!
//! A [`StoredEvent`] is an immutable fact: once appended to the event log it
//! is never rewritten. Its `revision` is the thing's revision *after* the
//! event is applied, so the first event of a stream has revision 1.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::command::Headers;
use crate::pointer::JsonPointer;
use crate::thing::{Feature, Thing, ThingId};

/// Domain events produced by thing strategies.
///
/// Uses adjacently tagged serialization (`"type"` + `"data"`), the same
/// shape the event log stores on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ThingEvent {
    ThingCreated {
        thing: Thing,
    },
    ThingDeleted,
    PolicyIdModified {
        policy_id: String,
    },
    AttributeCreated {
        pointer: JsonPointer,
        value: Value,
    },
    AttributeModified {
        pointer: JsonPointer,
        value: Value,
    },
    AttributeDeleted {
        pointer: JsonPointer,
    },
    AttributesDeleted,
    FeatureCreated {
        feature_id: String,
        feature: Feature,
    },
    FeatureModified {
        feature_id: String,
        feature: Feature,
    },
    FeatureDeleted {
        feature_id: String,
    },
    FeaturePropertiesCreated {
        feature_id: String,
        properties: Map<String, Value>,
    },
    FeaturePropertiesModified {
        feature_id: String,
        properties: Map<String, Value>,
    },
    FeaturePropertiesDeleted {
        feature_id: String,
    },
}

impl ThingEvent {
    /// The event type tag, e.g. `"FeatureCreated"`.
    pub fn event_type(&self) -> &'static str {
        match self {
            ThingEvent::ThingCreated { .. } => "ThingCreated",
            ThingEvent::ThingDeleted => "ThingDeleted",
            ThingEvent::PolicyIdModified { .. } => "PolicyIdModified",
            ThingEvent::AttributeCreated { .. } => "AttributeCreated",
            ThingEvent::AttributeModified { .. } => "AttributeModified",
            ThingEvent::AttributeDeleted { .. } => "AttributeDeleted",
            ThingEvent::AttributesDeleted => "AttributesDeleted",
            ThingEvent::FeatureCreated { .. } => "FeatureCreated",
            ThingEvent::FeatureModified { .. } => "FeatureModified",
            ThingEvent::FeatureDeleted { .. } => "FeatureDeleted",
            ThingEvent::FeaturePropertiesCreated { .. } => "FeaturePropertiesCreated",
            ThingEvent::FeaturePropertiesModified { .. } => "FeaturePropertiesModified",
            ThingEvent::FeaturePropertiesDeleted { .. } => "FeaturePropertiesDeleted",
        }
    }
}

/// Causal metadata stamped on every event, taken from the command headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorization_context: Vec<String>,
}

impl From<&Headers> for EventMetadata {
    fn from(headers: &Headers) -> Self {
        Self {
            correlation_id: headers.correlation_id.clone(),
            timeout: headers.timeout,
            authorization_context: headers.authorization_context.clone(),
        }
    }
}

/// An event as it is appended to, and loaded from, the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub thing_id: ThingId,
    /// Revision of the thing after this event is applied.
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: EventMetadata,
    pub event: ThingEvent,
}

impl StoredEvent {
    /// Build a new event with a fresh UUID v4 id.
    pub fn new(
        thing_id: ThingId,
        revision: u64,
        timestamp: DateTime<Utc>,
        headers: &Headers,
        event: ThingEvent,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            thing_id,
            revision,
            timestamp,
            metadata: EventMetadata::from(headers),
            event,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn room_id() -> ThingId {
        ThingId::parse("org.example:room-1").unwrap()
    }

    #[test]
    fn event_type_matches_serde_tag() {
        let event = ThingEvent::AttributeDeleted {
            pointer: JsonPointer::parse("/temperature"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.event_type());
        assert_eq!(value["data"]["pointer"], "/temperature");
    }

    #[test]
    fn fieldless_variant_has_no_data() {
        let value = serde_json::to_value(ThingEvent::ThingDeleted).unwrap();
        assert_eq!(value, json!({"type": "ThingDeleted"}));
    }

    #[test]
    fn metadata_taken_from_headers() {
        let headers = Headers::default()
            .with_correlation_id("req-7")
            .with_timeout(Duration::from_secs(2))
            .with_subject("user:bob");
        let meta = EventMetadata::from(&headers);
        assert_eq!(meta.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(meta.timeout, Some(Duration::from_secs(2)));
        assert_eq!(meta.authorization_context, ["user:bob"]);
    }

    #[test]
    fn stored_event_serde_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let event = StoredEvent::new(
            room_id(),
            3,
            ts,
            &Headers::default().with_correlation_id("c"),
            ThingEvent::FeatureDeleted {
                feature_id: "thermostat".into(),
            },
        );
        let line = serde_json::to_string(&event).unwrap();
        let back: StoredEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.event_type(), "FeatureDeleted");
    }

    #[test]
    fn fresh_events_get_distinct_ids() {
        let ts = Utc::now();
        let a = StoredEvent::new(room_id(), 1, ts, &Headers::default(), ThingEvent::ThingDeleted);
        let b = StoredEvent::new(room_id(), 1, ts, &Headers::default(), ThingEvent::ThingDeleted);
        assert_ne!(a.event_id, b.event_id);
    }
}

//! Success responses returned to callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pointer::JsonPointer;
use crate::thing::ThingId;

/// The part of a thing a response refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path")]
pub enum Resource {
    Thing,
    PolicyId,
    Attributes,
    Attribute(JsonPointer),
    Feature(String),
    FeatureProperties(String),
    /// A live message, identified by its subject.
    Message(String),
}

/// Outcome category of a successful request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Created,
    Modified,
    Deleted,
    Retrieved,
    /// A live signal was handed to the pub/sub fabric and no reply is expected.
    Accepted,
    /// A reply to a live command or message, produced by a remote device.
    Replied,
}

/// A successful response to a command or live signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub thing_id: ThingId,
    pub resource: Resource,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommandResponse {
    pub fn new(thing_id: ThingId, resource: Resource, status: ResponseStatus) -> Self {
        Self {
            thing_id,
            resource,
            status,
            payload: None,
            correlation_id: None,
        }
    }

    pub fn created(thing_id: ThingId, resource: Resource, payload: Value) -> Self {
        Self::new(thing_id, resource, ResponseStatus::Created).with_payload(payload)
    }

    pub fn modified(thing_id: ThingId, resource: Resource) -> Self {
        Self::new(thing_id, resource, ResponseStatus::Modified)
    }

    pub fn deleted(thing_id: ThingId, resource: Resource) -> Self {
        Self::new(thing_id, resource, ResponseStatus::Deleted)
    }

    pub fn retrieved(thing_id: ThingId, resource: Resource, payload: Value) -> Self {
        Self::new(thing_id, resource, ResponseStatus::Retrieved).with_payload(payload)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_set_status_and_payload() {
        let id = ThingId::parse("org.example:room-1").unwrap();
        let created = CommandResponse::created(
            id.clone(),
            Resource::Feature("thermostat".into()),
            json!({}),
        );
        assert_eq!(created.status, ResponseStatus::Created);
        assert_eq!(created.payload, Some(json!({})));

        let modified = CommandResponse::modified(id, Resource::Feature("thermostat".into()));
        assert_eq!(modified.status, ResponseStatus::Modified);
        assert_eq!(modified.payload, None);
    }

    #[test]
    fn response_serializes_resource_path() {
        let id = ThingId::parse("org.example:room-1").unwrap();
        let response = CommandResponse::deleted(id, Resource::Attribute("/temperature".into()))
            .with_correlation_id(Some("c-1".into()));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["resource"], json!({"kind": "Attribute", "path": "/temperature"}));
        assert_eq!(value["status"], "deleted");
        assert_eq!(value["correlation_id"], "c-1");
    }
}

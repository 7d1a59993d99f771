//! The thing model: identifier, materialized state, and event folding.
//!
//! A [`Thing`] is never mutated in place by anything but its worker, which
//! folds [`ThingEvent`]s through [`apply_event`]. Folding is pure and
//! deterministic, so replaying a stream always reproduces the same state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::event::ThingEvent;
use crate::pointer::FieldSelector;

/// Error returned when parsing a malformed [`ThingId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid thing id '{raw}': expected '<namespace>:<name>' with a non-empty name")]
pub struct ThingIdError {
    raw: String,
}

/// Namespaced, immutable thing identifier of the form `namespace:name`.
///
/// Used as the worker's addressing key and the event log's partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThingId {
    raw: String,
    split: usize,
}

impl ThingId {
    /// Build an id from its two parts.
    ///
    /// # Errors
    ///
    /// Returns [`ThingIdError`] if `name` is empty or `namespace` contains `:`.
    pub fn new(namespace: &str, name: &str) -> Result<Self, ThingIdError> {
        Self::parse(&format!("{namespace}:{name}"))
    }

    /// Parse `namespace:name`. The namespace may be empty, the name may not.
    ///
    /// # Errors
    ///
    /// Returns [`ThingIdError`] if there is no `:` or the name is empty.
    pub fn parse(raw: &str) -> Result<Self, ThingIdError> {
        match raw.find(':') {
            Some(split) if split + 1 < raw.len() => Ok(Self {
                raw: raw.to_owned(),
                split,
            }),
            _ => Err(ThingIdError {
                raw: raw.to_owned(),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.raw[..self.split]
    }

    pub fn name(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for ThingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ThingId {
    type Err = ThingIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ThingId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for ThingId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A feature of a thing: a named group of properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

impl Feature {
    pub fn with_properties(properties: Map<String, Value>) -> Self {
        Self {
            properties: Some(properties),
        }
    }
}

/// Materialized state of one thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thing {
    pub thing_id: ThingId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<BTreeMap<String, Feature>>,
}

impl Thing {
    /// An empty thing with no policy, attributes, or features.
    pub fn new(thing_id: ThingId) -> Self {
        Self {
            thing_id,
            policy_id: None,
            attributes: None,
            features: None,
        }
    }

    pub fn with_policy_id(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn with_feature(mut self, feature_id: impl Into<String>, feature: Feature) -> Self {
        self.features
            .get_or_insert_with(BTreeMap::new)
            .insert(feature_id.into(), feature);
        self
    }

    pub fn feature(&self, feature_id: &str) -> Option<&Feature> {
        self.features.as_ref()?.get(feature_id)
    }

    /// Render the thing as a JSON object, optionally projected by `selector`.
    pub fn to_json(&self, selector: Option<&FieldSelector>) -> Value {
        let full = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        match selector {
            Some(selector) => Value::Object(selector.apply(&full)),
            None => Value::Object(full),
        }
    }

    /// Fold one event into this thing, returning the next state.
    ///
    /// Lifecycle events (`ThingCreated`, `ThingDeleted`) are handled by
    /// [`apply_event`]. Here they leave the state unchanged.
    pub fn apply(mut self, event: &ThingEvent) -> Self {
        match event {
            ThingEvent::ThingCreated { .. } | ThingEvent::ThingDeleted => {}
            ThingEvent::PolicyIdModified { policy_id } => {
                self.policy_id = Some(policy_id.clone());
            }
            ThingEvent::AttributeCreated { pointer, value }
            | ThingEvent::AttributeModified { pointer, value } => {
                pointer.set(self.attributes.get_or_insert_with(Map::new), value.clone());
            }
            ThingEvent::AttributeDeleted { pointer } => {
                if let Some(attributes) = self.attributes.as_mut() {
                    pointer.remove(attributes);
                }
            }
            ThingEvent::AttributesDeleted => self.attributes = None,
            ThingEvent::FeatureCreated {
                feature_id,
                feature,
            }
            | ThingEvent::FeatureModified {
                feature_id,
                feature,
            } => {
                self.features
                    .get_or_insert_with(BTreeMap::new)
                    .insert(feature_id.clone(), feature.clone());
            }
            ThingEvent::FeatureDeleted { feature_id } => {
                if let Some(features) = self.features.as_mut() {
                    features.remove(feature_id);
                }
            }
            ThingEvent::FeaturePropertiesCreated {
                feature_id,
                properties,
            }
            | ThingEvent::FeaturePropertiesModified {
                feature_id,
                properties,
            } => {
                self.features
                    .get_or_insert_with(BTreeMap::new)
                    .entry(feature_id.clone())
                    .or_default()
                    .properties = Some(properties.clone());
            }
            ThingEvent::FeaturePropertiesDeleted { feature_id } => {
                if let Some(feature) = self
                    .features
                    .as_mut()
                    .and_then(|features| features.get_mut(feature_id))
                {
                    feature.properties = None;
                }
            }
        }
        self
    }
}

/// Fold one event into an optional thing.
///
/// `None` means the thing has no live state (never created, or deleted).
/// Sub-resource events against `None` materialize an empty thing first.
pub fn apply_event(state: Option<Thing>, thing_id: &ThingId, event: &ThingEvent) -> Option<Thing> {
    match event {
        ThingEvent::ThingCreated { thing } => Some(thing.clone()),
        ThingEvent::ThingDeleted => None,
        other => Some(
            state
                .unwrap_or_else(|| Thing::new(thing_id.clone()))
                .apply(other),
        ),
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use serde_json::json;

    pub(crate) fn room_id() -> ThingId {
        ThingId::parse("org.example:room-1").expect("valid fixture id")
    }

    pub(crate) fn thermostat() -> Feature {
        Feature::with_properties(
            json!({"target": 21.5})
                .as_object()
                .cloned()
                .expect("object fixture"),
        )
    }

    pub(crate) fn room() -> Thing {
        Thing::new(room_id())
            .with_policy_id("org.example:room-policy")
            .with_attributes(
                json!({"floor": 2})
                    .as_object()
                    .cloned()
                    .expect("object fixture"),
            )
    }
}

//! JSON pointers into thing attributes and field selectors for retrieval.
//!
//! Pointers use the `/a/b/c` form with `~0` / `~1` escaping. Operations
//! work on `serde_json::Map` objects because attributes and feature
//! properties are always JSON objects at their root.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// A parsed JSON pointer.
///
/// The empty pointer (`""` or `"/"`) addresses the root object itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct JsonPointer {
    segments: Vec<String>,
}

impl JsonPointer {
    /// The pointer addressing the root object.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a pointer. A missing leading slash is tolerated (`"a/b"` is `/a/b`).
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.strip_prefix('/').unwrap_or(raw);
        let segments = trimmed
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.replace("~1", "/").replace("~0", "~"))
            .collect();
        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The first segment, if any.
    pub fn first(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Look up the value this pointer addresses inside `object`.
    pub fn get<'a>(&self, object: &'a Map<String, Value>) -> Option<&'a Value> {
        let (first, rest) = self.segments.split_first()?;
        let mut current = object.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Whether `object` contains a value at this pointer.
    pub fn exists_in(&self, object: &Map<String, Value>) -> bool {
        self.get(object).is_some()
    }

    /// Set `value` at this pointer, creating intermediate objects and
    /// replacing non-object intermediates.
    ///
    /// Setting the root pointer is a no-op unless `value` is an object, in
    /// which case it replaces the whole map.
    pub fn set(&self, object: &mut Map<String, Value>, value: Value) {
        let Some((last, parents)) = self.segments.split_last() else {
            if let Value::Object(map) = value {
                *object = map;
            }
            return;
        };
        let mut current = object;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => return,
            };
        }
        current.insert(last.clone(), value);
    }

    /// Remove and return the value at this pointer.
    pub fn remove(&self, object: &mut Map<String, Value>) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = object;
        for segment in parents {
            current = current.get_mut(segment)?.as_object_mut()?;
        }
        current.remove(last)
    }
}

impl fmt::Display for JsonPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment.replace('~', "~0").replace('/', "~1"))?;
        }
        Ok(())
    }
}

impl FromStr for JsonPointer {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for JsonPointer {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl Serialize for JsonPointer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JsonPointer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// A set of pointers selecting which fields of a thing to return.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldSelector {
    pointers: Vec<JsonPointer>,
}

impl FieldSelector {
    /// Parse a comma separated selector such as `"thingId,attributes/location,_policy"`.
    pub fn parse(raw: &str) -> Self {
        let pointers = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(JsonPointer::parse)
            .collect();
        Self { pointers }
    }

    pub fn pointers(&self) -> &[JsonPointer] {
        &self.pointers
    }

    /// Whether any pointer's first segment equals `key`.
    pub fn selects_root(&self, key: &str) -> bool {
        self.pointers.iter().any(|p| p.first() == Some(key))
    }

    /// Project `object` down to the selected fields.
    ///
    /// Pointers that address nothing in `object` are skipped.
    pub fn apply(&self, object: &Map<String, Value>) -> Map<String, Value> {
        let mut selected = Map::new();
        for pointer in &self.pointers {
            if let Some(value) = pointer.get(object) {
                pointer.set(&mut selected, value.clone());
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("fixture must be an object")
    }

    #[test]
    fn parse_and_display() {
        let p = JsonPointer::parse("/location/lat");
        assert_eq!(p.segments(), ["location", "lat"]);
        assert_eq!(p.to_string(), "/location/lat");
        assert_eq!(JsonPointer::parse("location/lat"), p);
        assert!(JsonPointer::parse("/").is_root());
    }

    #[test]
    fn escaped_segments_roundtrip() {
        let p = JsonPointer::parse("/a~1b/c~0d");
        assert_eq!(p.segments(), ["a/b", "c~d"]);
        assert_eq!(p.to_string(), "/a~1b/c~0d");
    }

    #[test]
    fn get_nested_value() {
        let attrs = object(json!({"location": {"lat": 1.5}}));
        assert_eq!(
            JsonPointer::parse("/location/lat").get(&attrs),
            Some(&json!(1.5))
        );
        assert!(JsonPointer::parse("/location/lon").get(&attrs).is_none());
        assert!(JsonPointer::parse("/location/lat/x").get(&attrs).is_none());
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut attrs = Map::new();
        JsonPointer::parse("/a/b/c").set(&mut attrs, json!(3));
        assert_eq!(Value::Object(attrs), json!({"a": {"b": {"c": 3}}}));
    }

    #[test]
    fn set_replaces_scalar_intermediate() {
        let mut attrs = object(json!({"a": 1}));
        JsonPointer::parse("/a/b").set(&mut attrs, json!(true));
        assert_eq!(Value::Object(attrs), json!({"a": {"b": true}}));
    }

    #[test]
    fn remove_nested_value() {
        let mut attrs = object(json!({"a": {"b": 1, "c": 2}}));
        let removed = JsonPointer::parse("/a/b").remove(&mut attrs);
        assert_eq!(removed, Some(json!(1)));
        assert_eq!(Value::Object(attrs), json!({"a": {"c": 2}}));
    }

    #[test]
    fn remove_missing_returns_none() {
        let mut attrs = object(json!({"a": 1}));
        assert!(JsonPointer::parse("/b").remove(&mut attrs).is_none());
        assert!(JsonPointer::root().remove(&mut attrs).is_none());
    }

    #[test]
    fn selector_projects_fields() {
        let thing = object(json!({
            "thingId": "org.example:room-1",
            "attributes": {"floor": 2, "wing": "east"},
            "features": {}
        }));
        let selector = FieldSelector::parse("thingId, attributes/floor, _policy");
        let selected = selector.apply(&thing);
        assert_eq!(
            Value::Object(selected),
            json!({"thingId": "org.example:room-1", "attributes": {"floor": 2}})
        );
        assert!(selector.selects_root("_policy"));
        assert!(!selector.selects_root("features"));
    }

    #[test]
    fn pointer_serde_as_string() {
        let p = JsonPointer::parse("/temperature");
        let json = serde_json::to_string(&p).expect("serialize");
        assert_eq!(json, "\"/temperature\"");
        let back: JsonPointer = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, p);
    }
}

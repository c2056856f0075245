// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Variable documents.
//!
//! A document is a JSON object. It is carried as JSON text inside records and
//! snapshots because `bincode` cannot decode self-describing values.

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps a JSON value. Anything but an object (or null) is refused.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            Value::Null => Some(Self::new()),
            _ => None,
        }
    }

    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str::<Value>(text).ok().and_then(Self::from_value)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    /// Top-level merge; entries of `other` win.
    pub fn merge(&mut self, other: &Document) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Human-readable formats (JSON) see a plain object. Binary formats carry
/// the JSON text, since `bincode` cannot encode a self-describing `Value`.
impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            return self.0.serialize(serializer);
        }
        let text = serde_json::to_string(&self.0).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            return Map::deserialize(deserializer).map(Self);
        }
        let text = String::deserialize(deserializer)?;
        let map: Map<String, Value> = serde_json::from_str(&text).map_err(D::Error::custom)?;
        Ok(Self(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bincode_carries_json_text() {
        let doc = Document::from_value(json!({"order": {"id": 7, "items": [1, 2]}})).unwrap();
        let bytes = bincode::serde::encode_to_vec(&doc, bincode::config::standard()).unwrap();
        let (back, _): (Document, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_json_sees_an_object() {
        let doc = Document::from_value(json!({"a": 1})).unwrap();
        assert_eq!(serde_json::to_value(&doc).unwrap(), json!({"a": 1}));
        let back: Document = serde_json::from_value(json!({"a": 1})).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_only_objects_are_documents() {
        assert!(Document::from_value(json!([1, 2])).is_none());
        assert!(Document::from_value(json!(3)).is_none());
        assert_eq!(Document::from_value(json!(null)), Some(Document::new()));
    }

    #[test]
    fn test_merge_overrides() {
        let mut a = Document::from_value(json!({"x": 1, "y": 2})).unwrap();
        let b = Document::from_value(json!({"y": 3})).unwrap();
        a.merge(&b);
        assert_eq!(a.to_value(), json!({"x": 1, "y": 3}));
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! `$.a.b[0]` style paths into variable documents.

use std::fmt;

use serde_json::{Map, Value};

use super::Document;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathError(pub String);

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

impl JsonPath {
    pub fn parse(text: &str) -> Result<Self, PathError> {
        let text = text.trim();
        let mut rest = text
            .strip_prefix('$')
            .ok_or_else(|| PathError(format!("path '{text}' must start with '$'")))?;
        let mut segments = Vec::new();

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
                if end == 0 {
                    return Err(PathError(format!("empty name in path '{text}'")));
                }
                segments.push(Segment::Key(after[..end].to_string()));
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let end = after
                    .find(']')
                    .ok_or_else(|| PathError(format!("unclosed '[' in path '{text}'")))?;
                let index = after[..end]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| PathError(format!("invalid index in path '{text}'")))?;
                segments.push(Segment::Index(index));
                rest = &after[end + 1..];
            } else {
                return Err(PathError(format!("unexpected '{rest}' in path '{text}'")));
            }
        }

        Ok(Self { segments })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn get<'a>(&self, document: &'a Document) -> Option<&'a Value> {
        let mut segments = self.segments.iter();
        let mut current = match segments.next() {
            None => return None,
            Some(Segment::Key(name)) => document.get(name)?,
            Some(Segment::Index(_)) => return None,
        };
        for segment in segments {
            current = match (segment, current) {
                (Segment::Key(name), Value::Object(map)) => map.get(name)?,
                (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Like `get`, but `$` resolves to the whole document.
    pub fn resolve(&self, document: &Document) -> Option<Value> {
        if self.is_root() {
            Some(document.to_value())
        } else {
            self.get(document).cloned()
        }
    }

    /// Writes `value` at this path, creating intermediate objects. Only key
    /// segments can be targets; the root target merges an object.
    pub fn set(&self, document: &mut Document, value: Value) -> Result<(), PathError> {
        let Some((last, parents)) = self.segments.split_last() else {
            return match value {
                Value::Object(map) => {
                    document.merge(&Document::from(map));
                    Ok(())
                }
                other => Err(PathError(format!(
                    "cannot merge non-object value {other} into the root"
                ))),
            };
        };

        let mut current: &mut Map<String, Value> = document.as_map_mut();
        for segment in parents {
            let Segment::Key(name) = segment else {
                return Err(PathError(format!("cannot write through index in '{self}'")));
            };
            let slot = current
                .entry(name.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            current = match slot {
                Value::Object(map) => map,
                _ => return Err(PathError(format!("'{name}' is not an object"))),
            };
        }

        match last {
            Segment::Key(name) => {
                current.insert(name.clone(), value);
                Ok(())
            }
            Segment::Index(_) => Err(PathError(format!("cannot write to index in '{self}'"))),
        }
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for segment in &self.segments {
            match segment {
                Segment::Key(name) => write!(f, ".{name}")?,
                Segment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let path = JsonPath::parse("$.order.items[1].sku").unwrap();
        assert_eq!(path.to_string(), "$.order.items[1].sku");
        assert!(JsonPath::parse("$").unwrap().is_root());
        assert!(JsonPath::parse("order.id").is_err());
        assert!(JsonPath::parse("$.").is_err());
        assert!(JsonPath::parse("$.a[x]").is_err());
    }

    #[test]
    fn test_get() {
        let d = doc(json!({"order": {"items": [{"sku": "a"}, {"sku": "b"}]}}));
        let sku = JsonPath::parse("$.order.items[1].sku").unwrap();
        assert_eq!(sku.get(&d), Some(&json!("b")));
        assert_eq!(JsonPath::parse("$.order.missing").unwrap().get(&d), None);
        assert_eq!(JsonPath::parse("$.order.items[9]").unwrap().get(&d), None);
    }

    #[test]
    fn test_set_creates_objects() {
        let mut d = Document::new();
        JsonPath::parse("$.a.b.c").unwrap().set(&mut d, json!(1)).unwrap();
        assert_eq!(d.to_value(), json!({"a": {"b": {"c": 1}}}));

        JsonPath::parse("$").unwrap().set(&mut d, json!({"z": true})).unwrap();
        assert_eq!(d.get("z"), Some(&json!(true)));
        assert!(JsonPath::parse("$").unwrap().set(&mut d, json!(5)).is_err());
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Input and output variable mappings.

use serde::{Deserialize, Serialize};

use super::path::{JsonPath, PathError};
use super::{Document, ProcessingFailure};
use crate::record::ErrorType;

/// A mapping as written in a process model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub source: String,
    pub target: String,
}

impl Mapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMapping {
    pub source: JsonPath,
    pub target: JsonPath,
}

impl CompiledMapping {
    pub fn compile(mapping: &Mapping) -> Result<Self, PathError> {
        let target = JsonPath::parse(&mapping.target)?;
        if target
            .segments()
            .iter()
            .any(|s| matches!(s, super::path::Segment::Index(_)))
        {
            return Err(PathError(format!(
                "mapping target '{}' cannot contain an index",
                mapping.target
            )));
        }
        Ok(Self {
            source: JsonPath::parse(&mapping.source)?,
            target,
        })
    }
}

fn mapping_error(message: String) -> ProcessingFailure {
    ProcessingFailure::new(ErrorType::IoMappingError, message)
}

/// Builds a new document by copying each mapping's source into its target.
pub fn apply_mappings(
    mappings: &[CompiledMapping],
    source: &Document,
) -> Result<Document, ProcessingFailure> {
    let mut result = Document::new();
    for mapping in mappings {
        let value = mapping
            .source
            .resolve(source)
            .ok_or_else(|| mapping_error(format!("No data found for query {}.", mapping.source)))?;
        mapping
            .target
            .set(&mut result, value)
            .map_err(|e| mapping_error(e.0))?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(pairs: &[(&str, &str)]) -> Vec<CompiledMapping> {
        pairs
            .iter()
            .map(|(s, t)| CompiledMapping::compile(&Mapping::new(*s, *t)).unwrap())
            .collect()
    }

    #[test]
    fn test_apply_mappings() {
        let source = Document::from_value(json!({"order": {"id": 42, "total": 9.5}})).unwrap();
        let mapped = apply_mappings(
            &compile(&[("$.order.id", "$.orderId"), ("$.order", "$.copy.order")]),
            &source,
        )
        .unwrap();
        assert_eq!(
            mapped.to_value(),
            json!({"orderId": 42, "copy": {"order": {"id": 42, "total": 9.5}}})
        );
    }

    #[test]
    fn test_missing_source_is_mapping_error() {
        let source = Document::new();
        let err = apply_mappings(&compile(&[("$.nope", "$.x")]), &source).unwrap_err();
        assert_eq!(err.error_type, ErrorType::IoMappingError);
        assert_eq!(err.message, "No data found for query $.nope.");
    }

    #[test]
    fn test_root_source_and_target() {
        let source = Document::from_value(json!({"a": 1})).unwrap();
        let mapped = apply_mappings(&compile(&[("$", "$")]), &source).unwrap();
        assert_eq!(mapped, source);

        assert!(CompiledMapping::compile(&Mapping::new("$.a", "$.list[0]")).is_err());
    }
}

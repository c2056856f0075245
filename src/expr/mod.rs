// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Variables, conditions and mappings.
//!
//! Evaluation never panics and never aborts processing: failures come back
//! as [`ProcessingFailure`] and the element processor turns them into
//! incidents.

pub mod condition;
pub mod document;
pub mod mapping;
pub mod path;

use std::fmt;

use crate::record::ErrorType;

pub use condition::Condition;
pub use document::Document;
pub use mapping::{apply_mappings, CompiledMapping, Mapping};
pub use path::JsonPath;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingFailure {
    pub error_type: ErrorType,
    pub message: String,
}

impl ProcessingFailure {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProcessingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.error_type, self.message)
    }
}

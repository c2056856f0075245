// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The record model.
//!
//! A record is the unit of the partition log. Its metadata and value are
//! encoded separately with `bincode` and land in the metadata and value
//! sections of a log frame; position, source position, key and timestamp live
//! in the frame itself.
//!
//! # Invariants
//! - `metadata.intent.value_type() == value.value_type()`; decoding rejects
//!   anything else.
//! - Encoded metadata and values are never empty.

pub mod intent;
pub mod value;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

pub use intent::*;
pub use value::*;

/// Bumped whenever the encoding of metadata or values changes.
pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueType {
    Deployment,
    ProcessInstanceCreation,
    ProcessInstance,
    Job,
    JobBatch,
    Incident,
    Timer,
    Message,
    MessageSubscription,
    Variable,
    VariableDocument,
    Raft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionType {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    InvalidState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub record_type: RecordType,
    pub intent: Intent,
    pub rejection_type: Option<RejectionType>,
    pub rejection_reason: String,
    pub protocol_version: u16,
}

impl RecordMetadata {
    pub fn new(record_type: RecordType, intent: impl Into<Intent>) -> Self {
        Self {
            record_type,
            intent: intent.into(),
            rejection_type: None,
            rejection_reason: String::new(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn command(intent: impl Into<Intent>) -> Self {
        Self::new(RecordType::Command, intent)
    }

    pub fn event(intent: impl Into<Intent>) -> Self {
        Self::new(RecordType::Event, intent)
    }

    pub fn rejection(intent: Intent, rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        Self {
            record_type: RecordType::CommandRejection,
            intent,
            rejection_type: Some(rejection_type),
            rejection_reason: reason.into(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| KernelError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (metadata, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| KernelError::Decoding(e.to_string()))?;
        if metadata.protocol_version > PROTOCOL_VERSION {
            return Err(KernelError::UnsupportedProtocol(metadata.protocol_version));
        }
        Ok(metadata)
    }
}

impl RecordValue {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| KernelError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (value, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| KernelError::Decoding(e.to_string()))?;
        Ok(value)
    }
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRecord {
    pub position: i64,
    /// `-1` when the record was not produced by processing another record.
    pub source_position: i64,
    pub key: i64,
    pub timestamp: i64,
    pub metadata: RecordMetadata,
    pub value: RecordValue,
}

impl TypedRecord {
    /// Decodes the metadata and value sections of a frame.
    pub fn decode(
        position: i64,
        source_position: i64,
        key: i64,
        timestamp: i64,
        metadata: &[u8],
        value: &[u8],
    ) -> Result<Self> {
        let metadata = RecordMetadata::decode(metadata)?;
        let value = RecordValue::decode(value)?;
        if metadata.intent.value_type() != value.value_type() {
            return Err(KernelError::Decoding(format!(
                "intent {:?} does not match value type {:?}",
                metadata.intent,
                value.value_type()
            )));
        }
        Ok(Self {
            position,
            source_position,
            key,
            timestamp,
            metadata,
            value,
        })
    }

    pub fn record_type(&self) -> RecordType {
        self.metadata.record_type
    }

    pub fn intent(&self) -> Intent {
        self.metadata.intent
    }

    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }

    pub fn is_command(&self) -> bool {
        self.metadata.record_type == RecordType::Command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_mismatched_value() {
        let metadata = RecordMetadata::command(JobIntent::Complete).encode().unwrap();
        let value = RecordValue::from(TimerRecord {
            element_instance_key: 1,
            process_instance_key: 1,
            process_definition_key: 1,
            target_element_id: "t".into(),
            due_date: 10,
        })
        .encode()
        .unwrap();

        let err = TypedRecord::decode(1, -1, 1, 0, &metadata, &value).unwrap_err();
        assert!(matches!(err, KernelError::Decoding(_)));
    }

    #[test]
    fn test_encoded_sections_are_never_empty() {
        let metadata = RecordMetadata::event(RaftIntent::InitialEntry).encode().unwrap();
        let value = RecordValue::from(RaftRecord::default()).encode().unwrap();
        assert!(!metadata.is_empty());
        assert!(!value.is_empty());

        let record = TypedRecord::decode(7, -1, -1, 0, &metadata, &value).unwrap();
        assert_eq!(record.value_type(), ValueType::Raft);
        assert_eq!(record.position, 7);
    }

    #[test]
    fn test_future_protocol_version_is_refused() {
        let mut metadata = RecordMetadata::command(DeploymentIntent::Create);
        metadata.protocol_version = PROTOCOL_VERSION + 1;
        let bytes = metadata.encode().unwrap();
        assert!(matches!(
            RecordMetadata::decode(&bytes),
            Err(KernelError::UnsupportedProtocol(_))
        ));
    }
}

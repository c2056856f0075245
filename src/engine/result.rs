// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! What processing a record produces.

use crate::record::{Intent, RecordMetadata, RecordType, RecordValue, RejectionType};

/// A record to append after the one being processed. Its source position
/// is the processed record's position.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUpRecord {
    pub key: i64,
    pub metadata: RecordMetadata,
    pub value: RecordValue,
    pub skip_processing: bool,
}

impl FollowUpRecord {
    pub fn intent(&self) -> Intent {
        self.metadata.intent
    }

    pub fn record_type(&self) -> RecordType {
        self.metadata.record_type
    }
}

/// The answer for whoever submitted the command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub key: i64,
    pub record_type: RecordType,
    pub intent: Intent,
    pub rejection: Option<(RejectionType, String)>,
    pub value: RecordValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingResult {
    records: Vec<FollowUpRecord>,
    response: Option<CommandResponse>,
}

impl ProcessingResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_event(&mut self, key: i64, intent: impl Into<Intent>, value: impl Into<RecordValue>) {
        self.records.push(FollowUpRecord {
            key,
            metadata: RecordMetadata::event(intent),
            value: value.into(),
            skip_processing: false,
        });
    }

    /// Informational events are replayed and exported but never dispatched.
    pub fn append_informational(&mut self, key: i64, intent: impl Into<Intent>, value: impl Into<RecordValue>) {
        self.records.push(FollowUpRecord {
            key,
            metadata: RecordMetadata::event(intent),
            value: value.into(),
            skip_processing: true,
        });
    }

    pub fn append_command(&mut self, key: i64, intent: impl Into<Intent>, value: impl Into<RecordValue>) {
        self.records.push(FollowUpRecord {
            key,
            metadata: RecordMetadata::command(intent),
            value: value.into(),
            skip_processing: false,
        });
    }

    pub fn append_rejection(
        &mut self,
        key: i64,
        intent: Intent,
        value: RecordValue,
        rejection_type: RejectionType,
        reason: &str,
    ) {
        self.records.push(FollowUpRecord {
            key,
            metadata: RecordMetadata::rejection(intent, rejection_type, reason),
            value,
            skip_processing: true,
        });
    }

    pub fn extend(&mut self, other: ProcessingResult) {
        self.records.extend(other.records);
    }

    pub fn respond(&mut self, response: CommandResponse) {
        self.response = Some(response);
    }

    /// Responds with an already appended follow-up.
    pub fn respond_with_last(&mut self) {
        if let Some(last) = self.records.last() {
            self.response = Some(CommandResponse {
                key: last.key,
                record_type: last.metadata.record_type,
                intent: last.metadata.intent,
                rejection: last
                    .metadata
                    .rejection_type
                    .map(|t| (t, last.metadata.rejection_reason.clone())),
                value: last.value.clone(),
            });
        }
    }

    pub fn records(&self) -> &[FollowUpRecord] {
        &self.records
    }

    pub fn response(&self) -> Option<&CommandResponse> {
        self.response.as_ref()
    }

    pub fn take(&mut self) -> (Vec<FollowUpRecord>, Option<CommandResponse>) {
        (std::mem::take(&mut self.records), self.response.take())
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.response = None;
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Records in and out of log frames.

use brook_kernel::engine::FollowUpRecord;
use brook_kernel::record::{Intent, RecordMetadata, RecordValue};
use brook_kernel::{KernelError, TypedRecord};
use brook_logstream::{LogAppendEntry, LoggedEntry};

/// A record written by a client or a scheduler, not by processing.
pub fn command_entry(key: i64, intent: impl Into<Intent>, value: impl Into<RecordValue>) -> Result<LogAppendEntry, KernelError> {
    let metadata = RecordMetadata::command(intent);
    let value = value.into();
    Ok(LogAppendEntry::new(key, metadata.encode()?, value.encode()?))
}

pub fn event_entry(key: i64, intent: impl Into<Intent>, value: impl Into<RecordValue>) -> Result<LogAppendEntry, KernelError> {
    let metadata = RecordMetadata::event(intent);
    let value = value.into();
    Ok(LogAppendEntry::new(key, metadata.encode()?, value.encode()?))
}

pub fn follow_up_entry(record: &FollowUpRecord) -> Result<LogAppendEntry, KernelError> {
    let entry = LogAppendEntry::new(record.key, record.metadata.encode()?, record.value.encode()?);
    Ok(if record.skip_processing { entry.skipped() } else { entry })
}

pub fn decode(entry: &LoggedEntry) -> Result<TypedRecord, KernelError> {
    TypedRecord::decode(
        entry.position,
        entry.source_position,
        entry.key,
        entry.timestamp,
        entry.metadata(),
        entry.value(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use brook_kernel::record::{DeploymentIntent, DeploymentRecord, RecordType, ValueType};
    use brook_logstream::{LogStream, MemoryLogStorage};
    use std::sync::Arc;

    #[test]
    fn test_command_survives_the_log() {
        let mut log = LogStream::open(Arc::new(MemoryLogStorage::new()), 1).unwrap();
        let entry = command_entry(-1, DeploymentIntent::Create, DeploymentRecord::default()).unwrap();
        log.append(&[entry], -1, 1_000, 1).unwrap();

        let logged = log.entry_at(1).unwrap().unwrap();
        let record = decode(&logged).unwrap();
        assert_eq!(record.position, 1);
        assert_eq!(record.source_position, -1);
        assert_eq!(record.timestamp, 1_000);
        assert_eq!(record.record_type(), RecordType::Command);
        assert_eq!(record.value_type(), ValueType::Deployment);
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Entry serialization and position sequencing.
//!
//! A batch of [`LogAppendEntry`] values is turned into a single block of
//! aligned frames with a contiguous range of positions. Validation happens
//! for the whole batch before the first byte is written: a rejected batch
//! never leaves a partial frame behind.

use crate::error::{LogStreamError, Result};
use crate::frame::{self, FrameFields, FLAG_SKIP_PROCESSING};

/// An entry as handed to the log by a writer, before it has a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAppendEntry {
    pub key: i64,
    /// Index of an earlier entry of the same batch that caused this one.
    pub source_index: Option<usize>,
    pub skip_processing: bool,
    pub metadata: Vec<u8>,
    pub value: Vec<u8>,
}

impl LogAppendEntry {
    pub fn new(key: i64, metadata: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            source_index: None,
            skip_processing: false,
            metadata,
            value,
        }
    }

    pub fn with_source_index(mut self, index: usize) -> Self {
        self.source_index = Some(index);
        self
    }

    pub fn skipped(mut self) -> Self {
        self.skip_processing = true;
        self
    }

    pub fn framed_length(&self) -> usize {
        frame::framed_length(self.metadata.len(), self.value.len())
    }
}

fn validate_entry(entry: &LogAppendEntry) -> Result<()> {
    if entry.value.is_empty() {
        return Err(LogStreamError::Validation("value length must be greater than 0".into()));
    }
    if entry.metadata.is_empty() {
        return Err(LogStreamError::Validation("metadata length must be greater than 0".into()));
    }
    if entry.metadata.len() > u16::MAX as usize {
        return Err(LogStreamError::Validation(format!(
            "metadata length {} exceeds {}",
            entry.metadata.len(),
            u16::MAX
        )));
    }
    Ok(())
}

fn validate_fields(position: i64, timestamp: i64) -> Result<()> {
    if position < 0 {
        return Err(LogStreamError::Validation(format!("position {position} must be >= 0")));
    }
    if timestamp < 0 {
        return Err(LogStreamError::Validation(format!("timestamp {timestamp} must be >= 0")));
    }
    Ok(())
}

/// Serializes one entry at `offset` and returns its unpadded framed length.
///
/// The buffer must have room for the aligned frame; a buffer that is too
/// small is reported like any other invalid argument.
pub fn serialize(
    buf: &mut [u8],
    offset: usize,
    entry: &LogAppendEntry,
    position: i64,
    source_position: i64,
    timestamp: i64,
    raft_term: i32,
) -> Result<usize> {
    validate_entry(entry)?;
    validate_fields(position, timestamp)?;

    let aligned = frame::aligned_length(entry.framed_length());
    if offset > buf.len() || buf.len() - offset < aligned {
        return Err(LogStreamError::Validation(format!(
            "buffer of {} bytes cannot hold a {} byte frame at offset {}",
            buf.len(),
            aligned,
            offset
        )));
    }

    let fields = FrameFields {
        position,
        source_position,
        key: entry.key,
        timestamp,
        raft_term,
        flags: if entry.skip_processing { FLAG_SKIP_PROCESSING } else { 0 },
    };
    Ok(frame::write_frame(&mut buf[offset..], &fields, &entry.metadata, &entry.value))
}

/// Bytes needed for the whole batch including alignment padding.
pub fn batch_length(entries: &[LogAppendEntry]) -> usize {
    entries
        .iter()
        .map(|e| frame::aligned_length(e.framed_length()))
        .sum()
}

/// Frames a batch with positions `first_position..`.
///
/// `source_index` links resolve to the position of the referenced entry when
/// it precedes the current one; everything else inherits
/// `batch_source_position`.
pub fn serialize_batch(
    entries: &[LogAppendEntry],
    first_position: i64,
    batch_source_position: i64,
    timestamp: i64,
    raft_term: i32,
) -> Result<Vec<u8>> {
    if entries.is_empty() {
        return Err(LogStreamError::Validation("batch must contain at least one entry".into()));
    }
    for entry in entries {
        validate_entry(entry)?;
    }
    validate_fields(first_position, timestamp)?;

    let mut block = vec![0u8; batch_length(entries)];
    let mut offset = 0;

    for (index, entry) in entries.iter().enumerate() {
        let position = first_position + index as i64;
        let source_position = match entry.source_index {
            Some(source) if source < index => first_position + source as i64,
            _ => batch_source_position,
        };

        let framed = serialize(&mut block, offset, entry, position, source_position, timestamp, raft_term)?;
        offset += frame::aligned_length(framed);
    }

    Ok(block)
}

/// A block ready to be handed to storage.
#[derive(Debug, Clone)]
pub struct SequencedBatch {
    pub first_position: i64,
    pub last_position: i64,
    pub block: Vec<u8>,
}

/// Hands out contiguous position ranges. Owned by the single log writer.
#[derive(Debug)]
pub struct Sequencer {
    next_position: i64,
}

impl Sequencer {
    /// `last_position` is the highest position already in the log (0 if empty).
    pub fn new(last_position: i64) -> Self {
        Self {
            next_position: last_position + 1,
        }
    }

    pub fn next_position(&self) -> i64 {
        self.next_position
    }

    pub fn sequence(
        &mut self,
        entries: &[LogAppendEntry],
        source_position: i64,
        timestamp: i64,
        raft_term: i32,
    ) -> Result<SequencedBatch> {
        let first_position = self.next_position;
        let block = serialize_batch(entries, first_position, source_position, timestamp, raft_term)?;
        let last_position = first_position + entries.len() as i64 - 1;
        self.next_position = last_position + 1;

        Ok(SequencedBatch {
            first_position,
            last_position,
            block,
        })
    }

    /// Rewinds after the log was truncated or extended by replication.
    pub fn reset(&mut self, last_position: i64) {
        self.next_position = last_position + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameIter;

    fn entry(key: i64) -> LogAppendEntry {
        LogAppendEntry::new(key, vec![1, 2], vec![3, 4, 5])
    }

    #[test]
    fn test_empty_value_rejected_before_write() {
        let mut buf = vec![0xAAu8; 128];
        let bad = LogAppendEntry::new(1, vec![1], vec![]);
        let result = serialize(&mut buf, 0, &bad, 1, -1, 0, 1);
        assert!(matches!(result, Err(LogStreamError::Validation(_))));
        assert!(buf.iter().all(|b| *b == 0xAA), "no byte may be written");
    }

    #[test]
    fn test_empty_metadata_rejected_before_write() {
        let mut buf = vec![0xAAu8; 128];
        let bad = LogAppendEntry::new(1, vec![], vec![1]);
        assert!(matches!(
            serialize(&mut buf, 0, &bad, 1, -1, 0, 1),
            Err(LogStreamError::Validation(_))
        ));
        assert!(buf.iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn test_negative_position_and_timestamp() {
        let mut buf = vec![0u8; 128];
        assert!(serialize(&mut buf, 0, &entry(1), -1, -1, 0, 1).is_err());
        assert!(serialize(&mut buf, 0, &entry(1), 1, -1, -5, 1).is_err());
    }

    #[test]
    fn test_buffer_too_small() {
        let mut buf = vec![0u8; 16];
        assert!(matches!(
            serialize(&mut buf, 0, &entry(1), 1, -1, 0, 1),
            Err(LogStreamError::Validation(_))
        ));
        assert!(serialize(&mut buf, 64, &entry(1), 1, -1, 0, 1).is_err());
    }

    #[test]
    fn test_batch_with_invalid_entry_writes_nothing() {
        let entries = vec![entry(1), LogAppendEntry::new(2, vec![1], vec![])];
        assert!(serialize_batch(&entries, 1, -1, 0, 1).is_err());
    }

    #[test]
    fn test_batch_alignment_and_source_positions() {
        let entries = vec![
            entry(1),
            entry(2).with_source_index(0),
            // refers forward: falls back to the batch source position
            entry(3).with_source_index(3),
            entry(4).with_source_index(1),
        ];

        let block = serialize_batch(&entries, 10, 5, 99, 2).unwrap();
        assert_eq!(block.len() % frame::ALIGNMENT, 0);

        let decoded: Vec<_> = FrameIter::new(&block).collect::<Result<_>>().unwrap();
        let positions: Vec<_> = decoded.iter().map(|e| e.position).collect();
        let sources: Vec<_> = decoded.iter().map(|e| e.source_position).collect();

        assert_eq!(positions, vec![10, 11, 12, 13]);
        assert_eq!(sources, vec![5, 10, 5, 11]);
        assert!(decoded.iter().all(|e| e.address % frame::ALIGNMENT as u64 == 0));
    }

    #[test]
    fn test_sequencer_contiguous() {
        let mut sequencer = Sequencer::new(0);
        let a = sequencer.sequence(&[entry(1), entry(2)], -1, 0, 1).unwrap();
        let b = sequencer.sequence(&[entry(3)], -1, 0, 1).unwrap();
        assert_eq!((a.first_position, a.last_position), (1, 2));
        assert_eq!((b.first_position, b.last_position), (3, 3));
        assert_eq!(sequencer.next_position(), 4);

        // A failed batch does not consume positions
        assert!(sequencer.sequence(&[], -1, 0, 1).is_err());
        assert_eq!(sequencer.next_position(), 4);
    }
}

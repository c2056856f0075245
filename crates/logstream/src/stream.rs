// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The per-partition log stream.
//!
//! # Architecture
//! - `LogStorage` = durable bytes (segments or blocks)
//! - `LogStream` = single writer: sequencing, position index, truncation
//! - `LogStreamReader` = any number of lazy readers sharing the index
//!
//! # Invariants
//! - positions are contiguous and strictly increasing
//! - the commit position never moves backwards
//! - nothing at or below the commit position is ever truncated

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{LogStreamError, Result};
use crate::frame::{FrameIter, LoggedEntry};
use crate::reader::LogStreamReader;
use crate::serializer::{LogAppendEntry, Sequencer};
use crate::storage::{Address, LogStorage};

/// State shared between the writer and its readers.
pub(crate) struct Shared {
    index: RwLock<BTreeMap<i64, Address>>,
    first_position: AtomicI64,
    last_position: AtomicI64,
    commit_position: AtomicI64,
    /// Bumped on every truncation so readers drop buffered entries.
    epoch: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            index: RwLock::new(BTreeMap::new()),
            first_position: AtomicI64::new(1),
            last_position: AtomicI64::new(0),
            commit_position: AtomicI64::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    pub(crate) fn floor_address(&self, position: i64) -> Option<Address> {
        let index = self.index.read().ok()?;
        index
            .range(..=position)
            .next_back()
            .or_else(|| index.iter().next())
            .map(|(_, address)| *address)
    }

    pub(crate) fn first_position(&self) -> i64 {
        self.first_position.load(Ordering::Acquire)
    }

    pub(crate) fn last_position(&self) -> i64 {
        self.last_position.load(Ordering::Acquire)
    }

    pub(crate) fn commit_position(&self) -> i64 {
        self.commit_position.load(Ordering::Acquire)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn insert(&self, position: i64, address: Address) {
        if let Ok(mut index) = self.index.write() {
            index.insert(position, address);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub first_position: i64,
    pub last_position: i64,
}

/// Raw frames read back for replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    pub first_position: i64,
    pub last_position: i64,
    pub bytes: Vec<u8>,
    pub more_available: bool,
}

pub struct LogStream {
    partition_id: u32,
    storage: Arc<dyn LogStorage>,
    shared: Arc<Shared>,
    sequencer: Sequencer,
    last_term: i32,
}

impl LogStream {
    /// Opens the stream and rebuilds the position index from storage.
    pub fn open(storage: Arc<dyn LogStorage>, partition_id: u32) -> Result<Self> {
        let shared = Arc::new(Shared::new());
        let mut reader = LogStreamReader::new(storage.clone(), shared.clone(), false);

        let mut previous: Option<i64> = None;
        let mut last_indexed = None;
        let mut last_term = 0;

        for entry in &mut reader {
            let entry = entry?;
            match previous {
                None => shared.first_position.store(entry.position, Ordering::Release),
                Some(p) if entry.position != p + 1 => {
                    return Err(LogStreamError::NonContiguous {
                        expected: p + 1,
                        found: entry.position,
                    });
                }
                Some(_) => {}
            }
            if last_indexed != Some(entry.address) {
                shared.insert(entry.position, entry.address);
                last_indexed = Some(entry.address);
            }
            previous = Some(entry.position);
            last_term = entry.raft_term;
        }

        let last_position = previous.unwrap_or(0);
        shared.last_position.store(last_position, Ordering::Release);

        tracing::info!(
            "Opened log stream for partition {} (positions {}..={}, term {})",
            partition_id,
            shared.first_position(),
            last_position,
            last_term
        );

        Ok(Self {
            partition_id,
            storage,
            shared,
            sequencer: Sequencer::new(last_position),
            last_term,
        })
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn first_position(&self) -> i64 {
        self.shared.first_position()
    }

    /// Highest position in the log, 0 if empty.
    pub fn last_position(&self) -> i64 {
        self.shared.last_position()
    }

    pub fn last_term(&self) -> i32 {
        self.last_term
    }

    pub fn commit_position(&self) -> i64 {
        self.shared.commit_position()
    }

    /// Advances the commit position; lower values are ignored.
    /// Returns true if the position moved.
    pub fn set_commit_position(&self, position: i64) -> bool {
        let position = position.min(self.last_position());
        self.shared.commit_position.fetch_max(position, Ordering::AcqRel) < position
    }

    pub fn storage(&self) -> &Arc<dyn LogStorage> {
        &self.storage
    }

    fn index_block(&self, block: &[u8], address: Address) -> Result<(i64, i64, i32)> {
        let byte_addressable = self.storage.is_byte_addressable();
        let mut first = None;
        let mut last = 0;
        let mut term = self.last_term;

        for entry in FrameIter::at(block, address, byte_addressable) {
            let entry = entry?;
            if byte_addressable || first.is_none() {
                self.shared.insert(entry.position, entry.address);
            }
            first.get_or_insert(entry.position);
            last = entry.position;
            term = entry.raft_term;
        }
        Ok((first.unwrap_or(last), last, term))
    }

    fn publish_appended(&mut self, last_position: i64, term: i32) {
        if self.shared.last_position() == 0 {
            self.shared.first_position.store(
                self.shared
                    .index
                    .read()
                    .ok()
                    .and_then(|i| i.keys().next().copied())
                    .unwrap_or(1),
                Ordering::Release,
            );
        }
        self.shared.last_position.store(last_position, Ordering::Release);
        self.sequencer.reset(last_position);
        self.last_term = term;
    }

    /// Leader path: sequences and appends a batch written in `term`.
    pub fn append(
        &mut self,
        entries: &[LogAppendEntry],
        source_position: i64,
        timestamp: i64,
        term: i32,
    ) -> Result<AppendResult> {
        if term < self.last_term {
            return Err(LogStreamError::Validation(format!(
                "term {term} is older than the last term {} in the log",
                self.last_term
            )));
        }

        let batch = self.sequencer.sequence(entries, source_position, timestamp, term)?;
        let address = match self.storage.append(&batch.block) {
            Ok(address) => address,
            Err(e) => {
                self.sequencer.reset(self.last_position());
                return Err(e);
            }
        };

        self.index_block(&batch.block, address)?;
        self.publish_appended(batch.last_position, term);

        tracing::trace!(
            "Appended positions {}..={} to partition {}",
            batch.first_position,
            batch.last_position,
            self.partition_id
        );

        Ok(AppendResult {
            first_position: batch.first_position,
            last_position: batch.last_position,
        })
    }

    /// Follower path: appends frames produced by another replica unchanged.
    pub fn append_block(&mut self, block: &[u8]) -> Result<AppendResult> {
        let mut expected = self.last_position() + 1;
        let mut term = self.last_term;
        let mut count = 0;

        for entry in FrameIter::new(block) {
            let entry = entry?;
            if entry.position != expected {
                return Err(LogStreamError::NonContiguous {
                    expected,
                    found: entry.position,
                });
            }
            if entry.raft_term < term {
                return Err(LogStreamError::Validation(format!(
                    "entry {} has term {} older than {}",
                    entry.position, entry.raft_term, term
                )));
            }
            term = entry.raft_term;
            expected += 1;
            count += 1;
        }
        if count == 0 {
            return Err(LogStreamError::Validation("replicated block is empty".into()));
        }

        let address = self.storage.append(block)?;
        let (first, last, term) = self.index_block(block, address)?;
        self.publish_appended(last, term);

        Ok(AppendResult {
            first_position: first,
            last_position: last,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    /// Drops every entry after `position`.
    pub fn truncate_after(&mut self, position: i64) -> Result<()> {
        let commit_position = self.commit_position();
        if position < commit_position {
            return Err(LogStreamError::TruncateCommitted {
                position,
                commit_position,
            });
        }
        if position >= self.last_position() {
            return Ok(());
        }

        let target = position + 1;
        let mut reader = self.new_reader();
        let start = self
            .shared
            .index
            .read()
            .ok()
            .and_then(|i| i.range(..=target).next_back().map(|(p, _)| *p))
            .unwrap_or_else(|| self.first_position());
        reader.seek(start);

        // Frames of the same block that precede the cut (block storages only).
        let mut kept: Vec<LoggedEntry> = Vec::new();
        let mut cut = None;
        for entry in reader {
            let entry = entry?;
            if entry.position == target {
                cut = Some(entry.address);
                break;
            }
            if kept.last().map_or(true, |k| k.address == entry.address) {
                kept.push(entry);
            } else {
                kept = vec![entry];
            }
        }
        let cut = cut.ok_or(LogStreamError::InvalidAddress(0))?;
        kept.retain(|k| k.address == cut);

        self.storage.truncate(cut)?;
        if let Ok(mut index) = self.shared.index.write() {
            index.split_off(&(if kept.is_empty() { target } else { kept[0].position }));
        }

        if !kept.is_empty() {
            let block: Vec<u8> = kept.iter().flat_map(|k| k.frame_bytes().iter().copied()).collect();
            let address = self.storage.append(&block)?;
            self.shared.insert(kept[0].position, address);
        }

        self.shared.last_position.store(position, Ordering::Release);
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        self.sequencer.reset(position);
        self.last_term = self.term_at(position)?.unwrap_or(0);

        tracing::warn!(
            "Truncated partition {} log after position {}",
            self.partition_id,
            position
        );
        Ok(())
    }

    /// Term of the entry at `position`; position 0 is the empty-log anchor.
    pub fn term_at(&self, position: i64) -> Result<Option<i32>> {
        if position == 0 {
            return Ok(Some(0));
        }
        Ok(self.entry_at(position)?.map(|e| e.raft_term))
    }

    pub fn entry_at(&self, position: i64) -> Result<Option<LoggedEntry>> {
        if position < self.first_position() || position > self.last_position() {
            return Ok(None);
        }
        let mut reader = self.new_reader();
        reader.seek(position);
        match reader.next() {
            Some(Ok(entry)) if entry.position == position => Ok(Some(entry)),
            Some(Err(e)) => Err(e),
            _ => Ok(None),
        }
    }

    /// Raw frames from `from_position`, at most `max_bytes` (but at least one
    /// frame when any is available).
    pub fn read_frames(&self, from_position: i64, max_bytes: usize, committed_only: bool) -> Result<Option<FrameBatch>> {
        let limit = if committed_only {
            self.commit_position()
        } else {
            self.last_position()
        };
        if from_position > limit {
            return Ok(None);
        }

        let mut reader = self.new_reader();
        reader.seek(from_position);

        let mut bytes = Vec::new();
        let mut first = None;
        let mut last = 0;
        for entry in reader {
            let entry = entry?;
            if entry.position > limit {
                break;
            }
            let frame = entry.frame_bytes();
            if first.is_some() && bytes.len() + frame.len() > max_bytes {
                break;
            }
            bytes.extend_from_slice(frame);
            first.get_or_insert(entry.position);
            last = entry.position;
        }

        Ok(first.map(|first_position| FrameBatch {
            first_position,
            last_position: last,
            bytes,
            more_available: last < limit,
        }))
    }

    /// Releases storage for entries strictly before `position` where possible.
    pub fn compact(&mut self, position: i64) -> Result<()> {
        let Some(address) = self.shared.floor_address(position) else {
            return Ok(());
        };
        let new_first = self.storage.compact(address)?;

        if let (Some(new_first), Ok(mut index)) = (new_first, self.shared.index.write()) {
            let first_kept = index
                .iter()
                .find(|(_, a)| **a >= new_first)
                .map(|(p, _)| *p);
            if let Some(first_kept) = first_kept {
                *index = index.split_off(&first_kept);
                self.shared.first_position.store(first_kept, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Reader over everything in the log, including uncommitted entries.
    pub fn new_reader(&self) -> LogStreamReader {
        LogStreamReader::new(self.storage.clone(), self.shared.clone(), false)
    }

    /// Reader that never returns entries above the commit position.
    pub fn new_committed_reader(&self) -> LogStreamReader {
        LogStreamReader::new(self.storage.clone(), self.shared.clone(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileLogStorage, MemoryLogStorage};
    use tempfile::tempdir;

    fn entries(n: usize) -> Vec<LogAppendEntry> {
        (0..n)
            .map(|i| LogAppendEntry::new(i as i64, vec![0xAB; 3], vec![i as u8 + 1; 10]))
            .collect()
    }

    fn positions(reader: LogStreamReader) -> Vec<i64> {
        reader.map(|e| e.unwrap().position).collect()
    }

    fn storages() -> Vec<(Arc<dyn LogStorage>, Option<tempfile::TempDir>)> {
        let dir = tempdir().unwrap();
        vec![
            (Arc::new(MemoryLogStorage::new()) as Arc<dyn LogStorage>, None),
            (Arc::new(FileLogStorage::open(dir.path()).unwrap()), Some(dir)),
        ]
    }

    #[test]
    fn test_positions_are_contiguous() {
        for (storage, _dir) in storages() {
            let mut stream = LogStream::open(storage, 1).unwrap();
            let a = stream.append(&entries(3), -1, 10, 1).unwrap();
            let b = stream.append(&entries(2), 2, 11, 1).unwrap();

            assert_eq!((a.first_position, a.last_position), (1, 3));
            assert_eq!((b.first_position, b.last_position), (4, 5));
            assert_eq!(positions(stream.new_reader()), vec![1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn test_committed_reader_stops_at_commit_and_resumes() {
        for (storage, _dir) in storages() {
            let mut stream = LogStream::open(storage, 1).unwrap();
            stream.append(&entries(4), -1, 0, 1).unwrap();

            let mut reader = stream.new_committed_reader();
            assert!(reader.next().is_none());
            assert!(!reader.has_next());

            stream.set_commit_position(2);
            assert!(reader.has_next());
            assert_eq!(reader.next().unwrap().unwrap().position, 1);
            assert_eq!(reader.next().unwrap().unwrap().position, 2);
            assert!(reader.next().is_none());

            stream.set_commit_position(4);
            assert_eq!(reader.next().unwrap().unwrap().position, 3);
        }
    }

    #[test]
    fn test_commit_position_is_monotonic() {
        let mut stream = LogStream::open(Arc::new(MemoryLogStorage::new()), 1).unwrap();
        stream.append(&entries(5), -1, 0, 1).unwrap();

        assert!(stream.set_commit_position(4));
        assert!(!stream.set_commit_position(2));
        assert_eq!(stream.commit_position(), 4);
        // Never beyond the last position
        stream.set_commit_position(100);
        assert_eq!(stream.commit_position(), 5);
    }

    #[test]
    fn test_seek() {
        for (storage, _dir) in storages() {
            let mut stream = LogStream::open(storage, 1).unwrap();
            stream.append(&entries(3), -1, 0, 1).unwrap();
            stream.append(&entries(3), -1, 0, 1).unwrap();

            let mut reader = stream.new_reader();
            assert!(reader.seek(5));
            assert_eq!(positions(reader), vec![5, 6]);

            let mut reader = stream.new_reader();
            assert!(!reader.seek(42));
            assert!(reader.next().is_none());

            let mut reader = stream.new_reader();
            reader.seek_to_end();
            assert!(reader.next().is_none());
            stream.append(&entries(1), -1, 0, 1).unwrap();
            assert_eq!(reader.next().unwrap().unwrap().position, 7);
        }
    }

    #[test]
    fn test_truncate_mid_block_and_reappend() {
        for (storage, _dir) in storages() {
            let mut stream = LogStream::open(storage, 1).unwrap();
            stream.append(&entries(5), -1, 0, 1).unwrap();
            stream.set_commit_position(2);

            assert!(matches!(
                stream.truncate_after(1),
                Err(LogStreamError::TruncateCommitted { .. })
            ));

            stream.truncate_after(3).unwrap();
            assert_eq!(stream.last_position(), 3);
            assert_eq!(positions(stream.new_reader()), vec![1, 2, 3]);

            let next = stream.append(&entries(1), -1, 0, 2).unwrap();
            assert_eq!(next.first_position, 4);
            assert_eq!(stream.term_at(4).unwrap(), Some(2));
            assert_eq!(stream.term_at(3).unwrap(), Some(1));
            assert_eq!(positions(stream.new_reader()), vec![1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_reader_repositions_after_truncation() {
        let mut stream = LogStream::open(Arc::new(MemoryLogStorage::new()), 1).unwrap();
        stream.append(&entries(4), -1, 0, 1).unwrap();

        let mut reader = stream.new_reader();
        assert_eq!(reader.next().unwrap().unwrap().position, 1);

        stream.truncate_after(2).unwrap();
        stream.append(&entries(1), -1, 0, 2).unwrap();

        let rest: Vec<_> = reader.map(|e| e.unwrap()).collect();
        assert_eq!(rest.iter().map(|e| e.position).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(rest[1].raft_term, 2);
    }

    #[test]
    fn test_reopen_rebuilds_index() {
        let dir = tempdir().unwrap();
        {
            let storage = Arc::new(FileLogStorage::open(dir.path()).unwrap());
            let mut stream = LogStream::open(storage, 1).unwrap();
            stream.append(&entries(3), -1, 0, 1).unwrap();
            stream.append(&entries(2), -1, 0, 3).unwrap();
            stream.flush().unwrap();
        }

        let storage = Arc::new(FileLogStorage::open(dir.path()).unwrap());
        let mut stream = LogStream::open(storage, 1).unwrap();
        assert_eq!(stream.last_position(), 5);
        assert_eq!(stream.last_term(), 3);
        assert_eq!(stream.append(&entries(1), -1, 0, 3).unwrap().first_position, 6);
    }

    #[test]
    fn test_replicated_block_is_byte_identical() {
        let mut leader = LogStream::open(Arc::new(MemoryLogStorage::new()), 1).unwrap();
        let mut follower = LogStream::open(Arc::new(MemoryLogStorage::new()), 1).unwrap();

        leader.append(&entries(3), -1, 5, 1).unwrap();
        leader.append(&entries(2), 1, 6, 2).unwrap();

        let batch = leader.read_frames(1, usize::MAX, false).unwrap().unwrap();
        assert_eq!((batch.first_position, batch.last_position), (1, 5));
        assert!(!batch.more_available);

        follower.append_block(&batch.bytes).unwrap();
        for position in 1..=5 {
            let l = leader.entry_at(position).unwrap().unwrap();
            let f = follower.entry_at(position).unwrap().unwrap();
            assert_eq!(l.frame_bytes(), f.frame_bytes());
        }
        assert_eq!(follower.last_term(), 2);

        // A gap is refused
        let later = leader.read_frames(5, usize::MAX, false).unwrap().unwrap();
        assert!(matches!(
            follower.append_block(&later.bytes),
            Err(LogStreamError::NonContiguous { expected: 6, found: 5 })
        ));
    }

    #[test]
    fn test_read_frames_respects_limits() {
        let mut stream = LogStream::open(Arc::new(MemoryLogStorage::new()), 1).unwrap();
        stream.append(&entries(4), -1, 0, 1).unwrap();
        stream.set_commit_position(3);

        let batch = stream.read_frames(1, 1, true).unwrap().unwrap();
        assert_eq!((batch.first_position, batch.last_position), (1, 1));
        assert!(batch.more_available);

        let batch = stream.read_frames(2, usize::MAX, true).unwrap().unwrap();
        assert_eq!(batch.last_position, 3);
        assert!(!batch.more_available);

        assert!(stream.read_frames(4, usize::MAX, true).unwrap().is_none());
    }
}

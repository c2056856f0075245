// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Lazy, restartable readers over a log stream.
//!
//! A reader returns `None` once it has caught up. It is not exhausted: the
//! next call to `next()` picks up whatever was appended (or committed) since.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{LogStreamError, Result};
use crate::frame::{decode_frame, FrameIter, FrameStatus, LoggedEntry, HEADER_LENGTH};
use crate::storage::{Address, LogStorage, ReadResult};
use crate::stream::Shared;

const INITIAL_BUFFER: usize = 64 * 1024;

pub struct LogStreamReader {
    storage: Arc<dyn LogStorage>,
    shared: Arc<Shared>,
    buffer: Vec<u8>,
    pending: VecDeque<LoggedEntry>,
    next_address: Option<Address>,
    next_position: i64,
    committed_only: bool,
    epoch: u64,
}

impl LogStreamReader {
    pub(crate) fn new(storage: Arc<dyn LogStorage>, shared: Arc<Shared>, committed_only: bool) -> Self {
        let epoch = shared.epoch();
        Self {
            storage,
            shared,
            buffer: vec![0u8; INITIAL_BUFFER],
            pending: VecDeque::new(),
            next_address: None,
            next_position: 0,
            committed_only,
            epoch,
        }
    }

    /// Positions the reader so the next entry returned is `position` (or the
    /// first entry after it). Returns whether `position` is in the log.
    pub fn seek(&mut self, position: i64) -> bool {
        self.pending.clear();
        self.next_position = position;
        self.next_address = self.shared.floor_address(position);
        self.epoch = self.shared.epoch();
        position >= self.shared.first_position() && position <= self.shared.last_position()
    }

    pub fn seek_to_first(&mut self) {
        self.seek(self.shared.first_position());
    }

    /// Skips everything currently in the log.
    pub fn seek_to_end(&mut self) {
        let end = if self.committed_only {
            self.shared.commit_position()
        } else {
            self.shared.last_position()
        };
        self.seek(end + 1);
    }

    /// Whether `next()` would return an entry right now.
    pub fn has_next(&self) -> bool {
        let limit = if self.committed_only {
            self.shared.commit_position().min(self.shared.last_position())
        } else {
            self.shared.last_position()
        };
        self.next_position.max(self.shared.first_position()) <= limit
    }

    pub fn next_position(&self) -> i64 {
        self.next_position
    }

    fn grow(&mut self, required: usize) {
        let size = required.max(self.buffer.len() * 2);
        self.buffer.resize(size, 0);
    }

    fn start_address(&self) -> Option<Address> {
        self.next_address.or_else(|| self.storage.first_block_address())
    }

    /// Reads the next chunk into `pending`. `Ok(false)` means no more data.
    fn fill(&mut self) -> Result<bool> {
        let Some(address) = self.start_address() else {
            return Ok(false);
        };

        loop {
            match self.storage.read(&mut self.buffer, address)? {
                ReadResult::NoData => {
                    self.next_address = Some(address);
                    return Ok(false);
                }
                ReadResult::InvalidAddress => return Err(LogStreamError::InvalidAddress(address)),
                ReadResult::InsufficientBufferCapacity { required } => {
                    self.grow(required);
                }
                ReadResult::Read { len, next } if !self.storage.is_byte_addressable() => {
                    for entry in FrameIter::at(&self.buffer[..len], address, false) {
                        self.pending.push_back(entry?);
                    }
                    self.next_address = Some(next);
                    return Ok(true);
                }
                ReadResult::Read { len, next } => {
                    // The read may have continued in a later segment.
                    let start = next - len as Address;
                    let mut consumed = 0usize;
                    let mut grow_to = None;

                    while consumed < len {
                        match decode_frame(&self.buffer[consumed..len], start + consumed as Address)? {
                            FrameStatus::Complete(entry) => {
                                consumed += entry.aligned_length();
                                self.pending.push_back(entry);
                            }
                            FrameStatus::Incomplete { required } => {
                                if consumed == 0 && required > self.buffer.len() {
                                    grow_to = Some(required.max(HEADER_LENGTH));
                                }
                                break;
                            }
                        }
                    }

                    if consumed == 0 {
                        match grow_to {
                            Some(required) => {
                                self.grow(required);
                                continue;
                            }
                            None => {
                                self.next_address = Some(start);
                                return Ok(false);
                            }
                        }
                    }

                    self.next_address = Some(start + consumed as Address);
                    return Ok(true);
                }
            }
        }
    }

    fn reposition_after_truncation(&mut self) {
        let position = self.next_position;
        self.seek(position);
    }
}

impl Iterator for LogStreamReader {
    type Item = Result<LoggedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.epoch != self.shared.epoch() {
            self.reposition_after_truncation();
        }

        loop {
            if let Some(entry) = self.pending.front() {
                if entry.position < self.next_position {
                    self.pending.pop_front();
                    continue;
                }
                if self.committed_only && entry.position > self.shared.commit_position() {
                    return None;
                }
                let entry = self.pending.pop_front()?;
                self.next_position = entry.position + 1;
                return Some(Ok(entry));
            }

            match self.fill() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

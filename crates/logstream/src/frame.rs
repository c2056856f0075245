// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Dispatcher-style framing of log entries.
//!
//! # Layout
//! ```text
//! header (20 bytes)
//!   [length: i32][version: u8][flags: u8][type: u16][raft_term: i32][checksum: u64]
//! body
//!   [position: i64][source_position: i64][key: i64][timestamp: i64]
//!   [metadata_length: u16][metadata][value]
//! padding
//!   zero bytes up to the next ALIGNMENT boundary
//! ```
//!
//! `length` counts body bytes only. Every frame written to storage is padded,
//! so a frame always starts on an aligned offset relative to its block.
//! `checksum` is the CRC64 of the header without the checksum field, followed
//! by the body.
//!
//! # Invariants
//! - metadata and value are both non-empty
//! - the raft term of the leader that appended the entry travels with it

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use crc64fast::Digest;

use crate::error::{LogStreamError, Result};
use crate::storage::Address;

pub const ALIGNMENT: usize = 8;
pub const HEADER_LENGTH: usize = 20;
pub const FRAME_VERSION: u8 = 2;
pub const TYPE_MESSAGE: u16 = 0;

/// Entry is replayed and exported but never dispatched to a processor.
pub const FLAG_SKIP_PROCESSING: u8 = 0b0000_0001;

const LENGTH_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const FLAGS_OFFSET: usize = 5;
const TYPE_OFFSET: usize = 6;
const TERM_OFFSET: usize = 8;
const CHECKSUM_OFFSET: usize = 12;
const POSITION_OFFSET: usize = HEADER_LENGTH;
const SOURCE_POSITION_OFFSET: usize = POSITION_OFFSET + 8;
const KEY_OFFSET: usize = SOURCE_POSITION_OFFSET + 8;
const TIMESTAMP_OFFSET: usize = KEY_OFFSET + 8;
const METADATA_LENGTH_OFFSET: usize = TIMESTAMP_OFFSET + 8;
const METADATA_OFFSET: usize = METADATA_LENGTH_OFFSET + 2;

/// Fixed part of the body that precedes metadata and value.
pub const BODY_FIXED_LENGTH: usize = METADATA_OFFSET - HEADER_LENGTH;

pub const fn aligned_length(length: usize) -> usize {
    (length + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

fn checksum(frame: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(&frame[..CHECKSUM_OFFSET]);
    digest.write(&frame[HEADER_LENGTH..]);
    digest.sum64()
}

pub const fn framed_length(metadata_len: usize, value_len: usize) -> usize {
    HEADER_LENGTH + BODY_FIXED_LENGTH + metadata_len + value_len
}

/// Positional fields written into a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFields {
    pub position: i64,
    pub source_position: i64,
    pub key: i64,
    pub timestamp: i64,
    pub raft_term: i32,
    pub flags: u8,
}

/// Writes one frame plus its padding at the start of `buf`.
///
/// The caller guarantees `buf` holds `aligned_length(framed_length(..))` bytes
/// and that metadata fits into a `u16`.
pub(crate) fn write_frame(buf: &mut [u8], fields: &FrameFields, metadata: &[u8], value: &[u8]) -> usize {
    let framed = framed_length(metadata.len(), value.len());
    let aligned = aligned_length(framed);
    let body_len = (framed - HEADER_LENGTH) as i32;

    LittleEndian::write_i32(&mut buf[LENGTH_OFFSET..], body_len);
    buf[VERSION_OFFSET] = FRAME_VERSION;
    buf[FLAGS_OFFSET] = fields.flags;
    LittleEndian::write_u16(&mut buf[TYPE_OFFSET..], TYPE_MESSAGE);
    LittleEndian::write_i32(&mut buf[TERM_OFFSET..], fields.raft_term);
    LittleEndian::write_i64(&mut buf[POSITION_OFFSET..], fields.position);
    LittleEndian::write_i64(&mut buf[SOURCE_POSITION_OFFSET..], fields.source_position);
    LittleEndian::write_i64(&mut buf[KEY_OFFSET..], fields.key);
    LittleEndian::write_i64(&mut buf[TIMESTAMP_OFFSET..], fields.timestamp);
    LittleEndian::write_u16(&mut buf[METADATA_LENGTH_OFFSET..], metadata.len() as u16);

    let value_offset = METADATA_OFFSET + metadata.len();
    buf[METADATA_OFFSET..value_offset].copy_from_slice(metadata);
    buf[value_offset..framed].copy_from_slice(value);
    buf[framed..aligned].fill(0);

    let sum = checksum(&buf[..framed]);
    LittleEndian::write_u64(&mut buf[CHECKSUM_OFFSET..], sum);
    framed
}

/// A framed entry read back from storage.
///
/// Holds the raw aligned frame so replicas can forward it byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEntry {
    pub position: i64,
    pub source_position: i64,
    pub key: i64,
    pub timestamp: i64,
    pub raft_term: i32,
    pub flags: u8,
    /// Where the frame starts in storage (block address for block storages).
    pub address: Address,
    metadata_length: usize,
    frame: Bytes,
}

impl LoggedEntry {
    pub fn metadata(&self) -> &[u8] {
        &self.frame[METADATA_OFFSET..METADATA_OFFSET + self.metadata_length]
    }

    pub fn value(&self) -> &[u8] {
        let start = METADATA_OFFSET + self.metadata_length;
        let end = HEADER_LENGTH + LittleEndian::read_i32(&self.frame[LENGTH_OFFSET..]) as usize;
        &self.frame[start..end]
    }

    pub fn should_skip_processing(&self) -> bool {
        self.flags & FLAG_SKIP_PROCESSING != 0
    }

    /// The raw, padded frame.
    pub fn frame_bytes(&self) -> &Bytes {
        &self.frame
    }

    pub fn aligned_length(&self) -> usize {
        self.frame.len()
    }
}

/// Outcome of decoding the frame at the start of a buffer.
#[derive(Debug)]
pub enum FrameStatus {
    Complete(LoggedEntry),
    /// The buffer ends inside the frame; `required` bytes are needed to decode it.
    Incomplete { required: usize },
}

pub fn decode_frame(buf: &[u8], address: Address) -> Result<FrameStatus> {
    if buf.len() < HEADER_LENGTH {
        return Ok(FrameStatus::Incomplete { required: HEADER_LENGTH });
    }

    let corrupted = |reason: String| LogStreamError::Corrupted { address, reason };

    let body_len = LittleEndian::read_i32(&buf[LENGTH_OFFSET..]);
    if body_len < BODY_FIXED_LENGTH as i32 {
        return Err(corrupted(format!("frame body length {body_len} is too small")));
    }
    if buf[VERSION_OFFSET] != FRAME_VERSION {
        return Err(corrupted(format!("unknown frame version {}", buf[VERSION_OFFSET])));
    }
    let frame_type = LittleEndian::read_u16(&buf[TYPE_OFFSET..]);
    if frame_type != TYPE_MESSAGE {
        return Err(corrupted(format!("unknown frame type {frame_type}")));
    }

    let framed = HEADER_LENGTH + body_len as usize;
    let aligned = aligned_length(framed);
    if buf.len() < aligned {
        return Ok(FrameStatus::Incomplete { required: aligned });
    }

    let stored = LittleEndian::read_u64(&buf[CHECKSUM_OFFSET..]);
    let computed = checksum(&buf[..framed]);
    if stored != computed {
        return Err(corrupted(format!(
            "checksum mismatch (stored {stored:#018x}, computed {computed:#018x})"
        )));
    }

    let metadata_length = LittleEndian::read_u16(&buf[METADATA_LENGTH_OFFSET..]) as usize;
    if metadata_length == 0 {
        return Err(corrupted("empty metadata".into()));
    }
    if METADATA_OFFSET + metadata_length >= framed {
        return Err(corrupted(format!(
            "metadata length {metadata_length} leaves no room for a value"
        )));
    }

    let position = LittleEndian::read_i64(&buf[POSITION_OFFSET..]);
    let timestamp = LittleEndian::read_i64(&buf[TIMESTAMP_OFFSET..]);
    if position < 0 || timestamp < 0 {
        return Err(corrupted(format!("negative position {position} or timestamp {timestamp}")));
    }

    Ok(FrameStatus::Complete(LoggedEntry {
        position,
        source_position: LittleEndian::read_i64(&buf[SOURCE_POSITION_OFFSET..]),
        key: LittleEndian::read_i64(&buf[KEY_OFFSET..]),
        timestamp,
        raft_term: LittleEndian::read_i32(&buf[TERM_OFFSET..]),
        flags: buf[FLAGS_OFFSET],
        address,
        metadata_length,
        frame: Bytes::copy_from_slice(&buf[..aligned]),
    }))
}

/// Iterates the frames of a block that is known to be complete, such as a
/// block received through replication. A trailing partial frame is corruption.
pub struct FrameIter<'a> {
    block: &'a [u8],
    offset: usize,
    address: Address,
    byte_addressable: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(block: &'a [u8]) -> Self {
        Self::at(block, 0, true)
    }

    /// Frames read from `address`. Byte-addressable storages give each frame
    /// its own address, block storages report the block address for all.
    pub fn at(block: &'a [u8], address: Address, byte_addressable: bool) -> Self {
        Self {
            block,
            offset: 0,
            address,
            byte_addressable,
        }
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<LoggedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.block.len() {
            return None;
        }

        let address = if self.byte_addressable {
            self.address + self.offset as Address
        } else {
            self.address
        };

        match decode_frame(&self.block[self.offset..], address) {
            Ok(FrameStatus::Complete(entry)) => {
                self.offset += entry.aligned_length();
                Some(Ok(entry))
            }
            Ok(FrameStatus::Incomplete { required }) => {
                self.offset = self.block.len();
                Some(Err(LogStreamError::Corrupted {
                    address,
                    reason: format!("block ends inside a frame of {required} bytes"),
                }))
            }
            Err(e) => {
                self.offset = self.block.len();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(position: i64) -> FrameFields {
        FrameFields {
            position,
            source_position: -1,
            key: 7,
            timestamp: 1_000,
            raft_term: 3,
            flags: 0,
        }
    }

    #[test]
    fn test_aligned_length() {
        assert_eq!(aligned_length(0), 0);
        assert_eq!(aligned_length(1), 8);
        assert_eq!(aligned_length(8), 8);
        assert_eq!(aligned_length(49), 56);
    }

    #[test]
    fn test_frame_layout() {
        let framed = framed_length(3, 5);
        let mut buf = vec![0xFFu8; aligned_length(framed)];
        let written = write_frame(&mut buf, &fields(42), b"abc", b"hello");
        assert_eq!(written, framed);

        // Padding is zeroed
        assert!(buf[framed..].iter().all(|b| *b == 0));

        let FrameStatus::Complete(entry) = decode_frame(&buf, 0).unwrap() else {
            panic!("frame should be complete");
        };
        assert_eq!(entry.position, 42);
        assert_eq!(entry.raft_term, 3);
        assert_eq!(entry.metadata(), b"abc");
        assert_eq!(entry.value(), b"hello");
        assert_eq!(entry.aligned_length(), buf.len());
    }

    #[test]
    fn test_incomplete_frame() {
        let framed = framed_length(1, 1);
        let mut buf = vec![0u8; aligned_length(framed)];
        write_frame(&mut buf, &fields(1), b"m", b"v");

        match decode_frame(&buf[..HEADER_LENGTH + 4], 0).unwrap() {
            FrameStatus::Incomplete { required } => assert_eq!(required, buf.len()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_zeroed_bytes_are_corrupt() {
        let buf = [0u8; 64];
        assert!(matches!(
            decode_frame(&buf, 16),
            Err(LogStreamError::Corrupted { address: 16, .. })
        ));
    }

    #[test]
    fn test_flipped_byte_fails_the_checksum() {
        let framed = framed_length(3, 5);
        let mut buf = vec![0u8; aligned_length(framed)];
        write_frame(&mut buf, &fields(9), b"abc", b"hello");

        for offset in [TERM_OFFSET, POSITION_OFFSET + 1, framed - 1] {
            let mut damaged = buf.clone();
            damaged[offset] ^= 0x01;
            match decode_frame(&damaged, 64) {
                Err(LogStreamError::Corrupted { address, reason }) => {
                    assert_eq!(address, 64);
                    assert!(reason.contains("checksum"), "offset {offset}: {reason}");
                }
                other => panic!("offset {offset}: expected corruption, got {other:?}"),
            }
        }

        // Padding is outside the checksum
        let mut padded = buf.clone();
        if framed < padded.len() {
            padded[framed] = 0xAA;
            assert!(decode_frame(&padded, 0).is_ok());
        }
    }

    #[test]
    fn test_skip_flag() {
        let mut f = fields(1);
        f.flags = FLAG_SKIP_PROCESSING;
        let mut buf = vec![0u8; aligned_length(framed_length(1, 1))];
        write_frame(&mut buf, &f, b"m", b"v");

        let entry = FrameIter::new(&buf).next().unwrap().unwrap();
        assert!(entry.should_skip_processing());
    }
}

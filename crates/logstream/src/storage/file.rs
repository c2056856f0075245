// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Segmented file storage.
//!
//! # File Format
//! ```text
//! <dir>/0000000000.log, 0000000001.log, ...
//! [Header: 16 bytes][block][block]...
//! ```
//!
//! Header:
//! - magic: `BRKS`
//! - version: u32 (1)
//! - segment id: u32
//! - reserved: u32 (0)
//!
//! An address is `(segment_id << 32) | offset`. A block never spans two
//! segments. A torn block at the tail of the last segment is cut off on open.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use byteorder::{ByteOrder, LittleEndian};

use super::{Address, LogStorage, ReadResult};
use crate::error::{LogStreamError, Result};
use crate::frame::{aligned_length, decode_frame, FrameStatus, HEADER_LENGTH};

const SEGMENT_MAGIC: [u8; 4] = *b"BRKS";
const SEGMENT_VERSION: u32 = 1;
pub const SEGMENT_HEADER_LENGTH: u64 = 16;
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

pub fn address(segment_id: u32, offset: u64) -> Address {
    ((segment_id as u64) << 32) | (offset & 0xFFFF_FFFF)
}

pub fn segment_id(address: Address) -> u32 {
    (address >> 32) as u32
}

pub fn segment_offset(address: Address) -> u64 {
    address & 0xFFFF_FFFF
}

fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{id:010}.log"))
}

struct Segment {
    id: u32,
    path: PathBuf,
    file: File,
    size: u64,
}

impl Segment {
    fn create(dir: &Path, id: u32) -> Result<Self> {
        let path = segment_path(dir, id);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut header = [0u8; SEGMENT_HEADER_LENGTH as usize];
        header[0..4].copy_from_slice(&SEGMENT_MAGIC);
        LittleEndian::write_u32(&mut header[4..8], SEGMENT_VERSION);
        LittleEndian::write_u32(&mut header[8..12], id);
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(Self {
            id,
            path,
            file,
            size: SEGMENT_HEADER_LENGTH,
        })
    }

    fn open(path: PathBuf, expected_id: u32) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();

        let corrupted = |reason: &str| LogStreamError::Corrupted {
            address: address(expected_id, 0),
            reason: format!("segment {}: {}", path.display(), reason),
        };

        if size < SEGMENT_HEADER_LENGTH {
            return Err(corrupted("truncated header"));
        }
        let mut header = [0u8; SEGMENT_HEADER_LENGTH as usize];
        file.read_exact(&mut header)?;
        if header[0..4] != SEGMENT_MAGIC {
            return Err(corrupted("invalid magic"));
        }
        if LittleEndian::read_u32(&header[4..8]) != SEGMENT_VERSION {
            return Err(corrupted("unsupported version"));
        }
        if LittleEndian::read_u32(&header[8..12]) != expected_id {
            return Err(corrupted("segment id does not match file name"));
        }

        Ok(Self {
            id: expected_id,
            path,
            file,
            size,
        })
    }

    /// Cuts off a partially written tail. Returns the number of bytes dropped.
    ///
    /// Only the last frame may be torn. A frame that fails to decode while
    /// more data follows it is corruption and fails the open.
    fn recover_tail(&mut self) -> Result<u64> {
        let data_len = (self.size - SEGMENT_HEADER_LENGTH) as usize;
        let mut data = vec![0u8; data_len];
        self.file.seek(SeekFrom::Start(SEGMENT_HEADER_LENGTH))?;
        self.file.read_exact(&mut data)?;

        let mut valid = 0usize;
        while valid < data.len() {
            match decode_frame(&data[valid..], address(self.id, SEGMENT_HEADER_LENGTH + valid as u64)) {
                Ok(FrameStatus::Complete(entry)) => valid += entry.aligned_length(),
                Ok(FrameStatus::Incomplete { .. }) => break,
                Err(e) if is_last_frame(&data[valid..]) => {
                    tracing::warn!("Treating the damaged last frame of segment {} as torn: {}", self.id, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let dropped = (data.len() - valid) as u64;
        if dropped > 0 {
            let new_size = SEGMENT_HEADER_LENGTH + valid as u64;
            self.file.set_len(new_size)?;
            self.file.sync_all()?;
            self.size = new_size;
        }
        Ok(dropped)
    }
}

/// Whether the frame at the start of `data` claims to run to the end of it.
/// A header too damaged to tell is treated as the last frame.
fn is_last_frame(data: &[u8]) -> bool {
    if data.len() < HEADER_LENGTH {
        return true;
    }
    let body_len = LittleEndian::read_i32(data);
    if body_len <= 0 {
        return data.iter().all(|b| *b == 0);
    }
    aligned_length(HEADER_LENGTH + body_len as usize) >= data.len()
}

struct Segments {
    list: Vec<Segment>,
}

impl Segments {
    fn index_of(&self, id: u32) -> Option<usize> {
        let first = self.list.first()?.id;
        let index = id.checked_sub(first)? as usize;
        (index < self.list.len()).then_some(index)
    }
}

/// Byte-addressable storage over a directory of segment files.
pub struct FileLogStorage {
    dir: PathBuf,
    segment_size: u64,
    inner: Mutex<Segments>,
}

impl FileLogStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_segment_size(dir, DEFAULT_SEGMENT_SIZE)
    }

    pub fn open_with_segment_size(dir: impl AsRef<Path>, segment_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if segment_size <= SEGMENT_HEADER_LENGTH + HEADER_LENGTH as u64 || segment_size > u32::MAX as u64 {
            return Err(LogStreamError::Validation(format!(
                "segment size {segment_size} is out of range"
            )));
        }
        fs::create_dir_all(&dir)?;

        let mut ids = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut list = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            if i > 0 && *id != ids[i - 1] + 1 {
                return Err(LogStreamError::Corrupted {
                    address: address(*id, 0),
                    reason: format!("missing segment {}", ids[i - 1] + 1),
                });
            }
            list.push(Segment::open(segment_path(&dir, *id), *id)?);
        }

        if let Some(last) = list.last_mut() {
            let dropped = last.recover_tail()?;
            if dropped > 0 {
                tracing::warn!(
                    "Dropped {} bytes of torn data at the tail of segment {}",
                    dropped,
                    last.path.display()
                );
            }
        } else {
            list.push(Segment::create(&dir, 0)?);
        }

        tracing::debug!("Opened log storage at {:?} with {} segment(s)", dir, list.len());

        Ok(Self {
            dir,
            segment_size,
            inner: Mutex::new(Segments { list }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_count(&self) -> usize {
        self.lock().map(|s| s.list.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Segments>> {
        self.inner.lock().map_err(|_| {
            LogStreamError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "file storage lock poisoned",
            ))
        })
    }
}

impl LogStorage for FileLogStorage {
    fn is_byte_addressable(&self) -> bool {
        true
    }

    fn append(&self, block: &[u8]) -> Result<Address> {
        let capacity = self.segment_size - SEGMENT_HEADER_LENGTH;
        if block.len() as u64 > capacity {
            return Err(LogStreamError::BlockTooLarge {
                size: block.len(),
                capacity,
            });
        }

        let mut segments = self.lock()?;
        let needs_roll = segments
            .list
            .last()
            .map_or(true, |s| s.size + block.len() as u64 > self.segment_size);
        if needs_roll {
            let next_id = match segments.list.last() {
                Some(current) => {
                    current.file.sync_data()?;
                    current.id + 1
                }
                None => 0,
            };
            segments.list.push(Segment::create(&self.dir, next_id)?);
            tracing::debug!("Rolled log storage to segment {}", next_id);
        }

        let Some(segment) = segments.list.last_mut() else {
            return Err(LogStreamError::InvalidAddress(0));
        };
        let offset = segment.size;
        let written = segment
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| segment.file.write_all(block));
        if let Err(e) = written {
            // Leave no partial block behind.
            let _ = segment.file.set_len(offset);
            return Err(e.into());
        }
        segment.size += block.len() as u64;

        Ok(address(segment.id, offset))
    }

    fn read(&self, buf: &mut [u8], address_: Address) -> Result<ReadResult> {
        let mut segments = self.lock()?;
        let mut id = segment_id(address_);
        let mut offset = segment_offset(address_);

        loop {
            let Some(index) = segments.index_of(id) else {
                return Ok(ReadResult::InvalidAddress);
            };
            let is_last = index + 1 == segments.list.len();
            let segment = &mut segments.list[index];

            if offset < SEGMENT_HEADER_LENGTH || offset > segment.size {
                return Ok(ReadResult::InvalidAddress);
            }
            if offset == segment.size {
                if is_last {
                    return Ok(ReadResult::NoData);
                }
                id += 1;
                offset = SEGMENT_HEADER_LENGTH;
                continue;
            }
            if buf.is_empty() {
                return Ok(ReadResult::InsufficientBufferCapacity {
                    required: HEADER_LENGTH,
                });
            }

            let len = buf.len().min((segment.size - offset) as usize);
            segment.file.seek(SeekFrom::Start(offset))?;
            segment.file.read_exact(&mut buf[..len])?;
            return Ok(ReadResult::Read {
                len,
                next: address(id, offset + len as u64),
            });
        }
    }

    fn first_block_address(&self) -> Option<Address> {
        let segments = self.lock().ok()?;
        segments
            .list
            .iter()
            .find(|s| s.size > SEGMENT_HEADER_LENGTH)
            .map(|s| address(s.id, SEGMENT_HEADER_LENGTH))
    }

    fn flush(&self) -> Result<()> {
        let segments = self.lock()?;
        if let Some(segment) = segments.list.last() {
            segment.file.sync_data()?;
        }
        Ok(())
    }

    fn truncate(&self, address_: Address) -> Result<()> {
        let mut segments = self.lock()?;
        let id = segment_id(address_);
        let offset = segment_offset(address_);
        let index = segments
            .index_of(id)
            .ok_or(LogStreamError::InvalidAddress(address_))?;

        let segment = &mut segments.list[index];
        if offset < SEGMENT_HEADER_LENGTH || offset > segment.size {
            return Err(LogStreamError::InvalidAddress(address_));
        }
        segment.file.set_len(offset)?;
        segment.file.sync_all()?;
        segment.size = offset;

        for removed in segments.list.drain(index + 1..) {
            drop(removed.file);
            fs::remove_file(&removed.path)?;
        }
        Ok(())
    }

    fn compact(&self, address_: Address) -> Result<Option<Address>> {
        let mut segments = self.lock()?;
        let keep_from = segment_id(address_);

        while segments.list.len() > 1 && segments.list[0].id < keep_from {
            let removed = segments.list.remove(0);
            drop(removed.file);
            fs::remove_file(&removed.path)?;
            tracing::info!("Deleted compacted segment {}", removed.path.display());
        }

        Ok(segments
            .list
            .iter()
            .find(|s| s.size > SEGMENT_HEADER_LENGTH)
            .map(|s| address(s.id, SEGMENT_HEADER_LENGTH)))
    }
}

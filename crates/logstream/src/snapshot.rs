// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Position-keyed snapshot storage.
//!
//! # File Format
//! ```text
//! snapshot-<position:020>.snap
//! [MAGIC "BRSN"][VERSION u32][position i64][created_at u64][body...][CRC64 u64]
//! ```
//!
//! # Guarantees
//! - a snapshot only becomes visible through `SnapshotWriter::commit`
//!   (checksum trailer, fsync, atomic rename)
//! - `abort` (or dropping an uncommitted writer) leaves nothing behind
//! - readers verify magic, version and checksum before handing out data

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crc64fast::Digest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"BRSN";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 4 + 4 + 8 + 8;
pub const TRAILER_SIZE: usize = 8;

const EXTENSION: &str = "snap";
const PENDING_EXTENSION: &str = "tmp";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid magic bytes in snapshot header")]
    InvalidMagic,
    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("Snapshot file too short ({0} bytes)")]
    Truncated(usize),
    #[error("Checksum mismatch: expected {expected:#x}, found {found:#x}")]
    ChecksumMismatch { expected: u64, found: u64 },
    #[error("Snapshot at position {0} already exists")]
    AlreadyExists(i64),
    #[error("Snapshot at position {0} not found")]
    NotFound(i64),
    #[error("Snapshot reader closed after {read} of {total} bytes")]
    Incomplete { read: usize, total: usize },
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub position: i64,
    pub created_at: u64,
    pub size: u64,
    pub checksum: u64,
    pub path: PathBuf,
}

fn file_name(position: i64) -> String {
    format!("snapshot-{position:020}.{EXTENSION}")
}

fn parse_position(path: &Path) -> Option<i64> {
    if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("snapshot-")?
        .parse()
        .ok()
}

fn checksum(data: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(data);
    digest.sum64()
}

/// Streams a snapshot body into a pending file.
pub struct SnapshotWriter {
    position: i64,
    created_at: u64,
    pending_path: PathBuf,
    final_path: PathBuf,
    file: Option<BufWriter<File>>,
    digest: Digest,
    written: u64,
}

impl SnapshotWriter {
    fn create(dir: &Path, position: i64, created_at: u64) -> Result<Self> {
        let final_path = dir.join(file_name(position));
        if final_path.exists() {
            return Err(SnapshotError::AlreadyExists(position));
        }
        let pending_path = final_path.with_extension(PENDING_EXTENSION);
        let file = BufWriter::new(File::create(&pending_path)?);

        let mut writer = Self {
            position,
            created_at,
            pending_path,
            final_path,
            file: Some(file),
            digest: Digest::new(),
            written: 0,
        };

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..8].copy_from_slice(&VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&position.to_le_bytes());
        header[16..24].copy_from_slice(&created_at.to_le_bytes());
        writer.write_all(&header)?;

        Ok(writer)
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    /// Writes the checksum and publishes the snapshot.
    pub fn commit(mut self) -> Result<SnapshotMetadata> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "snapshot writer already finished"))?;

        let sum = self.digest.sum64();
        file.write_all(&sum.to_le_bytes())?;
        file.flush()?;
        file.get_ref().sync_all()?;
        drop(file);

        fs::rename(&self.pending_path, &self.final_path)?;

        let size = self.written + TRAILER_SIZE as u64;
        tracing::info!(
            "Committed snapshot at position {} ({} bytes) to {:?}",
            self.position,
            size,
            self.final_path
        );

        Ok(SnapshotMetadata {
            position: self.position,
            created_at: self.created_at,
            size,
            checksum: sum,
            path: self.final_path.clone(),
        })
    }

    /// Discards everything written so far.
    pub fn abort(mut self) -> Result<()> {
        self.discard()
    }

    fn discard(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            drop(file);
            match fs::remove_file(&self.pending_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::debug!("Aborted snapshot at position {}", self.position);
        }
        Ok(())
    }
}

impl Write for SnapshotWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "snapshot writer already finished"))?;
        let n = file.write(buf)?;
        self.digest.write(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if let Err(e) = self.discard() {
            tracing::warn!("Failed to discard uncommitted snapshot {:?}: {}", self.pending_path, e);
        }
    }
}

/// A validated snapshot, readable through `std::io::Read`.
pub struct SnapshotReader {
    metadata: SnapshotMetadata,
    content: Vec<u8>,
    cursor: usize,
    digest: Digest,
}

impl SnapshotReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(SnapshotError::Truncated(bytes.len()));
        }
        let (content, trailer) = bytes.split_at(bytes.len() - TRAILER_SIZE);
        let mut stored = [0u8; TRAILER_SIZE];
        stored.copy_from_slice(trailer);
        let expected = u64::from_le_bytes(stored);

        if content[0..4] != MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&content[4..8]);
        let version = u32::from_le_bytes(word);
        if version != VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let found = checksum(content);
        if found != expected {
            return Err(SnapshotError::ChecksumMismatch { expected, found });
        }

        let mut long = [0u8; 8];
        long.copy_from_slice(&content[8..16]);
        let position = i64::from_le_bytes(long);
        long.copy_from_slice(&content[16..24]);
        let created_at = u64::from_le_bytes(long);

        let mut digest = Digest::new();
        digest.write(&content[..HEADER_SIZE]);

        Ok(Self {
            metadata: SnapshotMetadata {
                position,
                created_at,
                size: bytes.len() as u64,
                checksum: expected,
                path: path.to_path_buf(),
            },
            content: content.to_vec(),
            cursor: HEADER_SIZE,
            digest,
        })
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// Snapshot body without header and trailer.
    pub fn body(&self) -> &[u8] {
        &self.content[HEADER_SIZE..]
    }

    /// Confirms the consumer read the whole body and that it still matches
    /// the stored checksum.
    pub fn validate_and_close(self) -> Result<()> {
        if self.cursor != self.content.len() {
            return Err(SnapshotError::Incomplete {
                read: self.cursor - HEADER_SIZE,
                total: self.content.len() - HEADER_SIZE,
            });
        }
        let found = self.digest.sum64();
        if found != self.metadata.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: self.metadata.checksum,
                found,
            });
        }
        Ok(())
    }
}

impl Read for SnapshotReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.content[self.cursor..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.digest.write(&remaining[..n]);
        self.cursor += n;
        Ok(n)
    }
}

/// Directory of snapshots owned by one partition.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Opens (or creates) the directory and removes leftovers of writes that
    /// never committed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PENDING_EXTENSION) {
                tracing::warn!("Removing uncommitted snapshot {:?}", path);
                fs::remove_file(&path)?;
            }
        }

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn new_writer(&self, position: i64, created_at: u64) -> Result<SnapshotWriter> {
        SnapshotWriter::create(&self.dir, position, created_at)
    }

    /// Committed snapshot positions, oldest first.
    pub fn positions(&self) -> Result<Vec<i64>> {
        let mut positions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            if let Some(position) = parse_position(&entry?.path()) {
                positions.push(position);
            }
        }
        positions.sort_unstable();
        Ok(positions)
    }

    pub fn path_for(&self, position: i64) -> PathBuf {
        self.dir.join(file_name(position))
    }

    pub fn open_reader(&self, position: i64) -> Result<SnapshotReader> {
        let path = self.path_for(position);
        if !path.exists() {
            return Err(SnapshotError::NotFound(position));
        }
        SnapshotReader::open(path)
    }

    /// Newest snapshot that passes validation. Invalid ones are skipped with
    /// a warning, never deleted.
    pub fn latest_valid(&self) -> Result<Option<SnapshotReader>> {
        for position in self.positions()?.into_iter().rev() {
            match self.open_reader(position) {
                Ok(reader) => return Ok(Some(reader)),
                Err(e) => tracing::warn!("Skipping snapshot at position {}: {}", position, e),
            }
        }
        Ok(None)
    }

    pub fn delete(&self, position: i64) -> Result<()> {
        fs::remove_file(self.path_for(position))?;
        Ok(())
    }

    /// Keeps the newest `keep` snapshots. Returns how many were deleted.
    pub fn purge(&self, keep: usize) -> Result<usize> {
        let positions = self.positions()?;
        let excess = positions.len().saturating_sub(keep.max(1));
        for position in &positions[..excess] {
            self.delete(*position)?;
            tracing::debug!("Purged snapshot at position {}", position);
        }
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_snapshot(store: &SnapshotStore, position: i64, body: &[u8]) -> SnapshotMetadata {
        let mut writer = store.new_writer(position, 1_700_000_000).unwrap();
        writer.write_all(body).unwrap();
        writer.commit().unwrap()
    }

    #[test]
    fn test_commit_and_read() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let meta = write_snapshot(&store, 42, b"state bytes");

        assert_eq!(meta.position, 42);
        assert_eq!(store.positions().unwrap(), vec![42]);

        let mut reader = store.open_reader(42).unwrap();
        assert_eq!(reader.metadata().checksum, meta.checksum);
        let mut body = Vec::new();
        reader.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"state bytes");
        reader.validate_and_close().unwrap();
    }

    #[test]
    fn test_abort_leaves_nothing() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let mut writer = store.new_writer(7, 0).unwrap();
        writer.write_all(b"partial").unwrap();
        writer.abort().unwrap();

        {
            let mut dropped = store.new_writer(8, 0).unwrap();
            dropped.write_all(b"partial").unwrap();
        }

        assert!(store.positions().unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let meta = write_snapshot(&store, 3, b"important state");

        let mut bytes = fs::read(&meta.path).unwrap();
        bytes[HEADER_SIZE + 2] ^= 0xFF;
        fs::write(&meta.path, bytes).unwrap();

        assert!(matches!(
            store.open_reader(3),
            Err(SnapshotError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_latest_valid_skips_corrupt() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        write_snapshot(&store, 10, b"older");
        let newer = write_snapshot(&store, 20, b"newer");
        fs::write(&newer.path, b"garbage").unwrap();

        let reader = store.latest_valid().unwrap().unwrap();
        assert_eq!(reader.metadata().position, 10);
        assert_eq!(reader.body(), b"older");
    }

    #[test]
    fn test_validate_and_close_requires_full_read() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        write_snapshot(&store, 1, b"0123456789");

        let mut reader = store.open_reader(1).unwrap();
        let mut partial = [0u8; 4];
        reader.read_exact(&mut partial).unwrap();
        assert!(matches!(
            reader.validate_and_close(),
            Err(SnapshotError::Incomplete { read: 4, total: 10 })
        ));
    }

    #[test]
    fn test_purge_and_duplicates() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        for position in [5, 10, 15] {
            write_snapshot(&store, position, b"x");
        }
        assert!(matches!(store.new_writer(10, 0), Err(SnapshotError::AlreadyExists(10))));

        assert_eq!(store.purge(2).unwrap(), 1);
        assert_eq!(store.positions().unwrap(), vec![10, 15]);
    }

    #[test]
    fn test_open_removes_pending_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("snapshot-00000000000000000009.tmp"), b"junk").unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.positions().unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}

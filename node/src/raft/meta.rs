// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use super::{NodeId, RaftError, RaftResult, Term};

const MAGIC: u32 = 0x4252_4D54; // BRMT
const SCHEMA_VERSION: u32 = 1;
const FILE_NAME: &str = "raft-meta.bin";

/// What a replica must remember across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMeta {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// `[MAGIC][VERSION][body (bincode)][CRC32]`, replaced atomically.
pub struct MetaStore {
    path: PathBuf,
}

impl MetaStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored meta, or the default for a replica that never voted.
    pub fn load(&self) -> RaftResult<PersistedMeta> {
        let buffer = match fs::read(&self.path) {
            Ok(buffer) => buffer,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PersistedMeta::default()),
            Err(e) => return Err(RaftError::Meta(e.to_string())),
        };
        parse(&buffer)
    }

    pub fn store(&self, meta: &PersistedMeta) -> RaftResult<()> {
        let body = bincode::serde::encode_to_vec(meta, bincode::config::standard())
            .map_err(|e| RaftError::Encoding(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            let mut hasher = Hasher::new();
            let mut write_chunk = |data: &[u8]| -> std::io::Result<()> {
                file.write_all(data)?;
                hasher.update(data);
                Ok(())
            };
            write_chunk(&MAGIC.to_le_bytes())?;
            write_chunk(&SCHEMA_VERSION.to_le_bytes())?;
            write_chunk(&body)?;

            file.write_all(&hasher.finalize().to_le_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };
        write().map_err(|e| RaftError::Meta(e.to_string()))
    }
}

fn parse(buffer: &[u8]) -> RaftResult<PersistedMeta> {
    if buffer.len() < 12 {
        return Err(RaftError::Meta("meta file too short".into()));
    }

    let (content, trailer) = buffer.split_at(buffer.len() - 4);
    let mut word = [0u8; 4];
    word.copy_from_slice(trailer);
    let stored_crc = u32::from_le_bytes(word);

    let mut hasher = Hasher::new();
    hasher.update(content);
    if hasher.finalize() != stored_crc {
        return Err(RaftError::Meta("checksum mismatch".into()));
    }

    word.copy_from_slice(&content[0..4]);
    if u32::from_le_bytes(word) != MAGIC {
        return Err(RaftError::Meta("invalid magic".into()));
    }
    word.copy_from_slice(&content[4..8]);
    let version = u32::from_le_bytes(word);
    if version != SCHEMA_VERSION {
        return Err(RaftError::Meta(format!("unsupported version {version}")));
    }

    let (meta, _): (PersistedMeta, usize) =
        bincode::serde::decode_from_slice(&content[8..], bincode::config::standard())
            .map_err(|e| RaftError::Encoding(e.to_string()))?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_means_fresh_replica() {
        let dir = tempdir().unwrap();
        let store = MetaStore::new(dir.path());
        assert_eq!(store.load().unwrap(), PersistedMeta::default());
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempdir().unwrap();
        let store = MetaStore::new(dir.path());
        store.store(&PersistedMeta { term: 4, voted_for: Some(2) }).unwrap();
        store.store(&PersistedMeta { term: 5, voted_for: None }).unwrap();

        let reopened = MetaStore::new(dir.path());
        assert_eq!(reopened.load().unwrap(), PersistedMeta { term: 5, voted_for: None });
        assert!(!dir.path().join("raft-meta.tmp").exists());
    }

    #[test]
    fn test_corruption_is_detected() {
        let dir = tempdir().unwrap();
        let store = MetaStore::new(dir.path());
        store.store(&PersistedMeta { term: 7, voted_for: Some(1) }).unwrap();

        let mut bytes = fs::read(store.path()).unwrap();
        bytes[9] ^= 0xff;
        fs::write(store.path(), &bytes).unwrap();

        assert!(matches!(store.load(), Err(RaftError::Meta(_))));
    }
}

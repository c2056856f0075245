// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use brook_logstream::{FileLogStorage, LogStream, SnapshotStore};
use brook_node::raft::{MetaStore, PersistedMeta};

/// The files a node keeps for one partition: `log/`, `snapshots/` and the
/// raft meta file.
pub struct PartitionDir {
    root: PathBuf,
    partition_id: u32,
}

impl PartitionDir {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            bail!("{} is not a directory", root.display());
        }
        // `partition-<id>` names the partition; anything else is read as 1.
        let partition_id = root
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("partition-"))
            .and_then(|id| id.parse().ok())
            .unwrap_or(1);
        Ok(Self { root, partition_id })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Opens the log and reports how many segment files back it.
    pub fn open_log(&self) -> Result<(LogStream, usize)> {
        let dir = self.log_dir();
        if !dir.is_dir() {
            bail!("no log under {}", self.root.display());
        }
        let storage = FileLogStorage::open(&dir).with_context(|| format!("opening {}", dir.display()))?;
        let segments = storage.segment_count();
        let log = LogStream::open(Arc::new(storage), self.partition_id)
            .with_context(|| format!("reading {}", dir.display()))?;
        Ok((log, segments))
    }

    pub fn open_snapshots(&self) -> Result<SnapshotStore> {
        let dir = self.snapshots_dir();
        SnapshotStore::open(&dir).with_context(|| format!("opening {}", dir.display()))
    }

    /// `None` when the replica never persisted a term.
    pub fn raft_meta(&self) -> Result<Option<PersistedMeta>> {
        let store = MetaStore::new(&self.root);
        if !store.path().exists() {
            return Ok(None);
        }
        let meta = store
            .load()
            .with_context(|| format!("reading {}", store.path().display()))?;
        Ok(Some(meta))
    }
}

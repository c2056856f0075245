// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! brook-logstream: framed, position-sequenced partition logs and snapshot storage.

pub mod error;
pub mod frame;
pub mod reader;
pub mod serializer;
pub mod snapshot;
pub mod storage;
pub mod stream;

pub use error::{LogStreamError, Result};
pub use frame::LoggedEntry;
pub use reader::LogStreamReader;
pub use serializer::{LogAppendEntry, Sequencer};
pub use snapshot::{SnapshotError, SnapshotMetadata, SnapshotReader, SnapshotStore, SnapshotWriter};
pub use storage::{Address, FileLogStorage, LogStorage, MemoryLogStorage, ReadResult};
pub use stream::{AppendResult, FrameBatch, LogStream};

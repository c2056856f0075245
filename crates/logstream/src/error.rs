// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::io;
use thiserror::Error;

use crate::storage::Address;

#[derive(Error, Debug)]
pub enum LogStreamError {
    /// Caller bug: the entry or batch can never be written. Not retryable.
    #[error("Invalid log entry: {0}")]
    Validation(String),
    #[error("Corrupted log data at address {address:#x}: {reason}")]
    Corrupted { address: Address, reason: String },
    #[error("Checksum mismatch: expected {expected:#x}, found {found:#x}")]
    ChecksumMismatch { expected: u64, found: u64 },
    #[error("Invalid address {0:#x}")]
    InvalidAddress(Address),
    #[error("Block of {size} bytes exceeds the segment capacity of {capacity} bytes")]
    BlockTooLarge { size: usize, capacity: u64 },
    #[error("Expected next position {expected}, got {found}")]
    NonContiguous { expected: i64, found: i64 },
    #[error("Cannot truncate at position {position}: committed up to {commit_position}")]
    TruncateCommitted { position: i64, commit_position: i64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, LogStreamError>;

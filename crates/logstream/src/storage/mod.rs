// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Append/read primitives underneath the log stream.
//!
//! A storage only knows blocks of bytes. Framing, positions and indexing live
//! in [`crate::stream`].

pub mod file;
pub mod memory;

pub use file::FileLogStorage;
pub use memory::MemoryLogStorage;

use crate::error::Result;

pub type Address = u64;

/// Outcome of a storage read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    /// `len` bytes were copied into the buffer; continue reading at `next`.
    Read { len: usize, next: Address },
    InvalidAddress,
    /// Nothing has been written at this address yet.
    NoData,
    /// Block storages only: the block does not fit, retry with `required` bytes.
    InsufficientBufferCapacity { required: usize },
}

/// Durable append/read of byte blocks.
///
/// One writer appends while any number of readers read. Implementations use
/// interior mutability so a single instance can be shared behind an `Arc`.
pub trait LogStorage: Send + Sync {
    /// Byte-addressable storages accept any address inside written data.
    /// Block storages only accept addresses returned by `append`.
    fn is_byte_addressable(&self) -> bool;

    /// Appends the block entirely or not at all and returns its address.
    fn append(&self, block: &[u8]) -> Result<Address>;

    fn read(&self, buf: &mut [u8], address: Address) -> Result<ReadResult>;

    fn first_block_address(&self) -> Option<Address>;

    /// Makes every appended block durable. Must precede acknowledging
    /// replication; a no-op only for storages that are synchronous already.
    fn flush(&self) -> Result<()>;

    /// Removes everything at and after `address`.
    fn truncate(&self, address: Address) -> Result<()>;

    /// Releases data strictly before `address` where the storage can do so
    /// at its own granularity. Returns the new first address.
    fn compact(&self, address: Address) -> Result<Option<Address>>;
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::collections::VecDeque;
use std::sync::RwLock;

use super::{Address, LogStorage, ReadResult};
use crate::error::{LogStreamError, Result};

struct Blocks {
    /// Address of the first retained block.
    base: Address,
    blocks: VecDeque<Vec<u8>>,
}

/// Block-addressable in-memory storage. Every append is one block and every
/// read returns exactly one block.
pub struct MemoryLogStorage {
    inner: RwLock<Blocks>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Blocks {
                base: 0,
                blocks: VecDeque::new(),
            }),
        }
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().map(|b| b.blocks.len()).unwrap_or(0)
    }
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> LogStreamError {
    LogStreamError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "memory storage lock poisoned",
    ))
}

impl LogStorage for MemoryLogStorage {
    fn is_byte_addressable(&self) -> bool {
        false
    }

    fn append(&self, block: &[u8]) -> Result<Address> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let address = inner.base + inner.blocks.len() as Address;
        inner.blocks.push_back(block.to_vec());
        Ok(address)
    }

    fn read(&self, buf: &mut [u8], address: Address) -> Result<ReadResult> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        if address < inner.base {
            return Ok(ReadResult::InvalidAddress);
        }

        let index = (address - inner.base) as usize;
        match inner.blocks.get(index) {
            None if index == inner.blocks.len() => Ok(ReadResult::NoData),
            None => Ok(ReadResult::InvalidAddress),
            Some(block) if block.len() > buf.len() => Ok(ReadResult::InsufficientBufferCapacity {
                required: block.len(),
            }),
            Some(block) => {
                buf[..block.len()].copy_from_slice(block);
                Ok(ReadResult::Read {
                    len: block.len(),
                    next: address + 1,
                })
            }
        }
    }

    fn first_block_address(&self) -> Option<Address> {
        let inner = self.inner.read().ok()?;
        (!inner.blocks.is_empty()).then_some(inner.base)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, address: Address) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if address < inner.base {
            return Err(LogStreamError::InvalidAddress(address));
        }
        let keep = (address - inner.base) as usize;
        inner.blocks.truncate(keep);
        Ok(())
    }

    fn compact(&self, address: Address) -> Result<Option<Address>> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        while inner.base < address && !inner.blocks.is_empty() {
            inner.blocks.pop_front();
            inner.base += 1;
        }
        Ok((!inner.blocks.is_empty()).then_some(inner.base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_reads() {
        let storage = MemoryLogStorage::new();
        assert_eq!(storage.first_block_address(), None);

        let a = storage.append(b"first block").unwrap();
        let b = storage.append(b"second").unwrap();
        assert_eq!((a, b), (0, 1));

        let mut small = [0u8; 4];
        assert_eq!(
            storage.read(&mut small, a).unwrap(),
            ReadResult::InsufficientBufferCapacity { required: 11 }
        );

        let mut buf = [0u8; 32];
        assert_eq!(
            storage.read(&mut buf, a).unwrap(),
            ReadResult::Read { len: 11, next: 1 }
        );
        assert_eq!(&buf[..11], b"first block");
        assert_eq!(storage.read(&mut buf, 2).unwrap(), ReadResult::NoData);
        assert_eq!(storage.read(&mut buf, 9).unwrap(), ReadResult::InvalidAddress);
    }

    #[test]
    fn test_truncate_and_compact() {
        let storage = MemoryLogStorage::new();
        for i in 0..5u8 {
            storage.append(&[i]).unwrap();
        }

        storage.truncate(3).unwrap();
        assert_eq!(storage.block_count(), 3);

        assert_eq!(storage.compact(2).unwrap(), Some(2));
        let mut buf = [0u8; 4];
        assert_eq!(storage.read(&mut buf, 1).unwrap(), ReadResult::InvalidAddress);
        assert_eq!(storage.read(&mut buf, 2).unwrap(), ReadResult::Read { len: 1, next: 3 });
        assert_eq!(storage.append(&[9]).unwrap(), 3);
    }
}

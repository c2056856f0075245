// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Partition-unique keys.
//!
//! The upper bits of a key carry the partition id, so any key can be routed
//! back to the partition that created it.

use serde::{Deserialize, Serialize};

use super::journal::TxCell;

pub const PARTITION_ID_BITS: u32 = 51;

pub fn encode_partition_id(partition_id: u32, key: i64) -> i64 {
    ((partition_id as i64) << PARTITION_ID_BITS) + key
}

pub fn decode_partition_id(key: i64) -> u32 {
    (key >> PARTITION_ID_BITS) as u32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyGenerator {
    next: TxCell<i64>,
}

impl KeyGenerator {
    pub fn new(partition_id: u32) -> Self {
        Self {
            next: TxCell::new(encode_partition_id(partition_id, 1)),
        }
    }

    pub fn next_key(&mut self) -> i64 {
        let key = *self.next.get();
        self.next.set(key + 1);
        key
    }

    pub fn peek(&self) -> i64 {
        *self.next.get()
    }

    pub fn commit(&mut self) {
        self.next.commit();
    }

    pub fn rollback(&mut self) {
        self.next.rollback();
    }
}

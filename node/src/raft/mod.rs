// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Raft replication of a partition log.
//!
//! # Architecture
//! - `state` = the role machine; handlers return actions, the partition
//!   actor performs them
//! - `messages` = the RPCs, bincode on the wire
//! - `meta` = term and vote, persisted before any vote is answered
//! - `replicator` = pull-based catch-up for lagging followers
//!
//! # Invariants
//! - at most one vote per term
//! - the commit position only advances through entries of the current term
//! - committed entries are never truncated

pub mod messages;
pub mod meta;
pub mod replicator;
pub mod state;

use brook_logstream::LogStreamError;
use thiserror::Error;

pub use messages::*;
pub use meta::{MetaStore, PersistedMeta};
pub use replicator::{
    replicate, serve_replicate, LogAppender, LogReplicator, ReplicationClient, ReplicationError, ReplicationStep,
    ReplicatorState,
};
pub use state::{RaftAction, RaftLog, RaftState, RaftTimeouts, Role};

pub type NodeId = u64;
pub type Term = i32;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Log error: {0}")]
    Log(#[from] LogStreamError),
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Raft meta error: {0}")]
    Meta(String),
    #[error("Leader sent an entry at committed position {position} that conflicts with the local log")]
    CommittedConflict { position: i64 },
}

pub type RaftResult<T> = std::result::Result<T, RaftError>;

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! brook-node: runs the partitions of a brook cluster.
//!
//! Each partition is an actor ([`partition::PartitionActor`]) owning its log,
//! its raft role and, while it leads, its [`processor::StreamProcessor`].
//! [`broker::Broker`] starts them, [`server`] exposes them over HTTP.

pub mod api;
pub mod broker;
pub mod codec;
pub mod config;
pub mod errors;
pub mod partition;
pub mod processor;
pub mod raft;
pub mod server;
pub mod telemetry;
pub mod transport;

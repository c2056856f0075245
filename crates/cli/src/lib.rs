// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! brook-cli: offline tooling for the data directory of one partition.
//!
//! Point it at `<data_dir>/partition-<id>`. Nothing here talks to a running
//! node; stop the node first so the log is not appended to underneath.

pub mod commands;
pub mod engine;
pub mod partition_dir;

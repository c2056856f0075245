// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{NodeError, NodeResult};

/// When the stream processor writes a state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Records processed since the last snapshot.
    pub every_n_records: u64,
    /// Minimum time between two snapshots, in milliseconds.
    pub min_interval_ms: u64,
}

impl SnapshotPolicy {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            every_n_records: 1_000,
            min_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: u64,
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub partition_count: u32,
    /// Every member of the cluster, this node included: id -> base url.
    pub members: BTreeMap<u64, String>,
    pub election_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub segment_size: u64,
    pub max_append_batch_bytes: usize,
    pub snapshot_policy: SnapshotPolicy,
    pub snapshots_to_keep: usize,
    pub timer_check_interval_ms: u64,
    /// How long a replicate request may stay unanswered.
    pub replication_timeout_ms: u64,
    pub max_request_body_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let bind_addr = SocketAddr::from(([127, 0, 0, 1], 26500));
        Self {
            node_id: 1,
            bind_addr,
            data_dir: PathBuf::from("data"),
            partition_count: 1,
            members: BTreeMap::from([(1, format!("http://{bind_addr}"))]),
            election_timeout_ms: 1_000,
            heartbeat_interval_ms: 250,
            segment_size: 64 * 1024 * 1024,
            max_append_batch_bytes: 1024 * 1024,
            snapshot_policy: SnapshotPolicy::default(),
            snapshots_to_keep: 2,
            timer_check_interval_ms: 100,
            replication_timeout_ms: 5_000,
            max_request_body_bytes: 4 * 1024 * 1024,
        }
    }
}

impl NodeConfig {
    /// Reads a JSON config file. Missing fields fall back to the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| NodeError::InvalidInput(format!("Cannot read config {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| NodeError::InvalidInput(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Defaults overridden by `BROOK_*` environment variables.
    pub fn from_env() -> NodeResult<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `BROOK_*` overrides read through `lookup`.
    ///
    /// `BROOK_MEMBERS` has the form `1=http://a:26500,2=http://b:26500`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> NodeResult<Self> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> NodeResult<T> {
            value
                .trim()
                .parse()
                .map_err(|_| NodeError::InvalidInput(format!("{key} has an invalid value '{value}'")))
        }

        if let Some(v) = lookup("BROOK_NODE_ID") {
            self.node_id = parse("BROOK_NODE_ID", v)?;
        }
        if let Some(v) = lookup("BROOK_BIND_ADDR") {
            self.bind_addr = parse("BROOK_BIND_ADDR", v)?;
        }
        if let Some(v) = lookup("BROOK_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BROOK_PARTITION_COUNT") {
            self.partition_count = parse("BROOK_PARTITION_COUNT", v)?;
        }
        if let Some(v) = lookup("BROOK_MEMBERS") {
            self.members = parse_members(&v)?;
        }
        if let Some(v) = lookup("BROOK_ELECTION_TIMEOUT_MS") {
            self.election_timeout_ms = parse("BROOK_ELECTION_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("BROOK_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = parse("BROOK_HEARTBEAT_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("BROOK_SNAPSHOT_EVERY_N_RECORDS") {
            self.snapshot_policy.every_n_records = parse("BROOK_SNAPSHOT_EVERY_N_RECORDS", v)?;
        }
        if let Some(v) = lookup("BROOK_SNAPSHOTS_TO_KEEP") {
            self.snapshots_to_keep = parse("BROOK_SNAPSHOTS_TO_KEEP", v)?;
        }
        if let Some(v) = lookup("BROOK_TIMER_CHECK_INTERVAL_MS") {
            self.timer_check_interval_ms = parse("BROOK_TIMER_CHECK_INTERVAL_MS", v)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> NodeResult<()> {
        if self.partition_count == 0 {
            return Err(NodeError::InvalidInput("partition_count must be at least 1".into()));
        }
        if !self.members.contains_key(&self.node_id) {
            return Err(NodeError::InvalidInput(format!(
                "node {} is not one of the cluster members",
                self.node_id
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.election_timeout_ms {
            return Err(NodeError::InvalidInput(
                "heartbeat_interval_ms must be positive and below election_timeout_ms".into(),
            ));
        }
        Ok(())
    }

    /// Members other than this node.
    pub fn peers(&self) -> Vec<u64> {
        self.members.keys().copied().filter(|id| *id != self.node_id).collect()
    }

    pub fn partition_dir(&self, partition_id: u32) -> PathBuf {
        self.data_dir.join(format!("partition-{partition_id}"))
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn timer_check_interval(&self) -> Duration {
        Duration::from_millis(self.timer_check_interval_ms)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }
}

fn parse_members(text: &str) -> NodeResult<BTreeMap<u64, String>> {
    let mut members = BTreeMap::new();
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, url) = part
            .split_once('=')
            .ok_or_else(|| NodeError::InvalidInput(format!("member '{part}' is not of the form id=url")))?;
        let id = id
            .trim()
            .parse()
            .map_err(|_| NodeError::InvalidInput(format!("member id '{id}' is not a number")))?;
        members.insert(id, url.trim().trim_end_matches('/').to_string());
    }
    Ok(members)
}

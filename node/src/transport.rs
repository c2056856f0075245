// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! How raft messages reach other members.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::errors::{NodeError, NodeResult};
use crate::partition::PartitionHandle;
use crate::raft::{self, NodeId, RaftRequest, RaftResponse};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request(&self, to: NodeId, partition_id: u32, request: RaftRequest) -> NodeResult<RaftResponse>;
}

/// Members reachable in-process, for tests and single-binary clusters.
#[derive(Default)]
pub struct InMemoryNetwork {
    partitions: RwLock<HashMap<(NodeId, u32), PartitionHandle>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The transport `node` uses to reach the others.
    pub fn transport_for(self: &Arc<Self>, node: NodeId) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            from: node,
            network: self.clone(),
        })
    }

    pub fn register(&self, node: NodeId, handle: PartitionHandle) {
        if let Ok(mut partitions) = self.partitions.write() {
            partitions.insert((node, handle.partition_id()), handle);
        }
    }

    /// Drops every message from or to `node` until [`Self::heal`].
    pub fn isolate(&self, node: NodeId) {
        if let Ok(mut isolated) = self.isolated.write() {
            isolated.insert(node);
        }
    }

    pub fn heal(&self, node: NodeId) {
        if let Ok(mut isolated) = self.isolated.write() {
            isolated.remove(&node);
        }
    }

    fn route(&self, from: NodeId, to: NodeId, partition_id: u32) -> NodeResult<PartitionHandle> {
        let isolated = self
            .isolated
            .read()
            .map_err(|_| NodeError::Transport("network lock poisoned".into()))?;
        if isolated.contains(&from) || isolated.contains(&to) {
            return Err(NodeError::Transport(format!("node {to} is unreachable from {from}")));
        }
        drop(isolated);

        self.partitions
            .read()
            .map_err(|_| NodeError::Transport("network lock poisoned".into()))?
            .get(&(to, partition_id))
            .cloned()
            .ok_or_else(|| NodeError::Transport(format!("node {to} has no partition {partition_id}")))
    }
}

pub struct InMemoryTransport {
    from: NodeId,
    network: Arc<InMemoryNetwork>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request(&self, to: NodeId, partition_id: u32, request: RaftRequest) -> NodeResult<RaftResponse> {
        let handle = self.network.route(self.from, to, partition_id)?;
        handle.raft_request(request).await
    }
}

/// Raft over `POST {member}/v1/raft/{partition}/{vote|append|replicate}`,
/// bincode bodies.
pub struct HttpTransport {
    members: BTreeMap<NodeId, String>,
    client: Client,
}

impl HttpTransport {
    pub fn new(members: BTreeMap<NodeId, String>, timeout: Duration) -> NodeResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        Ok(Self { members, client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, to: NodeId, partition_id: u32, request: RaftRequest) -> NodeResult<RaftResponse> {
        let base_url = self
            .members
            .get(&to)
            .ok_or_else(|| NodeError::Transport(format!("unknown member {to}")))?;
        let url = format!("{}/v1/raft/{}/{}", base_url, partition_id, request.endpoint());
        let body = raft::encode(&request)?;

        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NodeError::Transport(format!("{} answered {}", url, resp.status())));
        }

        let bytes = resp.bytes().await.map_err(|e| NodeError::Transport(e.to_string()))?;
        Ok(raft::decode(&bytes)?)
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::info;

use crate::config::NodeConfig;
use crate::errors::{NodeError, NodeResult};
use crate::partition::{PartitionActor, PartitionHandle, PartitionStatus};
use crate::transport::Transport;

/// The partitions this node hosts. Every member hosts every partition.
pub struct Broker {
    config: Arc<NodeConfig>,
    partitions: BTreeMap<u32, PartitionHandle>,
}

impl Broker {
    /// Opens partitions `1..=partition_count` and starts their actors.
    pub fn start(config: NodeConfig, transport: Arc<dyn Transport>) -> NodeResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let mut partitions = BTreeMap::new();
        for partition_id in 1..=config.partition_count {
            let handle = PartitionActor::spawn(partition_id, config.clone(), transport.clone())?;
            partitions.insert(partition_id, handle);
        }

        info!(
            "Node {} started {} partitions with {} peers",
            config.node_id,
            partitions.len(),
            config.peers().len()
        );
        Ok(Self { config, partitions })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_id(&self) -> u64 {
        self.config.node_id
    }

    pub fn partition(&self, partition_id: u32) -> NodeResult<&PartitionHandle> {
        self.partitions
            .get(&partition_id)
            .ok_or(NodeError::UnknownPartition(partition_id))
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionHandle> {
        self.partitions.values()
    }

    /// Asks every partition at once; the slowest one bounds the answer.
    pub async fn statuses(&self) -> NodeResult<Vec<PartitionStatus>> {
        join_all(self.partitions.values().map(|handle| handle.status()))
            .await
            .into_iter()
            .collect()
    }

    /// Stops every partition, taking a last snapshot where it leads.
    pub async fn shutdown(&self) {
        join_all(self.partitions.values().map(|handle| handle.shutdown())).await;
        info!("Node {} shut down", self.config.node_id);
    }
}

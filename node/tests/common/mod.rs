// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use brook_kernel::bpmn::ProcessBuilder;
use brook_kernel::record::{DeploymentRecord, DeploymentResource};
use brook_node::broker::Broker;
use brook_node::config::{NodeConfig, SnapshotPolicy};
use brook_node::partition::PartitionStatus;
use brook_node::raft::Role;
use brook_node::transport::InMemoryNetwork;
use tokio::time::{sleep, Duration, Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").with_test_writer().try_init();
}

pub fn node_config(node_id: u64, members: &[u64], data_dir: &Path) -> NodeConfig {
    NodeConfig {
        node_id,
        data_dir: data_dir.join(format!("node-{node_id}")),
        members: members
            .iter()
            .map(|id| (*id, format!("http://node-{id}")))
            .collect::<BTreeMap<_, _>>(),
        election_timeout_ms: 200,
        heartbeat_interval_ms: 40,
        timer_check_interval_ms: 20,
        replication_timeout_ms: 1_000,
        snapshot_policy: SnapshotPolicy {
            every_n_records: 10_000,
            min_interval_ms: 0,
        },
        ..Default::default()
    }
}

/// Starts one broker per member, all wired through `network`.
pub fn start_cluster(network: &Arc<InMemoryNetwork>, members: &[u64], data_dir: &Path) -> BTreeMap<u64, Broker> {
    members
        .iter()
        .map(|id| (*id, start_node(network, node_config(*id, members, data_dir))))
        .collect()
}

pub fn start_node(network: &Arc<InMemoryNetwork>, config: NodeConfig) -> Broker {
    let node_id = config.node_id;
    let broker = Broker::start(config, network.transport_for(node_id)).unwrap();
    for handle in broker.partitions() {
        network.register(node_id, handle.clone());
    }
    broker
}

pub async fn status(broker: &Broker, partition_id: u32) -> PartitionStatus {
    broker.partition(partition_id).unwrap().status().await.unwrap()
}

/// Polls until `check` holds or the deadline passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// The node whose processor leads `partition_id`, ignoring `excluded`.
pub async fn wait_for_leader(brokers: &BTreeMap<u64, Broker>, partition_id: u32, excluded: &[u64]) -> u64 {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        for (id, broker) in brokers {
            if excluded.contains(id) {
                continue;
            }
            let status = status(broker, partition_id).await;
            if status.role == Role::Leader && status.processor.is_some() {
                return *id;
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("no leader for partition {partition_id}");
}

pub fn service_task_process(process_id: &str, job_type: &str) -> ProcessBuilder {
    ProcessBuilder::new(process_id)
        .start_event("start")
        .service_task("task", job_type)
        .end_event("end")
        .sequence(&["start", "task", "end"])
}

pub fn deployment(builder: ProcessBuilder) -> DeploymentRecord {
    let model = builder.build();
    DeploymentRecord {
        resources: vec![DeploymentResource {
            name: format!("{}.json", model.process_id),
            content: model.to_json(),
        }],
        processes: Vec::new(),
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use std::collections::BTreeMap;

use brook_kernel::record::{JobBatchRecord, ProcessInstanceCreationRecord, RecordValue};
use brook_node::broker::Broker;
use brook_node::errors::NodeError;
use brook_node::partition::ClientCommand;
use brook_node::transport::InMemoryNetwork;
use common::*;
use tempfile::tempdir;

const MEMBERS: [u64; 3] = [1, 2, 3];

fn create(process_id: &str) -> ClientCommand {
    ClientCommand::CreateInstance(ProcessInstanceCreationRecord {
        bpmn_process_id: process_id.into(),
        ..Default::default()
    })
}

fn activate(job_type: &str) -> ClientCommand {
    ClientCommand::ActivateJobs(JobBatchRecord {
        job_type: job_type.into(),
        worker: "w1".into(),
        timeout: 60_000,
        max_jobs_to_activate: 10,
        job_keys: Vec::new(),
        jobs: Vec::new(),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_nodes_elect_one_leader_and_replicate() {
    init_tracing();
    let dir = tempdir().unwrap();
    let network = InMemoryNetwork::new();
    let brokers = start_cluster(&network, &MEMBERS, dir.path());

    let leader = wait_for_leader(&brokers, 1, &[]).await;
    let handle = brokers[&leader].partition(1).unwrap();
    let deployed = handle
        .submit(ClientCommand::Deploy(deployment(service_task_process("order", "ship"))))
        .await
        .unwrap();
    assert_eq!(deployed.rejection, None);
    let created = handle.submit(create("order")).await.unwrap();
    assert_eq!(created.rejection, None);

    let leader_status = status(&brokers[&leader], 1).await;
    for (id, broker) in &brokers {
        if *id == leader {
            continue;
        }
        let (commit, last) = (leader_status.commit_position, leader_status.last_position);
        eventually("followers to catch up", move || async move {
            let follower = status(broker, 1).await;
            follower.commit_position >= commit && follower.last_position >= last
        })
        .await;

        let follower = status(broker, 1).await;
        assert_eq!(follower.leader, Some(leader));
        assert!(follower.processor.is_none());

        // Followers only store records.
        let err = broker.partition(1).unwrap().submit(create("order")).await.unwrap_err();
        assert!(matches!(err, NodeError::NotLeader { leader: Some(l), .. } if l == leader));
    }

    for broker in brokers.values() {
        broker.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_leader_continues_after_failover() {
    init_tracing();
    let dir = tempdir().unwrap();
    let network = InMemoryNetwork::new();
    let brokers = start_cluster(&network, &MEMBERS, dir.path());

    let first = wait_for_leader(&brokers, 1, &[]).await;
    let handle = brokers[&first].partition(1).unwrap();
    handle
        .submit(ClientCommand::Deploy(deployment(service_task_process("order", "ship"))))
        .await
        .unwrap();
    let created = handle.submit(create("order")).await.unwrap();
    assert_eq!(created.rejection, None);
    let committed = status(&brokers[&first], 1).await.commit_position;

    network.isolate(first);
    let second = wait_for_leader(&brokers, 1, &[first]).await;
    assert_ne!(second, first);

    let new_status = status(&brokers[&second], 1).await;
    assert!(new_status.term > 0);
    assert!(new_status.commit_position > committed);
    assert_eq!(new_status.processor.as_ref().unwrap().state.process_instances, 1);

    // The job created under the old leader is still there.
    let handle = brokers[&second].partition(1).unwrap();
    let batch = handle.submit(activate("ship")).await.unwrap();
    let RecordValue::JobBatch(batch) = batch.value else {
        panic!("expected a job batch, got {:?}", batch.value);
    };
    assert_eq!(batch.job_keys.len(), 1);
    let completed = handle
        .submit(ClientCommand::CompleteJob {
            job_key: batch.job_keys[0],
            variables: Default::default(),
        })
        .await
        .unwrap();
    assert_eq!(completed.rejection, None);

    // The old leader rejoins as a follower and catches up.
    network.heal(first);
    let target = status(&brokers[&second], 1).await.last_position;
    let old_leader = &brokers[&first];
    eventually("the old leader to follow", move || async move {
        let rejoined = status(old_leader, 1).await;
        rejoined.leader == Some(second) && rejoined.last_position >= target && rejoined.processor.is_none()
    })
    .await;

    for broker in brokers.values() {
        broker.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restarted_node_recovers_its_state() {
    init_tracing();
    let dir = tempdir().unwrap();
    let network = InMemoryNetwork::new();

    let broker = start_node(&network, node_config(1, &[1], dir.path()));
    let brokers: BTreeMap<u64, Broker> = [(1, broker)].into_iter().collect();
    wait_for_leader(&brokers, 1, &[]).await;
    let handle = brokers[&1].partition(1).unwrap();
    handle
        .submit(ClientCommand::Deploy(deployment(service_task_process("order", "ship"))))
        .await
        .unwrap();
    handle.submit(create("order")).await.unwrap();
    let snapshot = handle.snapshot().await.unwrap().expect("snapshot taken");
    handle.submit(create("order")).await.unwrap();

    let before = status(&brokers[&1], 1).await;
    brokers[&1].shutdown().await;
    drop(brokers);

    let network = InMemoryNetwork::new();
    let broker = start_node(&network, node_config(1, &[1], dir.path()));
    let brokers: BTreeMap<u64, Broker> = [(1, broker)].into_iter().collect();
    wait_for_leader(&brokers, 1, &[]).await;

    let after = status(&brokers[&1], 1).await;
    assert!(after.term > before.term);
    assert!(after.last_position > before.last_position);
    let processor = after.processor.unwrap();
    assert!(processor.last_snapshot_position >= snapshot.position);
    assert_eq!(processor.state.process_instances, 2);
    assert_eq!(processor.state.jobs, 2);

    brokers[&1].shutdown().await;
}

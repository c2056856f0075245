// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! One actor per partition.
//!
//! # Architecture
//! - the actor owns the log, the raft role machine, the snapshot store and,
//!   while it leads, the stream processor
//! - everything else talks to it through [`PartitionHandle`] (mpsc inbox,
//!   oneshot replies); there are no locks around partition state
//! - outgoing raft messages run on spawned tasks and come back as inbox
//!   messages
//!
//! # Invariants
//! - only the leader processes records; a follower only stores them
//! - a new leader writes an initial entry in its term, then recovers its
//!   processor from the latest snapshot and the log
//! - a client hears back only after its command was committed and processed

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use brook_kernel::engine::CommandResponse;
use brook_kernel::expr::Document;
use brook_kernel::record::*;
use brook_kernel::state::{Incident, StateSummary};
use brook_kernel::{EngineState, TypedRecord};
use brook_logstream::{FileLogStorage, LogAppendEntry, LogStream, SnapshotMetadata, SnapshotStore};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::NodeConfig;
use crate::errors::{NodeError, NodeResult};
use crate::processor::{Health, StreamProcessor};
use crate::raft::{
    self, LogReplicator, MetaStore, NodeId, RaftAction, RaftRequest, RaftResponse, RaftState, RaftTimeouts,
    ReplicateResponse, ReplicationError, ReplicationStep, Role,
};
use crate::transport::Transport;

const INBOX_CAPACITY: usize = 1024;
const RECORDS_CAPACITY: usize = 4096;

/// A command a client asks the leader to write.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Deploy(DeploymentRecord),
    CreateInstance(ProcessInstanceCreationRecord),
    CancelInstance(i64),
    CompleteJob { job_key: i64, variables: Document },
    FailJob { job_key: i64, retries: i32, error_message: String },
    UpdateJobRetries { job_key: i64, retries: i32 },
    ActivateJobs(JobBatchRecord),
    PublishMessage(MessageRecord),
    ResolveIncident(i64),
    UpdateVariables(VariableDocumentRecord),
}

impl ClientCommand {
    /// The log entry for this command. Commands that name an existing
    /// entity carry its current record when the state knows it; the engine
    /// rejects the unknown ones.
    fn to_entry(&self, state: &EngineState) -> NodeResult<LogAppendEntry> {
        let entry = match self {
            ClientCommand::Deploy(record) => codec::command_entry(NO_KEY, DeploymentIntent::Create, record.clone()),
            ClientCommand::CreateInstance(record) => {
                codec::command_entry(NO_KEY, ProcessInstanceCreationIntent::Create, record.clone())
            }
            ClientCommand::CancelInstance(key) => {
                let record = state
                    .element_instance(*key)
                    .map(|i| i.record.clone())
                    .unwrap_or_else(|| ProcessInstanceRecord {
                        bpmn_process_id: String::new(),
                        version: -1,
                        process_definition_key: NO_KEY,
                        process_instance_key: *key,
                        element_id: String::new(),
                        flow_scope_key: NO_KEY,
                        bpmn_element_type: BpmnElementType::Process,
                    });
                codec::command_entry(*key, ProcessInstanceIntent::Cancel, record)
            }
            ClientCommand::CompleteJob { job_key, variables } => codec::command_entry(
                *job_key,
                JobIntent::Complete,
                JobRecord {
                    variables: variables.clone(),
                    ..Default::default()
                },
            ),
            ClientCommand::FailJob {
                job_key,
                retries,
                error_message,
            } => codec::command_entry(
                *job_key,
                JobIntent::Fail,
                JobRecord {
                    retries: *retries,
                    error_message: error_message.clone(),
                    ..Default::default()
                },
            ),
            ClientCommand::UpdateJobRetries { job_key, retries } => codec::command_entry(
                *job_key,
                JobIntent::UpdateRetries,
                JobRecord {
                    retries: *retries,
                    ..Default::default()
                },
            ),
            ClientCommand::ActivateJobs(record) => codec::command_entry(NO_KEY, JobBatchIntent::Activate, record.clone()),
            ClientCommand::PublishMessage(record) => codec::command_entry(NO_KEY, MessageIntent::Publish, record.clone()),
            ClientCommand::ResolveIncident(key) => {
                let record = state
                    .incident(*key)
                    .map(|i| i.record.clone())
                    .unwrap_or_else(|| IncidentRecord {
                        error_type: ErrorType::ExtractValueError,
                        error_message: String::new(),
                        bpmn_process_id: String::new(),
                        process_definition_key: NO_KEY,
                        process_instance_key: NO_KEY,
                        element_id: String::new(),
                        element_instance_key: NO_KEY,
                        job_key: NO_KEY,
                        variable_scope_key: NO_KEY,
                    });
                codec::command_entry(*key, IncidentIntent::Resolve, record)
            }
            ClientCommand::UpdateVariables(record) => {
                codec::command_entry(NO_KEY, VariableDocumentIntent::Update, record.clone())
            }
        };
        Ok(entry?)
    }
}

/// Snapshot of a partition for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionStatus {
    pub partition_id: u32,
    pub node_id: NodeId,
    pub role: Role,
    pub term: i32,
    pub leader: Option<NodeId>,
    pub first_position: i64,
    pub last_position: i64,
    pub commit_position: i64,
    pub replicating: bool,
    /// Present on the leader only.
    pub processor: Option<ProcessorStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessorStatus {
    pub health: Health,
    pub last_processed_position: i64,
    pub last_snapshot_position: i64,
    pub state: StateSummary,
}

enum PartitionMessage {
    Command {
        command: ClientCommand,
        reply: oneshot::Sender<NodeResult<CommandResponse>>,
    },
    Raft {
        request: RaftRequest,
        reply: oneshot::Sender<NodeResult<RaftResponse>>,
    },
    RaftReply {
        from: NodeId,
        response: RaftResponse,
    },
    RpcFailed {
        to: NodeId,
    },
    ReplicateReply(Result<ReplicateResponse, ReplicationError>),
    Status(oneshot::Sender<PartitionStatus>),
    Incidents(oneshot::Sender<NodeResult<Vec<Incident>>>),
    Pause(oneshot::Sender<NodeResult<()>>),
    Resume(oneshot::Sender<NodeResult<()>>),
    Snapshot(oneshot::Sender<NodeResult<Option<SnapshotMetadata>>>),
    LatestSnapshot(oneshot::Sender<NodeResult<Option<(i64, PathBuf)>>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable address of a partition actor.
#[derive(Clone)]
pub struct PartitionHandle {
    partition_id: u32,
    tx: mpsc::Sender<PartitionMessage>,
    records: broadcast::Sender<TypedRecord>,
}

impl PartitionHandle {
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    async fn ask<T>(&self, message: impl FnOnce(oneshot::Sender<T>) -> PartitionMessage) -> NodeResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(message(reply))
            .await
            .map_err(|_| NodeError::Stopped(self.partition_id))?;
        rx.await.map_err(|_| NodeError::Stopped(self.partition_id))
    }

    /// Writes the command and waits until it was processed.
    pub async fn submit(&self, command: ClientCommand) -> NodeResult<CommandResponse> {
        self.ask(|reply| PartitionMessage::Command { command, reply }).await?
    }

    pub async fn raft_request(&self, request: RaftRequest) -> NodeResult<RaftResponse> {
        self.ask(|reply| PartitionMessage::Raft { request, reply }).await?
    }

    pub async fn status(&self) -> NodeResult<PartitionStatus> {
        self.ask(PartitionMessage::Status).await
    }

    pub async fn incidents(&self) -> NodeResult<Vec<Incident>> {
        self.ask(PartitionMessage::Incidents).await?
    }

    pub async fn pause(&self) -> NodeResult<()> {
        self.ask(PartitionMessage::Pause).await?
    }

    pub async fn resume(&self) -> NodeResult<()> {
        self.ask(PartitionMessage::Resume).await?
    }

    pub async fn snapshot(&self) -> NodeResult<Option<SnapshotMetadata>> {
        self.ask(PartitionMessage::Snapshot).await?
    }

    /// Position and file of the newest snapshot on this node.
    pub async fn latest_snapshot(&self) -> NodeResult<Option<(i64, PathBuf)>> {
        self.ask(PartitionMessage::LatestSnapshot).await?
    }

    /// Live tail of the records this node's processor sees committed.
    pub fn subscribe(&self) -> broadcast::Receiver<TypedRecord> {
        self.records.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.ask(PartitionMessage::Shutdown).await;
    }
}

pub struct PartitionActor {
    partition_id: u32,
    node_id: NodeId,
    config: Arc<NodeConfig>,
    log: LogStream,
    snapshots: SnapshotStore,
    meta: MetaStore,
    raft: RaftState,
    processor: Option<StreamProcessor>,
    /// Why the processor could not be recovered.
    recovery_failure: Option<String>,
    transport: Arc<dyn Transport>,
    inbox: mpsc::Receiver<PartitionMessage>,
    outbox: mpsc::WeakSender<PartitionMessage>,
    pending: BTreeMap<i64, oneshot::Sender<NodeResult<CommandResponse>>>,
    appends_in_flight: HashSet<NodeId>,
    replicator: Option<(NodeId, LogReplicator)>,
    records: broadcast::Sender<TypedRecord>,
    started: Instant,
}

impl PartitionActor {
    /// Opens the partition's storage under the configured data directory.
    pub fn open(
        partition_id: u32,
        config: Arc<NodeConfig>,
        transport: Arc<dyn Transport>,
    ) -> NodeResult<(Self, PartitionHandle)> {
        let dir = config.partition_dir(partition_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| NodeError::InvalidInput(format!("Cannot create {}: {}", dir.display(), e)))?;

        let storage = FileLogStorage::open_with_segment_size(dir.join("log"), config.segment_size)?;
        let log = LogStream::open(Arc::new(storage), partition_id)?;
        let snapshots = SnapshotStore::open(dir.join("snapshots"))?;
        let meta = MetaStore::new(&dir);
        let persisted = meta.load()?;

        let started = Instant::now();
        let raft = RaftState::new(
            config.node_id,
            config.peers(),
            persisted,
            RaftTimeouts {
                election_timeout_ms: config.election_timeout_ms,
                heartbeat_interval_ms: config.heartbeat_interval_ms,
            },
            config.max_append_batch_bytes,
            0,
        );

        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (records, _) = broadcast::channel(RECORDS_CAPACITY);
        let handle = PartitionHandle {
            partition_id,
            tx: tx.clone(),
            records: records.clone(),
        };

        info!(
            "Opened partition {} on node {} (term {}, log up to {})",
            partition_id,
            config.node_id,
            persisted.term,
            log.last_position()
        );

        Ok((
            Self {
                partition_id,
                node_id: config.node_id,
                config,
                log,
                snapshots,
                meta,
                raft,
                processor: None,
                recovery_failure: None,
                transport,
                inbox,
                outbox: tx.downgrade(),
                pending: BTreeMap::new(),
                appends_in_flight: HashSet::new(),
                replicator: None,
                records,
                started,
            },
            handle,
        ))
    }

    /// Opens the partition and runs its actor on the tokio runtime.
    pub fn spawn(partition_id: u32, config: Arc<NodeConfig>, transport: Arc<dyn Transport>) -> NodeResult<PartitionHandle> {
        let (actor, handle) = Self::open(partition_id, config, transport)?;
        tokio::spawn(actor.run());
        Ok(handle)
    }

    pub async fn run(mut self) {
        let tick_every = Duration::from_millis((self.config.heartbeat_interval_ms / 2).max(5));
        let mut ticks = tokio::time::interval(tick_every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut timer_checks = tokio::time::interval(self.config.timer_check_interval());
        timer_checks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(PartitionMessage::Shutdown(reply)) => {
                        self.close();
                        let _ = reply.send(());
                        break;
                    }
                    Some(message) => self.handle(message),
                    None => {
                        self.close();
                        break;
                    }
                },
                _ = ticks.tick() => self.on_tick(),
                _ = timer_checks.tick() => self.write_scheduled_commands(),
            }
            self.drive();
        }
        info!("Partition {} on node {} stopped", self.partition_id, self.node_id);
    }

    /// Raft clock: milliseconds since the actor started.
    fn clock(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn wall_clock() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn handle(&mut self, message: PartitionMessage) {
        match message {
            PartitionMessage::Command { command, reply } => self.on_command(command, reply),
            PartitionMessage::Raft { request, reply } => {
                let response = self.on_raft_request(request);
                let _ = reply.send(response);
            }
            PartitionMessage::RaftReply { from, response } => self.on_raft_reply(from, response),
            PartitionMessage::RpcFailed { to } => {
                self.appends_in_flight.remove(&to);
            }
            PartitionMessage::ReplicateReply(result) => self.on_replicate_reply(result),
            PartitionMessage::Status(reply) => {
                let _ = reply.send(self.status());
            }
            PartitionMessage::Incidents(reply) => {
                let incidents = self.leading_processor().map(|p| p.open_incidents());
                let _ = reply.send(incidents);
            }
            PartitionMessage::Pause(reply) => {
                let _ = reply.send(self.leading_processor_mut().map(|p| p.pause()));
            }
            PartitionMessage::Resume(reply) => {
                let _ = reply.send(self.leading_processor_mut().map(|p| p.resume()));
            }
            PartitionMessage::Snapshot(reply) => {
                let _ = reply.send(self.snapshot_now());
            }
            PartitionMessage::LatestSnapshot(reply) => {
                let latest = self
                    .snapshots
                    .positions()
                    .map(|positions| positions.last().map(|p| (*p, self.snapshots.path_for(*p))))
                    .map_err(NodeError::from);
                let _ = reply.send(latest);
            }
            PartitionMessage::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn not_leader(&self) -> NodeError {
        NodeError::NotLeader {
            partition_id: self.partition_id,
            leader: self.raft.leader(),
        }
    }

    fn leading_processor(&self) -> NodeResult<&StreamProcessor> {
        if !self.raft.is_leader() {
            return Err(self.not_leader());
        }
        match &self.processor {
            Some(processor) => Ok(processor),
            None => Err(NodeError::Unhealthy(
                self.partition_id,
                self.recovery_failure.clone().unwrap_or_else(|| "processor not started".into()),
            )),
        }
    }

    fn leading_processor_mut(&mut self) -> NodeResult<&mut StreamProcessor> {
        self.leading_processor()?;
        self.processor.as_mut().ok_or(NodeError::Stopped(self.partition_id))
    }

    fn on_command(&mut self, command: ClientCommand, reply: oneshot::Sender<NodeResult<CommandResponse>>) {
        let entry = match self.leading_processor() {
            Ok(processor) => match processor.health() {
                Health::Unhealthy(reason) => Err(NodeError::Unhealthy(self.partition_id, reason.clone())),
                _ => command.to_entry(processor.state()),
            },
            Err(e) => Err(e),
        };
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let term = self.raft.term();
        match self.log.append(&[entry], -1, Self::wall_clock(), term) {
            Ok(appended) => {
                metrics::counter!("brook_records_appended_total", 1, "partition" => self.partition_id.to_string());
                debug!(
                    "Partition {} wrote command at position {}",
                    self.partition_id, appended.first_position
                );
                self.pending.insert(appended.first_position, reply);
                self.after_local_append();
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    fn after_local_append(&mut self) {
        match self.raft.on_local_append(&mut self.log) {
            Ok(actions) => {
                let _ = self.perform(actions);
            }
            Err(e) => error!("Partition {} cannot replicate: {}", self.partition_id, e),
        }
    }

    fn on_raft_request(&mut self, request: RaftRequest) -> NodeResult<RaftResponse> {
        let now = self.clock();
        match request {
            RaftRequest::Vote(request) => {
                let (mut response, actions) = self.raft.handle_vote_request(&request, &self.log, now);
                if self.perform(actions).is_err() {
                    response.term = self.raft.term();
                    response.granted = false;
                }
                Ok(RaftResponse::Vote(response))
            }
            RaftRequest::Append(request) => {
                let (mut response, actions) = self.raft.handle_append_request(&request, &mut self.log, now)?;
                if self.perform(actions).is_err() {
                    response.term = self.raft.term();
                    response.succeeded = false;
                    response.previous_position = self.log.last_position();
                }
                Ok(RaftResponse::Append(response))
            }
            RaftRequest::Replicate(request) => {
                let response = raft::serve_replicate(&self.log, &request, self.config.max_append_batch_bytes)?;
                Ok(RaftResponse::Replicate(response))
            }
        }
    }

    fn on_raft_reply(&mut self, from: NodeId, response: RaftResponse) {
        let now = self.clock();
        let actions = match response {
            RaftResponse::Vote(response) => self.raft.handle_vote_response(from, &response, &self.log, now),
            RaftResponse::Append(response) => {
                self.appends_in_flight.remove(&from);
                self.raft.handle_append_response(&response, &mut self.log, now)
            }
            RaftResponse::Replicate(_) => {
                warn!("Partition {} got an unexpected replicate response from {}", self.partition_id, from);
                return;
            }
        };
        match actions {
            Ok(actions) => {
                let _ = self.perform(actions);
            }
            Err(e) => error!("Partition {} failed to handle a reply from {}: {}", self.partition_id, from, e),
        }
    }

    fn on_replicate_reply(&mut self, result: Result<ReplicateResponse, ReplicationError>) {
        let Some((leader, mut replicator)) = self.replicator.take() else {
            return;
        };
        let step = result.and_then(|response| replicator.on_response(response, &mut self.log, Instant::now()));
        match step {
            Ok(ReplicationStep::Request(request)) => {
                self.send_replicate(leader, request);
                self.replicator = Some((leader, replicator));
            }
            Ok(ReplicationStep::Ignored) => self.replicator = Some((leader, replicator)),
            Ok(ReplicationStep::Done(position)) => {
                info!(
                    "Partition {} caught up with leader {} at position {}",
                    self.partition_id, leader, position
                );
                self.raft.replication_finished();
            }
            Err(e) => {
                warn!("Partition {} replication from {} failed: {}", self.partition_id, leader, e);
                self.raft.replication_finished();
            }
        }
    }

    fn on_tick(&mut self) {
        if let Some((leader, replicator)) = self.replicator.as_mut() {
            if let Err(e) = replicator.check_timeout(Instant::now()) {
                warn!("Partition {} replication from {} failed: {}", self.partition_id, leader, e);
                self.replicator = None;
                self.raft.replication_finished();
            }
        }

        let now = self.clock();
        match self.raft.tick(now, &self.log) {
            Ok(actions) => {
                let _ = self.perform(actions);
            }
            Err(e) => error!("Partition {} raft tick failed: {}", self.partition_id, e),
        }

        let partition = self.partition_id.to_string();
        metrics::gauge!("brook_raft_term", self.raft.term() as f64, "partition" => partition.clone());
        metrics::gauge!("brook_commit_position", self.log.commit_position() as f64, "partition" => partition);
    }

    /// Performs the actions in order. A failed meta write drops every action
    /// after it, since they all assume the new term or vote is durable.
    fn perform(&mut self, actions: Vec<RaftAction>) -> NodeResult<()> {
        for action in actions {
            match action {
                RaftAction::PersistMeta(meta) => {
                    if let Err(e) = self.meta.store(&meta) {
                        error!("Partition {} cannot persist raft meta: {}", self.partition_id, e);
                        let fallback = self.raft.meta_store_failed(self.clock());
                        let term = self.raft.term();
                        if self.processor.is_some() || !fallback.is_empty() {
                            self.on_became_follower(term, None);
                        }
                        return Err(e.into());
                    }
                    self.raft.meta_stored(meta);
                }
                RaftAction::SendVote { to, request } => self.send(to, RaftRequest::Vote(request)),
                RaftAction::SendAppend { to, request } => {
                    if self.appends_in_flight.insert(to) {
                        self.send(to, RaftRequest::Append(request));
                    }
                }
                RaftAction::BecameLeader { term } => {
                    self.on_became_leader(term);
                    if !self.raft.is_leader() {
                        return Ok(());
                    }
                }
                RaftAction::BecameFollower { term, leader } => self.on_became_follower(term, leader),
                RaftAction::CommitAdvanced(position) => {
                    debug!("Partition {} committed up to {}", self.partition_id, position);
                }
                RaftAction::StartReplication { leader, from, target } => {
                    let mut replicator = LogReplicator::new(from, target, self.config.replication_timeout());
                    if let Some(request) = replicator.start(Instant::now()) {
                        self.send_replicate(leader, request);
                    }
                    self.replicator = Some((leader, replicator));
                }
            }
        }
        Ok(())
    }

    fn send(&self, to: NodeId, request: RaftRequest) {
        let transport = self.transport.clone();
        let outbox = self.outbox.clone();
        let partition_id = self.partition_id;
        tokio::spawn(async move {
            let message = match transport.request(to, partition_id, request).await {
                Ok(response) => PartitionMessage::RaftReply { from: to, response },
                Err(e) => {
                    debug!("Partition {} cannot reach node {}: {}", partition_id, to, e);
                    PartitionMessage::RpcFailed { to }
                }
            };
            if let Some(outbox) = outbox.upgrade() {
                let _ = outbox.send(message).await;
            }
        });
    }

    fn send_replicate(&self, leader: NodeId, request: raft::ReplicateRequest) {
        let transport = self.transport.clone();
        let outbox = self.outbox.clone();
        let partition_id = self.partition_id;
        tokio::spawn(async move {
            let result = match transport.request(leader, partition_id, RaftRequest::Replicate(request)).await {
                Ok(RaftResponse::Replicate(response)) => Ok(response),
                Ok(_) => Err(ReplicationError::InvalidLogReplicationResponse(
                    "leader answered with a different message".into(),
                )),
                Err(e) => Err(ReplicationError::Transport(e.to_string())),
            };
            if let Some(outbox) = outbox.upgrade() {
                let _ = outbox.send(PartitionMessage::ReplicateReply(result)).await;
            }
        });
    }

    fn on_became_leader(&mut self, term: i32) {
        self.replicator = None;
        self.appends_in_flight.clear();

        let initial = codec::event_entry(
            NO_KEY,
            RaftIntent::InitialEntry,
            RaftRecord {
                leader_id: self.node_id,
                term: term as i64,
            },
        );
        let appended = initial
            .map_err(NodeError::from)
            .and_then(|entry| Ok(self.log.append(&[entry], -1, Self::wall_clock(), term)?));
        if let Err(e) = appended {
            error!(
                "Partition {} cannot write its initial entry, stepping down: {}",
                self.partition_id, e
            );
            let actions = self.raft.step_down(self.clock());
            let _ = self.perform(actions);
            return;
        }

        match StreamProcessor::recover(
            &self.log,
            &self.snapshots,
            self.config.snapshot_policy,
            self.config.snapshots_to_keep,
            self.records.clone(),
        ) {
            Ok((processor, recovery)) => {
                info!(
                    "Partition {} leads in term {} (snapshot {}, replayed to {})",
                    self.partition_id, term, recovery.snapshot_position, recovery.replayed_to
                );
                self.processor = Some(processor);
                self.recovery_failure = None;
                metrics::gauge!("brook_partition_healthy", 1.0, "partition" => self.partition_id.to_string());
            }
            Err(e) => {
                error!("Partition {} cannot recover its processor: {}", self.partition_id, e);
                self.processor = None;
                self.recovery_failure = Some(e.to_string());
                metrics::gauge!("brook_partition_healthy", 0.0, "partition" => self.partition_id.to_string());
            }
        }

        self.after_local_append();
    }

    fn on_became_follower(&mut self, term: i32, leader: Option<NodeId>) {
        if self.processor.take().is_some() {
            info!(
                "Partition {} stops processing in term {} (leader {:?})",
                self.partition_id, term, leader
            );
        }
        self.appends_in_flight.clear();
        let partition_id = self.partition_id;
        self.fail_pending(move || NodeError::NotLeader { partition_id, leader });
    }

    fn fail_pending(&mut self, error: impl Fn() -> NodeError) {
        for (_, reply) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(error()));
        }
    }

    /// Timer triggers and job time-outs that fell due.
    fn write_scheduled_commands(&mut self) {
        if !self.raft.is_leader() {
            return;
        }
        let now = Self::wall_clock();
        let Some(processor) = self.processor.as_mut().filter(|p| p.is_healthy()) else {
            return;
        };
        let commands = processor.scheduled_commands(now);
        if commands.is_empty() {
            return;
        }
        match self.log.append(&commands, -1, now, self.raft.term()) {
            Ok(_) => {
                metrics::counter!("brook_records_appended_total", commands.len() as u64, "partition" => self.partition_id.to_string());
                self.after_local_append();
            }
            Err(e) => error!("Partition {} cannot write scheduled commands: {}", self.partition_id, e),
        }
    }

    /// Processes what is committed, replicates what processing wrote, and
    /// snapshots when the policy says so.
    fn drive(&mut self) {
        loop {
            let Some(processor) = self.processor.as_mut() else {
                return;
            };
            let term = self.raft.term();
            let mut wrote = false;

            while processor.has_next() {
                match processor.process_next(&mut self.log, term, Self::wall_clock()) {
                    Ok(Some(processed)) => {
                        wrote |= processed.written_to.is_some();
                        if let Some(reply) = self.pending.remove(&processed.position) {
                            let response = processed
                                .response
                                .ok_or_else(|| NodeError::InvalidInput("command produced no response".into()));
                            let _ = reply.send(response);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let reason = e.to_string();
                        let partition_id = self.partition_id;
                        for (_, reply) in std::mem::take(&mut self.pending) {
                            let _ = reply.send(Err(NodeError::Unhealthy(partition_id, reason.clone())));
                        }
                        break;
                    }
                }
            }
            processor.export_committed();

            if !wrote {
                break;
            }
            self.after_local_append();
        }

        self.maybe_snapshot();
    }

    fn maybe_snapshot(&mut self) {
        let Some(processor) = self.processor.as_mut() else {
            return;
        };
        match processor.maybe_snapshot(&self.snapshots, self.log.commit_position()) {
            Ok(Some(snapshot)) => self.compact(snapshot.position),
            Ok(None) => {}
            Err(e) => warn!("Partition {} snapshot failed: {}", self.partition_id, e),
        }
    }

    fn snapshot_now(&mut self) -> NodeResult<Option<SnapshotMetadata>> {
        self.leading_processor()?;
        let partition_id = self.partition_id;
        let commit = self.log.commit_position();
        let processor = self.processor.as_mut().ok_or(NodeError::Stopped(partition_id))?;
        let snapshot = processor
            .take_snapshot(&self.snapshots, commit)
            .map_err(|e| NodeError::Unhealthy(partition_id, e.to_string()))?;
        if let Some(snapshot) = &snapshot {
            self.compact(snapshot.position);
        }
        Ok(snapshot)
    }

    /// Releases log storage no one needs: everything before the snapshot
    /// and before what every follower already holds.
    fn compact(&mut self, snapshot_position: i64) {
        let position = snapshot_position.min(self.raft.lowest_match_position(&self.log));
        if let Err(e) = self.log.compact(position) {
            warn!("Partition {} cannot compact before {}: {}", self.partition_id, position, e);
        }
    }

    fn status(&self) -> PartitionStatus {
        let processor = self.processor.as_ref().filter(|_| self.raft.is_leader()).map(|p| ProcessorStatus {
            health: p.health().clone(),
            last_processed_position: p.last_processed_position(),
            last_snapshot_position: p.last_snapshot_position(),
            state: p.state().summary(),
        });
        PartitionStatus {
            partition_id: self.partition_id,
            node_id: self.node_id,
            role: self.raft.role(),
            term: self.raft.term(),
            leader: self.raft.leader(),
            first_position: self.log.first_position(),
            last_position: self.log.last_position(),
            commit_position: self.log.commit_position(),
            replicating: self.raft.is_replicating(),
            processor,
        }
    }

    fn close(&mut self) {
        let commit = self.log.commit_position();
        if let Some(processor) = self.processor.as_mut() {
            if let Err(e) = processor.take_snapshot(&self.snapshots, commit) {
                warn!("Partition {} final snapshot failed: {}", self.partition_id, e);
            }
        }
        if let Err(e) = self.log.flush() {
            error!("Partition {} cannot flush its log: {}", self.partition_id, e);
        }
        let partition_id = self.partition_id;
        self.fail_pending(move || NodeError::Stopped(partition_id));
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Engine state.
//!
//! # Architecture
//! All state of one partition lives in [`EngineState`]. It is only mutated by
//! the engine while processing a record, through undo-logged maps, so a
//! failed record leaves no trace.
//!
//! # Guarantees
//! - Serialization is deterministic: maps are ordered, caches are skipped.
//!   Two replicas that processed the same records have the same
//!   [`EngineState::hash`].

pub mod incidents;
pub mod instances;
pub mod jobs;
pub mod journal;
pub mod keys;
pub mod messages;
pub mod processes;
pub mod timers;
pub mod variables;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::expr::Document;

pub use incidents::{FailedEvent, Incident, IncidentState};
pub use instances::{ElementInstance, ElementInstanceState, EventTrigger, LifecycleState};
pub use jobs::{Job, JobState, JobStatus};
pub use keys::{decode_partition_id, encode_partition_id, KeyGenerator};
pub use messages::MessageState;
pub use processes::{DeployedProcess, ProcessState};
pub use timers::TimerState;
pub use variables::{VariableChange, VariableState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub(crate) partition_id: u32,
    pub(crate) keys: KeyGenerator,
    pub(crate) processes: ProcessState,
    pub(crate) instances: ElementInstanceState,
    pub(crate) variables: VariableState,
    pub(crate) jobs: JobState,
    pub(crate) incidents: IncidentState,
    pub(crate) timers: TimerState,
    pub(crate) messages: MessageState,
}

/// Counters for health endpoints and tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub processes: usize,
    pub process_instances: usize,
    pub element_instances: usize,
    pub jobs: usize,
    pub incidents: usize,
    pub timers: usize,
    pub message_subscriptions: usize,
    pub buffered_messages: usize,
}

impl EngineState {
    pub fn new(partition_id: u32) -> Self {
        Self {
            partition_id,
            keys: KeyGenerator::new(partition_id),
            processes: ProcessState::default(),
            instances: ElementInstanceState::default(),
            variables: VariableState::default(),
            jobs: JobState::default(),
            incidents: IncidentState::default(),
            timers: TimerState::default(),
            messages: MessageState::default(),
        }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub(crate) fn commit(&mut self) {
        self.keys.commit();
        self.processes.commit();
        self.instances.commit();
        self.variables.commit();
        self.jobs.commit();
        self.incidents.commit();
        self.timers.commit();
        self.messages.commit();
    }

    pub(crate) fn rollback(&mut self) {
        self.keys.rollback();
        self.processes.rollback();
        self.instances.rollback();
        self.variables.rollback();
        self.jobs.rollback();
        self.incidents.rollback();
        self.timers.rollback();
        self.messages.rollback();
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| KernelError::Encoding(e.to_string()))
    }

    /// Decodes a snapshot body and recompiles the deployed processes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (mut state, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| KernelError::InvalidSnapshot(e.to_string()))?;
        if read != bytes.len() {
            return Err(KernelError::InvalidSnapshot(format!(
                "{} trailing bytes",
                bytes.len() - read
            )));
        }
        state.processes.rebuild()?;
        Ok(state)
    }

    pub fn hash(&self) -> Result<[u8; 32]> {
        Ok(*blake3::hash(&self.encode()?).as_bytes())
    }

    pub fn hash_hex(&self) -> Result<String> {
        Ok(blake3::hash(&self.encode()?).to_hex().to_string())
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary {
            processes: self.processes.len(),
            process_instances: self.instances.process_instances().count(),
            element_instances: self.instances.len(),
            jobs: self.jobs.len(),
            incidents: self.incidents.len(),
            timers: self.timers.len(),
            message_subscriptions: self.messages.subscription_count(),
            buffered_messages: self.messages.buffered_count(),
        }
    }

    // --- Read APIs ---

    pub fn processes(&self) -> &ProcessState {
        &self.processes
    }

    pub fn element_instance(&self, key: i64) -> Option<&ElementInstance> {
        self.instances.get(key)
    }

    pub fn element_instances(&self) -> &ElementInstanceState {
        &self.instances
    }

    pub fn variables(&self, scope_key: i64) -> Document {
        self.variables.collect(scope_key)
    }

    pub fn job(&self, key: i64) -> Option<&Job> {
        self.jobs.get(key)
    }

    pub fn jobs(&self) -> &JobState {
        &self.jobs
    }

    pub fn incident(&self, key: i64) -> Option<&Incident> {
        self.incidents.get(key)
    }

    pub fn incidents(&self) -> impl Iterator<Item = &Incident> {
        self.incidents.iter()
    }

    pub fn timers(&self) -> &TimerState {
        &self.timers
    }

    pub fn messages(&self) -> &MessageState {
        &self.messages
    }

    /// Timers due at `now`; the caller turns them into `Timer Trigger`
    /// commands.
    pub fn due_timers(&self, now: i64) -> Vec<i64> {
        self.timers.due(now)
    }

    /// Activated jobs past their deadline; the caller turns them into
    /// `Job TimeOut` commands.
    pub fn timed_out_jobs(&self, now: i64) -> Vec<i64> {
        self.jobs.timed_out(now)
    }
}

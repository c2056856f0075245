// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The stream processor of one partition.
//!
//! # Architecture
//! - `recover` = latest valid snapshot + replay of the log after it
//! - `process_next` = one committed record through the engine, follow-ups
//!   appended as one batch before the next record is read
//! - `maybe_snapshot` = state snapshot once everything it covers is committed
//!
//! # Invariants
//! - records are processed strictly in position order, each exactly once
//! - replay never writes; a replayed record must produce exactly the
//!   follow-ups already in the log, otherwise the partition is unusable
//! - a failed record leaves the state untouched and halts processing

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::time::Instant;

use brook_kernel::engine::{CommandResponse, ProcessingError};
use brook_kernel::record::{Intent, IncidentIntent, JobIntent, TimerIntent, ValueType};
use brook_kernel::state::Incident;
use brook_kernel::{Engine, EngineState, KernelError, ProcessingResult, TypedRecord};
use brook_logstream::{LogAppendEntry, LogStream, LogStreamError, LogStreamReader, SnapshotError, SnapshotMetadata, SnapshotStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::config::SnapshotPolicy;

/// Identity of a follow-up, as compared during replay.
type FollowUpId = (ValueType, Intent, i64);

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Log error: {0}")]
    Log(#[from] LogStreamError),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("Processing record at position {position} failed: {source}")]
    Processing {
        position: i64,
        #[source]
        source: ProcessingError,
    },
    #[error(
        "Reprocessing record at position {position} produced {found:?} but the log holds {expected:?}"
    )]
    ReprocessingMismatch {
        position: i64,
        expected: Vec<FollowUpId>,
        found: Vec<FollowUpId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason")]
pub enum Health {
    Healthy,
    Unhealthy(String),
    Paused,
}

/// What processing one log entry did.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub position: i64,
    /// Answer for the client that wrote this command, if any.
    pub response: Option<CommandResponse>,
    /// Last position of the appended follow-ups.
    pub written_to: Option<i64>,
}

/// Where recovery started and ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    pub snapshot_position: i64,
    pub replayed_to: i64,
    pub replayed_records: u64,
}

pub struct StreamProcessor {
    partition_id: u32,
    engine: Engine,
    state: EngineState,
    reader: LogStreamReader,
    export_reader: LogStreamReader,
    committed: broadcast::Sender<TypedRecord>,
    health: Health,
    last_processed_position: i64,
    last_written_position: i64,
    policy: SnapshotPolicy,
    snapshots_to_keep: usize,
    records_since_snapshot: u64,
    last_snapshot_position: i64,
    last_snapshot_at: Option<Instant>,
    scheduled_timers: HashSet<i64>,
    scheduled_timeouts: HashSet<i64>,
}

impl StreamProcessor {
    /// Restores the newest valid snapshot and replays the log after it.
    pub fn recover(
        log: &LogStream,
        snapshots: &SnapshotStore,
        policy: SnapshotPolicy,
        snapshots_to_keep: usize,
        committed: broadcast::Sender<TypedRecord>,
    ) -> Result<(Self, Recovery), ProcessorError> {
        let partition_id = log.partition_id();
        let started = Instant::now();

        let (state, snapshot_position) = restore_snapshot(log, snapshots)?;
        let (expected, last_source_position) = collect_follow_ups(log, snapshot_position)?;

        let engine = Engine::new();
        let mut processor = Self {
            partition_id,
            engine,
            state,
            reader: log.new_committed_reader(),
            export_reader: log.new_committed_reader(),
            committed,
            health: Health::Healthy,
            last_processed_position: snapshot_position,
            last_written_position: log.last_position(),
            policy,
            snapshots_to_keep,
            records_since_snapshot: 0,
            last_snapshot_position: snapshot_position,
            last_snapshot_at: None,
            scheduled_timers: HashSet::new(),
            scheduled_timeouts: HashSet::new(),
        };

        let replayed = processor.replay(log, snapshot_position, last_source_position, expected)?;
        let replayed_to = processor.last_processed_position;

        processor.reader.seek(replayed_to + 1);
        processor.export_reader.seek(log.commit_position() + 1);

        let elapsed = started.elapsed().as_secs_f64();
        metrics::histogram!("brook_replay_duration_seconds", elapsed, "partition" => partition_id.to_string());
        info!(
            "Recovered partition {} from snapshot {} and replayed {} records up to {} in {:.3}s",
            partition_id, snapshot_position, replayed, replayed_to, elapsed
        );

        Ok((
            processor,
            Recovery {
                snapshot_position,
                replayed_to,
                replayed_records: replayed,
            },
        ))
    }

    fn replay(
        &mut self,
        log: &LogStream,
        snapshot_position: i64,
        last_source_position: i64,
        mut expected: BTreeMap<i64, Vec<FollowUpId>>,
    ) -> Result<u64, ProcessorError> {
        if last_source_position <= snapshot_position {
            return Ok(0);
        }

        let mut reader = log.new_reader();
        reader.seek(snapshot_position + 1);
        let mut replayed = 0;

        for entry in reader {
            let entry = entry?;
            if entry.position > last_source_position {
                break;
            }
            self.last_processed_position = entry.position;
            if entry.should_skip_processing() {
                continue;
            }

            let record = codec::decode(&entry)?;
            if !self.engine.can_process(&record) {
                continue;
            }

            let mut result = ProcessingResult::new();
            self.engine
                .process(&mut self.state, &record, &mut result)
                .map_err(|source| ProcessorError::Processing {
                    position: record.position,
                    source,
                })?;

            let found: Vec<FollowUpId> = result
                .records()
                .iter()
                .map(|r| (r.intent().value_type(), r.intent(), r.key))
                .collect();
            let expected = expected.remove(&record.position).unwrap_or_default();
            if found != expected {
                self.health = Health::Unhealthy("reprocessing mismatch".into());
                return Err(ProcessorError::ReprocessingMismatch {
                    position: record.position,
                    expected,
                    found,
                });
            }
            replayed += 1;
        }
        Ok(replayed)
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn health(&self) -> &Health {
        &self.health
    }

    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }

    pub fn last_processed_position(&self) -> i64 {
        self.last_processed_position
    }

    pub fn last_written_position(&self) -> i64 {
        self.last_written_position
    }

    pub fn last_snapshot_position(&self) -> i64 {
        self.last_snapshot_position
    }

    pub fn pause(&mut self) {
        if self.health == Health::Healthy {
            info!("Pausing processing of partition {}", self.partition_id);
            self.health = Health::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.health == Health::Paused {
            info!("Resuming processing of partition {}", self.partition_id);
            self.health = Health::Healthy;
        }
    }

    /// Whether a committed record is waiting to be processed.
    pub fn has_next(&self) -> bool {
        self.is_healthy() && self.reader.has_next()
    }

    /// Processes the next committed record, appending its follow-ups in
    /// `term` with timestamp `now`. `Ok(None)` when there is nothing to do.
    pub fn process_next(&mut self, log: &mut LogStream, term: i32, now: i64) -> Result<Option<Processed>, ProcessorError> {
        if !self.is_healthy() {
            return Ok(None);
        }
        let Some(entry) = self.reader.next() else {
            return Ok(None);
        };
        let entry = self.halt_on_error(entry.map_err(ProcessorError::from))?;
        let position = entry.position;

        if entry.should_skip_processing() {
            self.skipped(position);
            return Ok(Some(Processed {
                position,
                response: None,
                written_to: None,
            }));
        }

        let record = self.halt_on_error(codec::decode(&entry).map_err(ProcessorError::from))?;
        if !self.engine.can_process(&record) {
            self.skipped(position);
            return Ok(Some(Processed {
                position,
                response: None,
                written_to: None,
            }));
        }

        let started = Instant::now();
        let mut result = ProcessingResult::new();
        let outcome = self.engine.process(&mut self.state, &record, &mut result);
        self.halt_on_error(outcome.map_err(|source| ProcessorError::Processing { position, source }))?;

        let (follow_ups, response) = result.take();
        let incidents = follow_ups
            .iter()
            .filter(|r| r.intent() == Intent::Incident(IncidentIntent::Created))
            .count();

        let written_to = if follow_ups.is_empty() {
            None
        } else {
            let entries = follow_ups
                .iter()
                .map(codec::follow_up_entry)
                .collect::<Result<Vec<_>, _>>()
                .map_err(ProcessorError::from);
            let entries = self.halt_on_error(entries)?;
            let appended = log.append(&entries, position, now.max(0), term).map_err(ProcessorError::from);
            let appended = self.halt_on_error(appended)?;
            self.last_written_position = appended.last_position;
            metrics::counter!("brook_records_appended_total", entries.len() as u64, "partition" => self.partition_id.to_string());
            Some(appended.last_position)
        };

        self.last_processed_position = position;
        self.records_since_snapshot += 1;

        let partition = self.partition_id.to_string();
        metrics::counter!("brook_records_processed_total", 1, "partition" => partition.clone());
        if incidents > 0 {
            metrics::counter!("brook_incidents_created_total", incidents as u64, "partition" => partition.clone());
        }
        metrics::histogram!("brook_processing_duration_seconds", started.elapsed().as_secs_f64(), "partition" => partition);
        trace!(
            "Processed {:?} {} at position {} on partition {} ({} follow-ups)",
            record.record_type(),
            record.intent().name(),
            position,
            self.partition_id,
            follow_ups.len()
        );

        Ok(Some(Processed {
            position,
            response,
            written_to,
        }))
    }

    fn skipped(&mut self, position: i64) {
        self.last_processed_position = position;
        metrics::counter!("brook_records_skipped_total", 1, "partition" => self.partition_id.to_string());
    }

    fn halt_on_error<T>(&mut self, result: Result<T, ProcessorError>) -> Result<T, ProcessorError> {
        if let Err(e) = &result {
            error!("Partition {} is unhealthy: {}", self.partition_id, e);
            self.health = Health::Unhealthy(e.to_string());
            metrics::gauge!("brook_partition_healthy", 0.0, "partition" => self.partition_id.to_string());
        }
        result
    }

    /// Timer triggers and job time-outs that are due at `now`. Each one is
    /// handed out once; it is handed out again only if it is still due after
    /// it dropped out of the due set.
    pub fn scheduled_commands(&mut self, now: i64) -> Vec<LogAppendEntry> {
        let mut commands = Vec::new();

        let due: HashSet<i64> = self.state.due_timers(now).into_iter().collect();
        self.scheduled_timers.retain(|key| due.contains(key));
        let mut due: Vec<i64> = due.into_iter().filter(|k| !self.scheduled_timers.contains(k)).collect();
        due.sort_unstable();
        for key in due {
            let Some(timer) = self.state.timers().get(key).cloned() else {
                continue;
            };
            match codec::command_entry(key, TimerIntent::Trigger, timer) {
                Ok(entry) => {
                    self.scheduled_timers.insert(key);
                    commands.push(entry);
                }
                Err(e) => warn!("Cannot encode trigger for timer {}: {}", key, e),
            }
        }

        let expired: HashSet<i64> = self.state.timed_out_jobs(now).into_iter().collect();
        self.scheduled_timeouts.retain(|key| expired.contains(key));
        let mut expired: Vec<i64> = expired
            .into_iter()
            .filter(|k| !self.scheduled_timeouts.contains(k))
            .collect();
        expired.sort_unstable();
        for key in expired {
            let Some(job) = self.state.job(key).map(|j| j.record.clone()) else {
                continue;
            };
            match codec::command_entry(key, JobIntent::TimeOut, job) {
                Ok(entry) => {
                    self.scheduled_timeouts.insert(key);
                    commands.push(entry);
                }
                Err(e) => warn!("Cannot encode time out for job {}: {}", key, e),
            }
        }

        if !commands.is_empty() {
            debug!("Partition {} scheduled {} commands", self.partition_id, commands.len());
        }
        commands
    }

    /// Live tail of committed records. Records committed before the
    /// subscription are not delivered.
    pub fn subscribe_committed(&self) -> broadcast::Receiver<TypedRecord> {
        self.committed.subscribe()
    }

    /// Broadcasts records committed since the last call.
    pub fn export_committed(&mut self) -> usize {
        let mut exported = 0;
        while let Some(entry) = self.export_reader.next() {
            let record = match entry {
                Ok(entry) => codec::decode(&entry),
                Err(e) => {
                    warn!("Partition {} cannot read a committed record: {}", self.partition_id, e);
                    break;
                }
            };
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!("Partition {} cannot export a committed record: {}", self.partition_id, e);
                    continue;
                }
            };
            // No subscribers is fine.
            let _ = self.committed.send(record);
            exported += 1;
        }
        exported
    }

    /// Takes a snapshot when the policy asks for one and everything it would
    /// cover is committed.
    pub fn maybe_snapshot(
        &mut self,
        snapshots: &SnapshotStore,
        commit_position: i64,
    ) -> Result<Option<SnapshotMetadata>, ProcessorError> {
        if self.records_since_snapshot < self.policy.every_n_records.max(1) {
            return Ok(None);
        }
        if let Some(at) = self.last_snapshot_at {
            if at.elapsed() < self.policy.min_interval() {
                return Ok(None);
            }
        }
        self.take_snapshot(snapshots, commit_position)
    }

    /// Snapshots the state at the last processed position, unless that
    /// record or any of the follow-ups written so far are uncommitted.
    pub fn take_snapshot(
        &mut self,
        snapshots: &SnapshotStore,
        commit_position: i64,
    ) -> Result<Option<SnapshotMetadata>, ProcessorError> {
        let position = self.last_processed_position;
        if position <= self.last_snapshot_position
            || position > commit_position
            || self.last_written_position > commit_position
        {
            return Ok(None);
        }

        let body = self.state.encode()?;
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut writer = match snapshots.new_writer(position, created_at) {
            Ok(writer) => writer,
            Err(SnapshotError::AlreadyExists(_)) => {
                self.last_snapshot_position = position;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = writer.write_all(&body) {
            writer.abort()?;
            return Err(SnapshotError::Io(e).into());
        }
        let metadata = writer.commit()?;

        let purged = snapshots.purge(self.snapshots_to_keep)?;
        self.last_snapshot_position = position;
        self.last_snapshot_at = Some(Instant::now());
        self.records_since_snapshot = 0;

        metrics::gauge!("brook_snapshot_size_bytes", metadata.size as f64, "partition" => self.partition_id.to_string());
        info!(
            "Partition {} snapshot at position {} ({} bytes, purged {})",
            self.partition_id, position, metadata.size, purged
        );
        Ok(Some(metadata))
    }

    /// Incidents that are still open, for status queries.
    pub fn open_incidents(&self) -> Vec<Incident> {
        self.state.incidents().cloned().collect()
    }
}

/// The newest snapshot that validates and decodes, or empty state.
fn restore_snapshot(log: &LogStream, snapshots: &SnapshotStore) -> Result<(EngineState, i64), ProcessorError> {
    let partition_id = log.partition_id();
    for position in snapshots.positions()?.into_iter().rev() {
        if position > log.last_position() || position < log.first_position() - 1 {
            warn!(
                "Ignoring snapshot {} of partition {}: the log holds {}..={}",
                position,
                partition_id,
                log.first_position(),
                log.last_position()
            );
            continue;
        }

        match read_snapshot(snapshots, position) {
            Ok(state) => {
                info!("Partition {} restored snapshot at position {}", partition_id, position);
                return Ok((state, position));
            }
            Err(e) => warn!("Partition {} skips corrupt snapshot {}: {}", partition_id, position, e),
        }
    }

    if log.first_position() > 1 {
        warn!(
            "Partition {} has no usable snapshot but its log starts at {}",
            partition_id,
            log.first_position()
        );
    }
    Ok((EngineState::new(partition_id), log.first_position() - 1))
}

fn read_snapshot(snapshots: &SnapshotStore, position: i64) -> Result<EngineState, ProcessorError> {
    let mut reader = snapshots.open_reader(position)?;
    let mut body = Vec::new();
    reader.read_to_end(&mut body).map_err(SnapshotError::Io)?;
    reader.validate_and_close()?;
    Ok(EngineState::decode(&body)?)
}

/// Follow-ups already in the log, by source position, and the highest
/// source position after `from`.
fn collect_follow_ups(log: &LogStream, from: i64) -> Result<(BTreeMap<i64, Vec<FollowUpId>>, i64), ProcessorError> {
    let mut expected: BTreeMap<i64, Vec<FollowUpId>> = BTreeMap::new();
    let mut last_source_position = from;

    let mut reader = log.new_reader();
    reader.seek(from + 1);
    for entry in reader {
        let entry = entry?;
        if entry.source_position <= from {
            continue;
        }
        let record = codec::decode(&entry)?;
        expected
            .entry(entry.source_position)
            .or_default()
            .push((record.value_type(), record.intent(), record.key));
        last_source_position = last_source_position.max(entry.source_position);
    }
    Ok((expected, last_source_position))
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::io::Read;

use anyhow::{anyhow, Context, Result};
use brook_kernel::{Engine, EngineState, ProcessingResult};
use brook_logstream::{LogStream, SnapshotStore};
use brook_node::codec;

/// Rebuilds partition state offline, the way a recovering leader does,
/// without writing anything back.
pub struct ReplayEngine {
    engine: Engine,
    pub state: EngineState,
    /// Position the state was restored at; 0 for an empty state.
    pub start_position: i64,
    pub current_position: i64,
    pub processed: u64,
}

impl ReplayEngine {
    pub fn empty(partition_id: u32) -> Self {
        Self {
            engine: Engine::new(),
            state: EngineState::new(partition_id),
            start_position: 0,
            current_position: 0,
            processed: 0,
        }
    }

    /// Restores the newest snapshot that validates. `None` if there is none.
    pub fn from_latest_snapshot(snapshots: &SnapshotStore) -> Result<Option<Self>> {
        let Some(mut reader) = snapshots.latest_valid()? else {
            return Ok(None);
        };
        let position = reader.metadata().position;

        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .with_context(|| format!("reading snapshot {position}"))?;
        reader
            .validate_and_close()
            .with_context(|| format!("validating snapshot {position}"))?;
        let state = EngineState::decode(&body).with_context(|| format!("decoding snapshot {position}"))?;

        Ok(Some(Self {
            engine: Engine::new(),
            state,
            start_position: position,
            current_position: position,
            processed: 0,
        }))
    }

    /// Processes every record after the current position up to `target`
    /// (inclusive, `None` for the end of the log). Follow-ups are dropped;
    /// the log already holds them.
    pub fn replay_to(&mut self, log: &LogStream, target: Option<i64>) -> Result<u64> {
        if self.start_position == 0 && log.first_position() > 1 {
            return Err(anyhow!(
                "the log was compacted up to {}; replay from a snapshot instead",
                log.first_position() - 1
            ));
        }

        let target = target.unwrap_or(i64::MAX);
        let mut reader = log.new_reader();
        reader.seek(self.current_position + 1);
        let mut replayed = 0;

        for entry in reader {
            let entry = entry.with_context(|| format!("reading after position {}", self.current_position))?;
            if entry.position > target {
                break;
            }
            self.current_position = entry.position;
            if entry.should_skip_processing() {
                continue;
            }

            let record = codec::decode(&entry).with_context(|| format!("decoding position {}", entry.position))?;
            if !self.engine.can_process(&record) {
                continue;
            }
            let mut result = ProcessingResult::new();
            self.engine
                .process(&mut self.state, &record, &mut result)
                .with_context(|| format!("processing position {}", entry.position))?;
            replayed += 1;
        }

        self.processed += replayed;
        Ok(replayed)
    }

    pub fn hash(&self) -> Result<String> {
        Ok(self.state.hash_hex()?)
    }
}

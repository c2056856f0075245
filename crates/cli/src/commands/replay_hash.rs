// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::path::Path;

use anyhow::{anyhow, bail};
use brook_kernel::state::StateSummary;

use crate::engine::ReplayEngine;
use crate::partition_dir::PartitionDir;

#[derive(Debug)]
pub struct ReplayReport {
    pub start_position: i64,
    pub replayed_to: i64,
    pub processed: u64,
    pub hash: String,
    pub summary: StateSummary,
}

/// Replays the log up to `to` and hashes the resulting state. Starts from
/// the newest valid snapshot when `from_snapshot` is set, from empty state
/// otherwise.
pub fn replay(dir: &Path, to: Option<i64>, from_snapshot: bool) -> anyhow::Result<ReplayReport> {
    let partition = PartitionDir::open(dir)?;
    let (log, _) = partition.open_log()?;

    let mut engine = if from_snapshot {
        let snapshots = partition.open_snapshots()?;
        ReplayEngine::from_latest_snapshot(&snapshots)?
            .ok_or_else(|| anyhow!("no valid snapshot under {}", partition.snapshots_dir().display()))?
    } else {
        ReplayEngine::empty(partition.partition_id())
    };

    if let Some(to) = to {
        if to < engine.start_position {
            bail!("position {to} is before the snapshot at {}", engine.start_position);
        }
    }

    engine.replay_to(&log, to)?;
    Ok(ReplayReport {
        start_position: engine.start_position,
        replayed_to: engine.current_position,
        processed: engine.processed,
        hash: engine.hash()?,
        summary: engine.state.summary(),
    })
}

fn print(label: &str, report: &ReplayReport) {
    println!("{label}");
    println!("  Started at:    {}", report.start_position);
    println!("  Replayed to:   {} ({} records processed)", report.replayed_to, report.processed);
    println!("  State hash:    {}", report.hash);
    println!(
        "  State:         {} processes, {} instances, {} jobs, {} incidents, {} timers",
        report.summary.processes,
        report.summary.process_instances,
        report.summary.jobs,
        report.summary.incidents,
        report.summary.timers
    );
}

/// With `compare`, replays once from empty state and once from the newest
/// snapshot and fails unless both reach the same hash.
pub fn run(dir: &Path, to: Option<i64>, from_snapshot: bool, compare: bool) -> anyhow::Result<()> {
    if !compare {
        let report = replay(dir, to, from_snapshot)?;
        println!();
        print(if from_snapshot { "From snapshot" } else { "From empty state" }, &report);
        println!();
        return Ok(());
    }

    let from_log = replay(dir, to, false)?;
    let from_snapshot = replay(dir, to, true)?;
    println!();
    print("From empty state", &from_log);
    print("From snapshot", &from_snapshot);

    if from_log.replayed_to != from_snapshot.replayed_to {
        bail!(
            "replays stopped at different positions ({} and {})",
            from_log.replayed_to,
            from_snapshot.replayed_to
        );
    }
    if from_log.hash != from_snapshot.hash {
        println!("\n❌ DIVERGED\n");
        bail!("snapshot {} does not reproduce the replayed state", from_snapshot.start_position);
    }
    println!("\n✅ DETERMINISTIC\n");
    Ok(())
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::io::Read;
use std::path::Path;

use anyhow::bail;
use brook_logstream::SnapshotStore;
use brook_node::codec;

use crate::partition_dir::PartitionDir;

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub entries: u64,
    pub last_position: i64,
    pub valid_snapshots: Vec<i64>,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Reads every log entry and every snapshot body, collecting what is wrong
/// instead of stopping at the first problem.
pub fn check(dir: &Path) -> anyhow::Result<VerifyReport> {
    let partition = PartitionDir::open(dir)?;
    let mut report = VerifyReport::default();

    // Opening the log checks every frame checksum; a damaged frame that is
    // not the last one fails the open.
    match partition.open_log() {
        Ok((log, _)) => {
            let mut previous_term = 0;
            for entry in log.new_reader() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        report.problems.push(format!("log: {e}"));
                        break;
                    }
                };
                if entry.raft_term < previous_term {
                    report.problems.push(format!(
                        "log: term drops from {} to {} at position {}",
                        previous_term, entry.raft_term, entry.position
                    ));
                }
                previous_term = entry.raft_term;
                if let Err(e) = codec::decode(&entry) {
                    report.problems.push(format!("log: position {} does not decode: {}", entry.position, e));
                }
                report.entries += 1;
                report.last_position = entry.position;
            }
        }
        Err(e) => report.problems.push(format!("log: {e:#}")),
    }

    let snapshots = partition.open_snapshots()?;
    for position in snapshots.positions()? {
        match check_snapshot(&snapshots, position) {
            Ok(()) => report.valid_snapshots.push(position),
            Err(e) => report.problems.push(format!("snapshot {position}: {e:#}")),
        }
        if position > report.last_position {
            report
                .problems
                .push(format!("snapshot {position} is ahead of the log (last position {})", report.last_position));
        }
    }

    Ok(report)
}

fn check_snapshot(snapshots: &SnapshotStore, position: i64) -> anyhow::Result<()> {
    let mut reader = snapshots.open_reader(position)?;
    let mut body = Vec::new();
    reader.read_to_end(&mut body)?;
    reader.validate_and_close()?;
    brook_kernel::EngineState::decode(&body)?;
    Ok(())
}

pub fn run(dir: &Path) -> anyhow::Result<()> {
    let report = check(dir)?;

    if report.is_ok() {
        println!("\n✅ VERIFIED\n");
        println!("Log entries:   {} (up to {})", report.entries, report.last_position);
        println!("Snapshots:     {:?}\n", report.valid_snapshots);
        return Ok(());
    }

    println!("\n❌ CORRUPTED\n");
    for problem in &report.problems {
        println!("- {problem}");
    }
    println!();
    bail!("{} problems found in {}", report.problems.len(), dir.display())
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::path::Path;

use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};

use crate::partition_dir::PartitionDir;

pub struct SnapshotRow {
    pub position: i64,
    pub size: u64,
    pub created_at: u64,
    /// Why the snapshot cannot be read, if it cannot.
    pub problem: Option<String>,
}

pub struct InspectReport {
    pub partition_id: u32,
    pub segments: usize,
    pub first_position: i64,
    pub last_position: i64,
    pub last_term: i32,
    pub snapshots: Vec<SnapshotRow>,
    pub term: Option<i32>,
    pub voted_for: Option<u64>,
}

impl InspectReport {
    pub fn entries(&self) -> i64 {
        if self.last_position < self.first_position {
            0
        } else {
            self.last_position - self.first_position + 1
        }
    }
}

pub fn report(dir: &Path) -> anyhow::Result<InspectReport> {
    let partition = PartitionDir::open(dir)?;
    let (log, segments) = partition.open_log()?;
    let store = partition.open_snapshots()?;

    let mut snapshots = Vec::new();
    for position in store.positions()? {
        let row = match store.open_reader(position) {
            Ok(reader) => {
                let metadata = reader.metadata();
                SnapshotRow {
                    position,
                    size: metadata.size,
                    created_at: metadata.created_at,
                    problem: None,
                }
            }
            Err(e) => SnapshotRow {
                position,
                size: 0,
                created_at: 0,
                problem: Some(e.to_string()),
            },
        };
        snapshots.push(row);
    }

    let meta = partition.raft_meta()?;
    Ok(InspectReport {
        partition_id: partition.partition_id(),
        segments,
        first_position: log.first_position(),
        last_position: log.last_position(),
        last_term: log.last_term(),
        snapshots,
        term: meta.map(|m| m.term),
        voted_for: meta.and_then(|m| m.voted_for),
    })
}

pub fn run(dir: &Path) -> anyhow::Result<()> {
    let report = report(dir)?;

    println!("\nPartition {} ({})", report.partition_id, dir.display());
    println!("--------------------");

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Part", "Status", "Details"]);

    let log_details = format!(
        "{} entries at {}..={}, last term {}, {} segments",
        report.entries(),
        report.first_position,
        report.last_position,
        report.last_term,
        report.segments
    );
    table.add_row(vec!["Log", if report.entries() > 0 { "FOUND" } else { "EMPTY" }, &log_details]);

    match report.term {
        Some(term) => {
            let voted = report
                .voted_for
                .map(|v| v.to_string())
                .unwrap_or_else(|| "nobody".into());
            table.add_row(vec!["Raft meta", "FOUND", &format!("term {term}, voted for {voted}")]);
        }
        None => {
            table.add_row(vec!["Raft meta", "MISSING", ""]);
        }
    }

    if report.snapshots.is_empty() {
        table.add_row(vec!["Snapshot", "MISSING", ""]);
    }
    for snapshot in &report.snapshots {
        match &snapshot.problem {
            None => {
                let created = chrono::DateTime::from_timestamp(snapshot.created_at as i64, 0)
                    .unwrap_or_default()
                    .to_rfc3339();
                let details = format!("position {}, {} bytes, taken {}", snapshot.position, snapshot.size, created);
                table.add_row(vec!["Snapshot", "FOUND", &details]);
            }
            Some(problem) => {
                let details = format!("position {}: {}", snapshot.position, problem);
                table.add_row(vec!["Snapshot", "CORRUPT", &details]);
            }
        }
    }

    println!("{table}\n");
    Ok(())
}

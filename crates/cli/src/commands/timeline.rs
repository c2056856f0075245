// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::path::Path;

use anyhow::Context;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use brook_node::codec;
use serde::Serialize;

use super::format_millis;
use crate::partition_dir::PartitionDir;

#[derive(Debug, Serialize)]
pub struct TimelineRow {
    pub position: i64,
    pub source_position: i64,
    pub term: i32,
    pub timestamp: i64,
    pub key: i64,
    pub record_type: String,
    pub value_type: String,
    pub intent: String,
}

/// Up to `limit` records starting at `from`.
pub fn rows(dir: &Path, from: i64, limit: usize) -> anyhow::Result<Vec<TimelineRow>> {
    let partition = PartitionDir::open(dir)?;
    let (log, _) = partition.open_log()?;

    let mut reader = log.new_reader();
    reader.seek(from.max(1));
    let mut rows = Vec::new();
    for entry in reader.take(limit) {
        let entry = entry?;
        let record = codec::decode(&entry).with_context(|| format!("decoding position {}", entry.position))?;
        rows.push(TimelineRow {
            position: record.position,
            source_position: record.source_position,
            term: entry.raft_term,
            timestamp: record.timestamp,
            key: record.key,
            record_type: format!("{:?}", record.record_type()),
            value_type: format!("{:?}", record.value_type()),
            intent: record.intent().name(),
        });
    }
    Ok(rows)
}

pub fn run(dir: &Path, from: i64, limit: usize, json: bool) -> anyhow::Result<()> {
    let rows = rows(dir, from, limit)?;

    if json {
        for row in &rows {
            println!("{}", serde_json::to_string(row)?);
        }
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Position", "Source", "Term", "Timestamp", "Key", "Type", "Value", "Intent"]);

    for row in rows {
        table.add_row(vec![
            row.position.to_string(),
            row.source_position.to_string(),
            row.term.to_string(),
            format_millis(row.timestamp),
            row.key.to_string(),
            row.record_type,
            row.value_type,
            row.intent,
        ]);
    }

    println!("\nRecord Timeline\n");
    println!("{table}\n");
    Ok(())
}

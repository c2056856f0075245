// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::path::PathBuf;

use brook_cli::commands::{inspect, replay_hash, timeline, verify};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "brook")]
#[command(about = "Offline tooling for brook partition directories", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the log range, raft meta and snapshots of a partition directory.
    Inspect {
        /// `<data_dir>/partition-<id>`
        dir: PathBuf,
    },
    /// Read every log entry and snapshot and report corruption.
    Verify { dir: PathBuf },
    /// List records in log order.
    Timeline {
        dir: PathBuf,

        /// First position to show.
        #[arg(long, default_value_t = 1)]
        from: i64,

        #[arg(long, default_value_t = 100)]
        limit: usize,

        /// One JSON object per line instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Replay the log and print the hash of the resulting state.
    ReplayHash {
        dir: PathBuf,

        /// Last position to replay (inclusive).
        #[arg(long)]
        to: Option<i64>,

        /// Start from the newest valid snapshot.
        #[arg(long)]
        from_snapshot: bool,

        /// Replay both ways and fail if the hashes differ.
        #[arg(long, conflicts_with = "from_snapshot")]
        compare: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { dir } => inspect::run(&dir),
        Commands::Verify { dir } => verify::run(&dir),
        Commands::Timeline { dir, from, limit, json } => timeline::run(&dir, from, limit, json),
        Commands::ReplayHash {
            dir,
            to,
            from_snapshot,
            compare,
        } => replay_hash::run(&dir, to, from_snapshot, compare),
    }
}

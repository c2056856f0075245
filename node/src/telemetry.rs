// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize telemetry (logs + metrics). Safe to call more than once; later
/// calls keep the first subscriber and recorder.
pub fn init_telemetry() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "brook_node=info,tower_http=info".into()),
    );
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    init_metrics();
}

/// Installs the Prometheus recorder and describes every metric the node emits.
pub fn init_metrics() {
    if PROM_HANDLE.get().is_some() {
        return;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROM_HANDLE.set(handle).is_err() {
                tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install Prometheus recorder: {}", e);
            return;
        }
    }

    metrics::describe_counter!("brook_records_processed_total", "Records dispatched to the engine");
    metrics::describe_counter!("brook_records_skipped_total", "Records read but not dispatched");
    metrics::describe_counter!("brook_records_appended_total", "Records appended by this node");
    metrics::describe_counter!("brook_incidents_created_total", "Incidents raised while processing");
    metrics::describe_histogram!("brook_processing_duration_seconds", "Time spent processing one record");
    metrics::describe_histogram!("brook_replay_duration_seconds", "Time spent replaying the log on recovery");
    metrics::describe_gauge!("brook_commit_position", "Commit position per partition");
    metrics::describe_gauge!("brook_partition_healthy", "1 when the partition processes records");
    metrics::describe_gauge!("brook_raft_term", "Current raft term per partition");
    metrics::describe_gauge!("brook_snapshot_size_bytes", "Size of the last snapshot in bytes");

    metrics::gauge!("brook_node_up", 1.0);
}

/// Get the Prometheus handle to render metrics
pub fn get_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use brook_kernel::state::Incident;
use brook_logstream::SnapshotError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::api::*;
use crate::broker::Broker;
use crate::errors::{NodeError, NodeResult};
use crate::partition::{ClientCommand, PartitionStatus};
use crate::processor::Health;
use crate::raft::{self, RaftRequest};

pub type SharedBroker = Arc<Broker>;

pub fn build_router(broker: SharedBroker) -> Router {
    let body_limit = broker.config().max_request_body_bytes;

    Router::new()
        // Commands
        .route("/v1/partitions/:id/deployments", post(deploy))
        .route("/v1/partitions/:id/process-instances", post(create_instance))
        .route("/v1/partitions/:id/process-instances/:key/cancel", post(cancel_instance))
        .route("/v1/partitions/:id/jobs/activate", post(activate_jobs))
        .route("/v1/partitions/:id/jobs/:key/complete", post(complete_job))
        .route("/v1/partitions/:id/jobs/:key/fail", post(fail_job))
        .route("/v1/partitions/:id/jobs/:key/retries", post(update_retries))
        .route("/v1/partitions/:id/messages", post(publish_message))
        .route("/v1/partitions/:id/element-instances/:key/variables", post(update_variables))
        .route("/v1/partitions/:id/incidents/:key/resolve", post(resolve_incident))
        // Queries
        .route("/v1/partitions", get(list_partitions))
        .route("/v1/partitions/:id/incidents", get(list_incidents))
        .route("/v1/partitions/:id/health", get(health))
        .route("/v1/partitions/:id/records", get(stream_records))
        // Admin
        .route("/v1/partitions/:id/pause", post(pause))
        .route("/v1/partitions/:id/resume", post(resume))
        .route("/v1/partitions/:id/snapshot", post(snapshot))
        .route("/v1/partitions/:id/snapshots/latest", get(download_snapshot))
        // Raft
        .route("/v1/raft/:id/:kind", post(raft_rpc))
        // Observability
        .route("/metrics", get(metrics_handler))
        .with_state(broker)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
}

async fn submit(broker: &Broker, partition_id: u32, command: ClientCommand) -> NodeResult<Json<CommandResult>> {
    let response = broker.partition(partition_id)?.submit(command).await?;
    Ok(Json(CommandResult::try_from(response)?))
}

async fn deploy(
    State(broker): State<SharedBroker>,
    Path(id): Path<u32>,
    Json(payload): Json<DeployRequest>,
) -> NodeResult<Json<CommandResult>> {
    if payload.resources.is_empty() {
        return Err(NodeError::InvalidInput("a deployment needs at least one resource".into()));
    }
    submit(&broker, id, ClientCommand::Deploy(payload.into_record())).await
}

async fn create_instance(
    State(broker): State<SharedBroker>,
    Path(id): Path<u32>,
    Json(payload): Json<CreateInstanceRequest>,
) -> NodeResult<Json<CommandResult>> {
    submit(&broker, id, ClientCommand::CreateInstance(payload.into_record()?)).await
}

async fn cancel_instance(
    State(broker): State<SharedBroker>,
    Path((id, key)): Path<(u32, i64)>,
) -> NodeResult<Json<CommandResult>> {
    submit(&broker, id, ClientCommand::CancelInstance(key)).await
}

async fn activate_jobs(
    State(broker): State<SharedBroker>,
    Path(id): Path<u32>,
    Json(payload): Json<ActivateJobsRequest>,
) -> NodeResult<Json<CommandResult>> {
    submit(&broker, id, ClientCommand::ActivateJobs(payload.into_record())).await
}

async fn complete_job(
    State(broker): State<SharedBroker>,
    Path((id, key)): Path<(u32, i64)>,
    payload: Option<Json<CompleteJobRequest>>,
) -> NodeResult<Json<CommandResult>> {
    let Json(payload) = payload.unwrap_or_default();
    submit(
        &broker,
        id,
        ClientCommand::CompleteJob {
            job_key: key,
            variables: payload.variables,
        },
    )
    .await
}

async fn fail_job(
    State(broker): State<SharedBroker>,
    Path((id, key)): Path<(u32, i64)>,
    Json(payload): Json<FailJobRequest>,
) -> NodeResult<Json<CommandResult>> {
    submit(
        &broker,
        id,
        ClientCommand::FailJob {
            job_key: key,
            retries: payload.retries,
            error_message: payload.error_message,
        },
    )
    .await
}

async fn update_retries(
    State(broker): State<SharedBroker>,
    Path((id, key)): Path<(u32, i64)>,
    Json(payload): Json<UpdateRetriesRequest>,
) -> NodeResult<Json<CommandResult>> {
    submit(
        &broker,
        id,
        ClientCommand::UpdateJobRetries {
            job_key: key,
            retries: payload.retries,
        },
    )
    .await
}

async fn publish_message(
    State(broker): State<SharedBroker>,
    Path(id): Path<u32>,
    Json(payload): Json<PublishMessageRequest>,
) -> NodeResult<Json<CommandResult>> {
    submit(&broker, id, ClientCommand::PublishMessage(payload.into_record())).await
}

async fn update_variables(
    State(broker): State<SharedBroker>,
    Path((id, key)): Path<(u32, i64)>,
    Json(payload): Json<UpdateVariablesRequest>,
) -> NodeResult<Json<CommandResult>> {
    submit(&broker, id, ClientCommand::UpdateVariables(payload.into_record(key))).await
}

async fn resolve_incident(
    State(broker): State<SharedBroker>,
    Path((id, key)): Path<(u32, i64)>,
) -> NodeResult<Json<CommandResult>> {
    submit(&broker, id, ClientCommand::ResolveIncident(key)).await
}

async fn list_partitions(State(broker): State<SharedBroker>) -> NodeResult<Json<Vec<PartitionStatus>>> {
    Ok(Json(broker.statuses().await?))
}

async fn list_incidents(State(broker): State<SharedBroker>, Path(id): Path<u32>) -> NodeResult<Json<Vec<Incident>>> {
    Ok(Json(broker.partition(id)?.incidents().await?))
}

/// 200 unless this node leads the partition and its processor halted.
async fn health(State(broker): State<SharedBroker>, Path(id): Path<u32>) -> NodeResult<Response> {
    let status = broker.partition(id)?.status().await?;
    let halted = matches!(
        status.processor.as_ref().map(|p| &p.health),
        Some(Health::Unhealthy(_))
    );
    let code = if halted {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    Ok((code, Json(status)).into_response())
}

/// Records this node's processor sees committed from now on, as NDJSON.
async fn stream_records(State(broker): State<SharedBroker>, Path(id): Path<u32>) -> NodeResult<Response> {
    let rx = broker.partition(id)?.subscribe();

    // Lagging subscribers lose records rather than block the partition.
    let lines = BroadcastStream::new(rx).filter_map(|record| {
        let record = record.ok()?;
        let mut line = serde_json::to_string(&RecordLine::from(record)).ok()?;
        line.push('\n');
        Some(Ok::<_, std::io::Error>(line))
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

async fn pause(State(broker): State<SharedBroker>, Path(id): Path<u32>) -> NodeResult<StatusCode> {
    broker.partition(id)?.pause().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume(State(broker): State<SharedBroker>, Path(id): Path<u32>) -> NodeResult<StatusCode> {
    broker.partition(id)?.resume().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn snapshot(State(broker): State<SharedBroker>, Path(id): Path<u32>) -> NodeResult<Json<SnapshotResponse>> {
    let taken = broker.partition(id)?.snapshot().await?;
    Ok(Json(SnapshotResponse::from(taken)))
}

/// Streams the newest snapshot file, header and checksum included.
async fn download_snapshot(State(broker): State<SharedBroker>, Path(id): Path<u32>) -> NodeResult<Response> {
    let Some((position, path)) = broker.partition(id)?.latest_snapshot().await? else {
        return Ok((StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "no snapshot yet" }))).into_response());
    };
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| NodeError::Snapshot(SnapshotError::Io(e)))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"snapshot-{position}.snap\"")),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

async fn raft_rpc(
    State(broker): State<SharedBroker>,
    Path((id, kind)): Path<(u32, String)>,
    body: Bytes,
) -> NodeResult<Response> {
    let request: RaftRequest = raft::decode(&body)?;
    if request.endpoint() != kind {
        return Err(NodeError::InvalidInput(format!(
            "{} request sent to the {} endpoint",
            request.endpoint(),
            kind
        )));
    }

    let response = broker.partition(id)?.raft_request(request).await?;
    let bytes = raft::encode(&response)?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

async fn metrics_handler() -> String {
    crate::telemetry::get_metrics()
}

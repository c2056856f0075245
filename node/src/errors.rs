// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use brook_kernel::record::RejectionType;
use brook_kernel::KernelError;
use brook_logstream::{LogStreamError, SnapshotError};
use serde_json::json;
use thiserror::Error;

use crate::raft::RaftError;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("Log error: {0}")]
    Log(#[from] LogStreamError),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("Raft error: {0}")]
    Raft(#[from] RaftError),
    #[error("Command rejected ({rejection_type:?}): {reason}")]
    Rejected {
        rejection_type: RejectionType,
        reason: String,
    },
    #[error("Partition {0} is not hosted by this node")]
    UnknownPartition(u32),
    #[error("Not the leader of partition {partition_id}")]
    NotLeader {
        partition_id: u32,
        leader: Option<u64>,
    },
    #[error("Partition {0} is not healthy: {1}")]
    Unhealthy(u32, String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Partition {0} stopped")]
    Stopped(u32),
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let status = match &self {
            NodeError::Rejected { rejection_type, .. } => match rejection_type {
                RejectionType::NotFound => StatusCode::NOT_FOUND,
                RejectionType::InvalidArgument => StatusCode::BAD_REQUEST,
                RejectionType::AlreadyExists | RejectionType::InvalidState => StatusCode::CONFLICT,
            },
            NodeError::UnknownPartition(_) => StatusCode::NOT_FOUND,
            NodeError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            NodeError::Unhealthy(..) | NodeError::Stopped(_) => StatusCode::SERVICE_UNAVAILABLE,
            NodeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            NodeError::Transport(_) => StatusCode::BAD_GATEWAY,
            NodeError::Kernel(_) | NodeError::Log(_) | NodeError::Snapshot(_) | NodeError::Raft(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = match &self {
            NodeError::Rejected {
                rejection_type,
                reason,
            } => json!({
                "error": reason,
                "rejection_type": format!("{rejection_type:?}"),
            }),
            NodeError::NotLeader { leader, .. } => json!({
                "error": self.to_string(),
                "leader": leader,
            }),
            _ => json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

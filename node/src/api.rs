// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! JSON bodies of the command API.

use brook_kernel::engine::CommandResponse;
use brook_kernel::expr::Document;
use brook_kernel::record::{
    DeploymentRecord, DeploymentResource, JobBatchRecord, MessageRecord, ProcessInstanceCreationRecord, RecordValue,
    UpdateSemantics, VariableDocumentRecord, NO_KEY,
};
use brook_kernel::TypedRecord;
use brook_logstream::SnapshotMetadata;
use serde::{Deserialize, Serialize};

use crate::errors::{NodeError, NodeResult};

#[derive(Deserialize)]
pub struct ResourceBody {
    pub name: String,
    /// The process model, either as an object or as JSON text.
    pub content: serde_json::Value,
}

#[derive(Deserialize)]
pub struct DeployRequest {
    pub resources: Vec<ResourceBody>,
}

impl DeployRequest {
    pub fn into_record(self) -> DeploymentRecord {
        let resources = self
            .resources
            .into_iter()
            .map(|r| DeploymentResource {
                name: r.name,
                content: match r.content {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                },
            })
            .collect();
        DeploymentRecord {
            resources,
            processes: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateInstanceRequest {
    #[serde(default)]
    pub bpmn_process_id: String,
    pub version: Option<i32>,
    pub process_definition_key: Option<i64>,
    #[serde(default)]
    pub variables: Document,
}

impl CreateInstanceRequest {
    pub fn into_record(self) -> NodeResult<ProcessInstanceCreationRecord> {
        if self.bpmn_process_id.is_empty() && self.process_definition_key.is_none() {
            return Err(NodeError::InvalidInput(
                "either bpmn_process_id or process_definition_key is required".into(),
            ));
        }
        Ok(ProcessInstanceCreationRecord {
            bpmn_process_id: self.bpmn_process_id,
            version: self.version.unwrap_or(-1),
            process_definition_key: self.process_definition_key.unwrap_or(NO_KEY),
            process_instance_key: NO_KEY,
            variables: self.variables,
        })
    }
}

#[derive(Deserialize, Default)]
pub struct CompleteJobRequest {
    #[serde(default)]
    pub variables: Document,
}

#[derive(Deserialize)]
pub struct FailJobRequest {
    pub retries: i32,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Deserialize)]
pub struct UpdateRetriesRequest {
    pub retries: i32,
}

#[derive(Deserialize)]
pub struct ActivateJobsRequest {
    pub job_type: String,
    pub worker: String,
    /// Milliseconds the jobs stay reserved for `worker`.
    pub timeout_ms: i64,
    pub max_jobs: i32,
}

impl ActivateJobsRequest {
    pub fn into_record(self) -> JobBatchRecord {
        JobBatchRecord {
            job_type: self.job_type,
            worker: self.worker,
            timeout: self.timeout_ms,
            max_jobs_to_activate: self.max_jobs,
            job_keys: Vec::new(),
            jobs: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
pub struct PublishMessageRequest {
    pub name: String,
    pub correlation_key: String,
    #[serde(default)]
    pub time_to_live_ms: i64,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub variables: Document,
}

impl PublishMessageRequest {
    pub fn into_record(self) -> MessageRecord {
        MessageRecord {
            name: self.name,
            correlation_key: self.correlation_key,
            time_to_live: self.time_to_live_ms,
            message_id: self.message_id,
            variables: self.variables,
            deadline: NO_KEY,
        }
    }
}

#[derive(Deserialize)]
pub struct UpdateVariablesRequest {
    /// Write every variable on the given scope instead of where it is
    /// already defined.
    #[serde(default)]
    pub local: bool,
    pub variables: Document,
}

impl UpdateVariablesRequest {
    pub fn into_record(self, scope_key: i64) -> VariableDocumentRecord {
        VariableDocumentRecord {
            scope_key,
            update_semantics: if self.local {
                UpdateSemantics::Local
            } else {
                UpdateSemantics::Propagate
            },
            variables: self.variables,
        }
    }
}

/// What the engine answered. Rejections become errors.
#[derive(Serialize, Debug)]
pub struct CommandResult {
    pub key: i64,
    pub intent: String,
    pub value: RecordValue,
}

impl TryFrom<CommandResponse> for CommandResult {
    type Error = NodeError;

    fn try_from(response: CommandResponse) -> Result<Self, Self::Error> {
        if let Some((rejection_type, reason)) = response.rejection {
            return Err(NodeError::Rejected {
                rejection_type,
                reason,
            });
        }
        Ok(Self {
            key: response.key,
            intent: response.intent.name(),
            value: response.value,
        })
    }
}

/// One line of the record stream.
#[derive(Serialize, Debug)]
pub struct RecordLine {
    pub position: i64,
    pub source_position: i64,
    pub key: i64,
    pub timestamp: i64,
    pub record_type: String,
    pub value_type: String,
    pub intent: String,
    pub value: RecordValue,
}

impl From<TypedRecord> for RecordLine {
    fn from(record: TypedRecord) -> Self {
        Self {
            position: record.position,
            source_position: record.source_position,
            key: record.key,
            timestamp: record.timestamp,
            record_type: format!("{:?}", record.record_type()),
            value_type: format!("{:?}", record.value_type()),
            intent: record.intent().name(),
            value: record.value,
        }
    }
}

#[derive(Serialize)]
pub struct SnapshotResponse {
    pub taken: bool,
    pub position: Option<i64>,
    pub size: Option<u64>,
}

impl From<Option<SnapshotMetadata>> for SnapshotResponse {
    fn from(snapshot: Option<SnapshotMetadata>) -> Self {
        Self {
            taken: snapshot.is_some(),
            position: snapshot.as_ref().map(|s| s.position),
            size: snapshot.as_ref().map(|s| s.size),
        }
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Record values. One struct per value type.

use serde::{Deserialize, Serialize};

use super::ValueType;
use crate::expr::Document;

/// Marks "no key" in key-typed fields.
pub const NO_KEY: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BpmnElementType {
    Process,
    StartEvent,
    EndEvent,
    ServiceTask,
    ReceiveTask,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    IntermediateCatchEvent,
    BoundaryEvent,
    SubProcess,
    SequenceFlow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    IoMappingError,
    ConditionError,
    JobNoRetries,
    ExtractValueError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResource {
    pub name: String,
    /// The process model as JSON text.
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetadata {
    pub bpmn_process_id: String,
    pub version: i32,
    pub process_definition_key: i64,
    pub resource_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub resources: Vec<DeploymentResource>,
    pub processes: Vec<ProcessMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceCreationRecord {
    pub bpmn_process_id: String,
    /// `-1` selects the latest version.
    pub version: i32,
    /// Takes precedence over `bpmn_process_id` when set.
    pub process_definition_key: i64,
    pub process_instance_key: i64,
    pub variables: Document,
}

impl Default for ProcessInstanceCreationRecord {
    fn default() -> Self {
        Self {
            bpmn_process_id: String::new(),
            version: -1,
            process_definition_key: NO_KEY,
            process_instance_key: NO_KEY,
            variables: Document::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceRecord {
    pub bpmn_process_id: String,
    pub version: i32,
    pub process_definition_key: i64,
    pub process_instance_key: i64,
    pub element_id: String,
    pub flow_scope_key: i64,
    pub bpmn_element_type: BpmnElementType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_type: String,
    pub retries: i32,
    pub worker: String,
    pub deadline: i64,
    pub error_message: String,
    pub variables: Document,
    pub bpmn_process_id: String,
    pub process_definition_key: i64,
    pub process_instance_key: i64,
    pub element_id: String,
    pub element_instance_key: i64,
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            job_type: String::new(),
            retries: 0,
            worker: String::new(),
            deadline: NO_KEY,
            error_message: String::new(),
            variables: Document::default(),
            bpmn_process_id: String::new(),
            process_definition_key: NO_KEY,
            process_instance_key: NO_KEY,
            element_id: String::new(),
            element_instance_key: NO_KEY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobBatchRecord {
    pub job_type: String,
    pub worker: String,
    /// Milliseconds an activated job stays reserved for `worker`.
    pub timeout: i64,
    pub max_jobs_to_activate: i32,
    pub job_keys: Vec<i64>,
    pub jobs: Vec<JobRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub error_type: ErrorType,
    pub error_message: String,
    pub bpmn_process_id: String,
    pub process_definition_key: i64,
    pub process_instance_key: i64,
    pub element_id: String,
    pub element_instance_key: i64,
    pub job_key: i64,
    pub variable_scope_key: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    /// `-1` for timer start events.
    pub element_instance_key: i64,
    pub process_instance_key: i64,
    pub process_definition_key: i64,
    pub target_element_id: String,
    pub due_date: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub name: String,
    pub correlation_key: String,
    pub time_to_live: i64,
    /// Optional publisher-chosen id; a buffered message with the same
    /// name, correlation key and id rejects the publish.
    pub message_id: String,
    pub variables: Document,
    pub deadline: i64,
}

impl Default for MessageRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            correlation_key: String::new(),
            time_to_live: 0,
            message_id: String::new(),
            variables: Document::default(),
            deadline: NO_KEY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSubscriptionRecord {
    pub process_instance_key: i64,
    pub element_instance_key: i64,
    pub bpmn_process_id: String,
    pub message_name: String,
    pub correlation_key: String,
    /// The catch, boundary or start event that fires when the message arrives.
    pub target_element_id: String,
    pub message_key: i64,
    pub variables: Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub name: String,
    /// JSON text.
    pub value: String,
    pub scope_key: i64,
    pub process_instance_key: i64,
    pub process_definition_key: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateSemantics {
    /// Each variable is written at the nearest scope that defines it.
    Propagate,
    /// Every variable is written on the given scope.
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDocumentRecord {
    pub scope_key: i64,
    pub update_semantics: UpdateSemantics,
    pub variables: Document,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftRecord {
    pub leader_id: u64,
    pub term: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordValue {
    Deployment(DeploymentRecord),
    ProcessInstanceCreation(ProcessInstanceCreationRecord),
    ProcessInstance(ProcessInstanceRecord),
    Job(JobRecord),
    JobBatch(JobBatchRecord),
    Incident(IncidentRecord),
    Timer(TimerRecord),
    Message(MessageRecord),
    MessageSubscription(MessageSubscriptionRecord),
    Variable(VariableRecord),
    VariableDocument(VariableDocumentRecord),
    Raft(RaftRecord),
}

impl RecordValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            RecordValue::Deployment(_) => ValueType::Deployment,
            RecordValue::ProcessInstanceCreation(_) => ValueType::ProcessInstanceCreation,
            RecordValue::ProcessInstance(_) => ValueType::ProcessInstance,
            RecordValue::Job(_) => ValueType::Job,
            RecordValue::JobBatch(_) => ValueType::JobBatch,
            RecordValue::Incident(_) => ValueType::Incident,
            RecordValue::Timer(_) => ValueType::Timer,
            RecordValue::Message(_) => ValueType::Message,
            RecordValue::MessageSubscription(_) => ValueType::MessageSubscription,
            RecordValue::Variable(_) => ValueType::Variable,
            RecordValue::VariableDocument(_) => ValueType::VariableDocument,
            RecordValue::Raft(_) => ValueType::Raft,
        }
    }

    /// The process instance this value belongs to, if any.
    pub fn process_instance_key(&self) -> Option<i64> {
        let key = match self {
            RecordValue::ProcessInstanceCreation(v) => v.process_instance_key,
            RecordValue::ProcessInstance(v) => v.process_instance_key,
            RecordValue::Job(v) => v.process_instance_key,
            RecordValue::Incident(v) => v.process_instance_key,
            RecordValue::Timer(v) => v.process_instance_key,
            RecordValue::MessageSubscription(v) => v.process_instance_key,
            RecordValue::Variable(v) => v.process_instance_key,
            _ => NO_KEY,
        };
        (key != NO_KEY).then_some(key)
    }
}

macro_rules! value_from {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for RecordValue {
                fn from(v: $ty) -> Self {
                    RecordValue::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    Deployment => DeploymentRecord,
    ProcessInstanceCreation => ProcessInstanceCreationRecord,
    ProcessInstance => ProcessInstanceRecord,
    Job => JobRecord,
    JobBatch => JobBatchRecord,
    Incident => IncidentRecord,
    Timer => TimerRecord,
    Message => MessageRecord,
    MessageSubscription => MessageSubscriptionRecord,
    Variable => VariableRecord,
    VariableDocument => VariableDocumentRecord,
    Raft => RaftRecord,
}

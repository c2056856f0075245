// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Intents per value type.
//!
//! Commands are imperative (`Create`), events are past tense (`Created`).
//! A record's value type is implied by its intent.

use serde::{Deserialize, Serialize};

use super::ValueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentIntent {
    Create,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessInstanceCreationIntent {
    Create,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessInstanceIntent {
    ElementActivating,
    ElementActivated,
    ElementCompleting,
    ElementCompleted,
    ElementTerminating,
    ElementTerminated,
    EventOccurred,
    SequenceFlowTaken,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobIntent {
    Created,
    Complete,
    Completed,
    Fail,
    Failed,
    UpdateRetries,
    RetriesUpdated,
    TimeOut,
    TimedOut,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobBatchIntent {
    Activate,
    Activated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentIntent {
    Created,
    Resolve,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerIntent {
    Created,
    Trigger,
    Triggered,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageIntent {
    Publish,
    Published,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSubscriptionIntent {
    Opened,
    Correlated,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableIntent {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableDocumentIntent {
    Update,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaftIntent {
    /// Written by every new leader before it accepts client commands.
    InitialEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    Deployment(DeploymentIntent),
    ProcessInstanceCreation(ProcessInstanceCreationIntent),
    ProcessInstance(ProcessInstanceIntent),
    Job(JobIntent),
    JobBatch(JobBatchIntent),
    Incident(IncidentIntent),
    Timer(TimerIntent),
    Message(MessageIntent),
    MessageSubscription(MessageSubscriptionIntent),
    Variable(VariableIntent),
    VariableDocument(VariableDocumentIntent),
    Raft(RaftIntent),
}

impl Intent {
    pub fn value_type(&self) -> ValueType {
        match self {
            Intent::Deployment(_) => ValueType::Deployment,
            Intent::ProcessInstanceCreation(_) => ValueType::ProcessInstanceCreation,
            Intent::ProcessInstance(_) => ValueType::ProcessInstance,
            Intent::Job(_) => ValueType::Job,
            Intent::JobBatch(_) => ValueType::JobBatch,
            Intent::Incident(_) => ValueType::Incident,
            Intent::Timer(_) => ValueType::Timer,
            Intent::Message(_) => ValueType::Message,
            Intent::MessageSubscription(_) => ValueType::MessageSubscription,
            Intent::Variable(_) => ValueType::Variable,
            Intent::VariableDocument(_) => ValueType::VariableDocument,
            Intent::Raft(_) => ValueType::Raft,
        }
    }

    /// Short display name, e.g. `ELEMENT_ACTIVATING`.
    pub fn name(&self) -> String {
        let debug = match self {
            Intent::Deployment(i) => format!("{i:?}"),
            Intent::ProcessInstanceCreation(i) => format!("{i:?}"),
            Intent::ProcessInstance(i) => format!("{i:?}"),
            Intent::Job(i) => format!("{i:?}"),
            Intent::JobBatch(i) => format!("{i:?}"),
            Intent::Incident(i) => format!("{i:?}"),
            Intent::Timer(i) => format!("{i:?}"),
            Intent::Message(i) => format!("{i:?}"),
            Intent::MessageSubscription(i) => format!("{i:?}"),
            Intent::Variable(i) => format!("{i:?}"),
            Intent::VariableDocument(i) => format!("{i:?}"),
            Intent::Raft(i) => format!("{i:?}"),
        };
        screaming_snake(&debug)
    }
}

fn screaming_snake(camel: &str) -> String {
    let mut out = String::with_capacity(camel.len() + 4);
    for (i, c) in camel.chars().enumerate() {
        if c.is_uppercase() && i > 0 {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

impl From<DeploymentIntent> for Intent {
    fn from(i: DeploymentIntent) -> Self {
        Intent::Deployment(i)
    }
}

impl From<ProcessInstanceCreationIntent> for Intent {
    fn from(i: ProcessInstanceCreationIntent) -> Self {
        Intent::ProcessInstanceCreation(i)
    }
}

impl From<ProcessInstanceIntent> for Intent {
    fn from(i: ProcessInstanceIntent) -> Self {
        Intent::ProcessInstance(i)
    }
}

impl From<JobIntent> for Intent {
    fn from(i: JobIntent) -> Self {
        Intent::Job(i)
    }
}

impl From<JobBatchIntent> for Intent {
    fn from(i: JobBatchIntent) -> Self {
        Intent::JobBatch(i)
    }
}

impl From<IncidentIntent> for Intent {
    fn from(i: IncidentIntent) -> Self {
        Intent::Incident(i)
    }
}

impl From<TimerIntent> for Intent {
    fn from(i: TimerIntent) -> Self {
        Intent::Timer(i)
    }
}

impl From<MessageIntent> for Intent {
    fn from(i: MessageIntent) -> Self {
        Intent::Message(i)
    }
}

impl From<MessageSubscriptionIntent> for Intent {
    fn from(i: MessageSubscriptionIntent) -> Self {
        Intent::MessageSubscription(i)
    }
}

impl From<VariableIntent> for Intent {
    fn from(i: VariableIntent) -> Self {
        Intent::Variable(i)
    }
}

impl From<VariableDocumentIntent> for Intent {
    fn from(i: VariableDocumentIntent) -> Self {
        Intent::VariableDocument(i)
    }
}

impl From<RaftIntent> for Intent {
    fn from(i: RaftIntent) -> Self {
        Intent::Raft(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_names() {
        assert_eq!(
            Intent::from(ProcessInstanceIntent::ElementActivating).name(),
            "ELEMENT_ACTIVATING"
        );
        assert_eq!(Intent::from(JobIntent::TimeOut).name(), "TIME_OUT");
        assert_eq!(
            Intent::from(RaftIntent::InitialEntry).value_type(),
            ValueType::Raft
        );
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Deployable process models.
//!
//! Models are plain JSON documents. They are stored verbatim in deployment
//! records and compiled into an [`ExecutableProcess`](super::ExecutableProcess)
//! on every partition that deploys them.
//!
//! ```json
//! {
//!   "processId": "order",
//!   "elements": [
//!     { "id": "start", "type": "startEvent" },
//!     { "id": "pay", "type": "serviceTask", "jobType": "payment" },
//!     { "id": "end", "type": "endEvent" }
//!   ],
//!   "flows": [
//!     { "id": "f1", "source": "start", "target": "pay" },
//!     { "id": "f2", "source": "pay", "target": "end" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::expr::Mapping;

fn default_retries() -> i32 {
    3
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessModel {
    pub process_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub elements: Vec<ElementModel>,
    #[serde(default)]
    pub flows: Vec<FlowModel>,
}

impl ProcessModel {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        // A model holds only strings, numbers and nested structs.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementModel {
    pub id: String,
    #[serde(flatten)]
    pub kind: ElementKindModel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_mappings: Vec<Mapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_mappings: Vec<Mapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ElementKindModel {
    StartEvent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timer: Option<TimerDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<MessageStartDefinition>,
    },
    EndEvent,
    ServiceTask {
        job_type: String,
        #[serde(default = "default_retries")]
        retries: i32,
    },
    ReceiveTask {
        message: MessageDefinition,
    },
    ExclusiveGateway {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_flow: Option<String>,
    },
    ParallelGateway,
    InclusiveGateway {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_flow: Option<String>,
    },
    EventBasedGateway,
    IntermediateCatchEvent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timer: Option<TimerDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<MessageDefinition>,
    },
    BoundaryEvent {
        attached_to: String,
        #[serde(default = "default_true")]
        cancel_activity: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timer: Option<TimerDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<MessageDefinition>,
    },
    SubProcess {
        elements: Vec<ElementModel>,
        #[serde(default)]
        flows: Vec<FlowModel>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerDefinition {
    /// ISO-8601 duration, e.g. `PT30S`.
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDefinition {
    pub name: String,
    /// Path into the element's variables, e.g. `$.orderId`.
    pub correlation_key: String,
}

/// A message start event needs no correlation key: every published message
/// with the name starts a new instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStartDefinition {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowModel {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_model() {
        let text = r#"{
            "processId": "order",
            "elements": [
                { "id": "start", "type": "startEvent" },
                { "id": "pay", "type": "serviceTask", "jobType": "payment",
                  "inputMappings": [{ "source": "$.total", "target": "$.amount" }] },
                { "id": "split", "type": "exclusiveGateway", "defaultFlow": "f3" },
                { "id": "wait", "type": "intermediateCatchEvent", "timer": { "duration": "PT5S" } },
                { "id": "end", "type": "endEvent" }
            ],
            "flows": [
                { "id": "f1", "source": "start", "target": "pay" },
                { "id": "f2", "source": "pay", "target": "split" },
                { "id": "f3", "source": "split", "target": "end" },
                { "id": "f4", "source": "split", "target": "wait", "condition": "$.total > 10" },
                { "id": "f5", "source": "wait", "target": "end" }
            ]
        }"#;

        let model = ProcessModel::from_json(text).unwrap();
        assert_eq!(model.elements.len(), 5);
        assert_eq!(
            model.elements[1].kind,
            ElementKindModel::ServiceTask {
                job_type: "payment".into(),
                retries: 3
            }
        );
        assert_eq!(model.elements[1].input_mappings.len(), 1);

        let again = ProcessModel::from_json(&model.to_json()).unwrap();
        assert_eq!(again, model);
    }
}

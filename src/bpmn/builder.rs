// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Fluent construction of process models, mostly for tests and demos.

use super::model::*;
use crate::expr::Mapping;

#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    model: ProcessModel,
}

impl ProcessBuilder {
    pub fn new(process_id: impl Into<String>) -> Self {
        Self {
            model: ProcessModel {
                process_id: process_id.into(),
                name: None,
                elements: Vec::new(),
                flows: Vec::new(),
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.model.name = Some(name.into());
        self
    }

    pub fn element(mut self, id: impl Into<String>, kind: ElementKindModel) -> Self {
        self.model.elements.push(ElementModel {
            id: id.into(),
            kind,
            input_mappings: Vec::new(),
            output_mappings: Vec::new(),
        });
        self
    }

    pub fn start_event(self, id: &str) -> Self {
        self.element(
            id,
            ElementKindModel::StartEvent {
                timer: None,
                message: None,
            },
        )
    }

    pub fn message_start_event(self, id: &str, message: &str) -> Self {
        self.element(
            id,
            ElementKindModel::StartEvent {
                timer: None,
                message: Some(MessageStartDefinition { name: message.into() }),
            },
        )
    }

    pub fn timer_start_event(self, id: &str, duration: &str) -> Self {
        self.element(
            id,
            ElementKindModel::StartEvent {
                timer: Some(TimerDefinition {
                    duration: duration.into(),
                }),
                message: None,
            },
        )
    }

    pub fn end_event(self, id: &str) -> Self {
        self.element(id, ElementKindModel::EndEvent)
    }

    pub fn service_task(self, id: &str, job_type: &str) -> Self {
        self.service_task_with_retries(id, job_type, 3)
    }

    pub fn service_task_with_retries(self, id: &str, job_type: &str, retries: i32) -> Self {
        self.element(
            id,
            ElementKindModel::ServiceTask {
                job_type: job_type.into(),
                retries,
            },
        )
    }

    pub fn receive_task(self, id: &str, message: &str, correlation_key: &str) -> Self {
        self.element(
            id,
            ElementKindModel::ReceiveTask {
                message: message_def(message, correlation_key),
            },
        )
    }

    pub fn exclusive_gateway(self, id: &str, default_flow: Option<&str>) -> Self {
        self.element(
            id,
            ElementKindModel::ExclusiveGateway {
                default_flow: default_flow.map(str::to_string),
            },
        )
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.element(id, ElementKindModel::ParallelGateway)
    }

    pub fn inclusive_gateway(self, id: &str, default_flow: Option<&str>) -> Self {
        self.element(
            id,
            ElementKindModel::InclusiveGateway {
                default_flow: default_flow.map(str::to_string),
            },
        )
    }

    pub fn event_based_gateway(self, id: &str) -> Self {
        self.element(id, ElementKindModel::EventBasedGateway)
    }

    pub fn timer_catch_event(self, id: &str, duration: &str) -> Self {
        self.element(
            id,
            ElementKindModel::IntermediateCatchEvent {
                timer: Some(TimerDefinition {
                    duration: duration.into(),
                }),
                message: None,
            },
        )
    }

    pub fn message_catch_event(self, id: &str, message: &str, correlation_key: &str) -> Self {
        self.element(
            id,
            ElementKindModel::IntermediateCatchEvent {
                timer: None,
                message: Some(message_def(message, correlation_key)),
            },
        )
    }

    pub fn timer_boundary_event(self, id: &str, attached_to: &str, duration: &str, cancel_activity: bool) -> Self {
        self.element(
            id,
            ElementKindModel::BoundaryEvent {
                attached_to: attached_to.into(),
                cancel_activity,
                timer: Some(TimerDefinition {
                    duration: duration.into(),
                }),
                message: None,
            },
        )
    }

    pub fn message_boundary_event(
        self,
        id: &str,
        attached_to: &str,
        message: &str,
        correlation_key: &str,
        cancel_activity: bool,
    ) -> Self {
        self.element(
            id,
            ElementKindModel::BoundaryEvent {
                attached_to: attached_to.into(),
                cancel_activity,
                timer: None,
                message: Some(message_def(message, correlation_key)),
            },
        )
    }

    /// Embeds `inner`'s elements and flows as a sub-process.
    pub fn sub_process(self, id: &str, inner: ProcessBuilder) -> Self {
        let inner = inner.build();
        self.element(
            id,
            ElementKindModel::SubProcess {
                elements: inner.elements,
                flows: inner.flows,
            },
        )
    }

    pub fn input(mut self, element_id: &str, source: &str, target: &str) -> Self {
        if let Some(element) = self.model.elements.iter_mut().find(|e| e.id == element_id) {
            element.input_mappings.push(Mapping::new(source, target));
        }
        self
    }

    pub fn output(mut self, element_id: &str, source: &str, target: &str) -> Self {
        if let Some(element) = self.model.elements.iter_mut().find(|e| e.id == element_id) {
            element.output_mappings.push(Mapping::new(source, target));
        }
        self
    }

    /// A flow with the id `{source}-{target}`.
    pub fn flow(self, source: &str, target: &str) -> Self {
        let id = format!("{source}-{target}");
        self.named_flow(&id, source, target)
    }

    pub fn named_flow(mut self, id: &str, source: &str, target: &str) -> Self {
        self.model.flows.push(FlowModel {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        });
        self
    }

    pub fn conditional_flow(mut self, id: &str, source: &str, target: &str, condition: &str) -> Self {
        self.model.flows.push(FlowModel {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: Some(condition.into()),
        });
        self
    }

    /// Connects consecutive ids with unconditional flows.
    pub fn sequence(mut self, ids: &[&str]) -> Self {
        for pair in ids.windows(2) {
            self = self.flow(pair[0], pair[1]);
        }
        self
    }

    pub fn build(self) -> ProcessModel {
        self.model
    }
}

fn message_def(name: &str, correlation_key: &str) -> MessageDefinition {
    MessageDefinition {
        name: name.into(),
        correlation_key: correlation_key.into(),
    }
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Building blocks shared by the element processors.

use crate::bpmn::{ExecutableElement, ExecutableProcess};
use crate::engine::{Context, ProcessingError};
use crate::expr::ProcessingFailure;
use crate::record::*;
use crate::state::{ElementInstance, FailedEvent, Incident, LifecycleState, VariableChange};

impl Context<'_> {
    /// Writes `ElementActivating` for `element` inside `scope_key` and spawns
    /// the token it will consume. `template` supplies the process fields.
    pub fn activate_element(
        &mut self,
        scope_key: i64,
        template: &ProcessInstanceRecord,
        element: &ExecutableElement,
    ) -> i64 {
        let key = self.next_key();
        let record = ProcessInstanceRecord {
            bpmn_process_id: template.bpmn_process_id.clone(),
            version: template.version,
            process_definition_key: template.process_definition_key,
            process_instance_key: template.process_instance_key,
            element_id: element.id.clone(),
            flow_scope_key: scope_key,
            bpmn_element_type: element.element_type(),
        };
        self.state.instances.spawn_tokens(scope_key, 1);
        self.result
            .append_event(key, ProcessInstanceIntent::ElementActivating, record);
        key
    }

    pub fn write_lifecycle(&mut self, instance: &ElementInstance, intent: ProcessInstanceIntent) {
        self.result
            .append_event(instance.key, intent, instance.record.clone());
    }

    pub fn raise_incident(
        &mut self,
        failure: ProcessingFailure,
        instance: &ElementInstance,
        failed_intent: ProcessInstanceIntent,
    ) {
        let key = self.next_key();
        let record = IncidentRecord {
            error_type: failure.error_type,
            error_message: failure.message,
            bpmn_process_id: instance.record.bpmn_process_id.clone(),
            process_definition_key: instance.record.process_definition_key,
            process_instance_key: instance.record.process_instance_key,
            element_id: instance.record.element_id.clone(),
            element_instance_key: instance.key,
            job_key: NO_KEY,
            variable_scope_key: instance.key,
        };
        self.state.incidents.create(Incident {
            key,
            record: record.clone(),
            failed_event: Some(FailedEvent {
                key: instance.key,
                intent: failed_intent,
                value: instance.record.clone(),
            }),
        });
        self.result.append_event(key, IncidentIntent::Created, record);
    }

    pub fn write_variable_changes(&mut self, changes: Vec<VariableChange>, template: &ProcessInstanceRecord) {
        for change in changes {
            let key = self.next_key();
            let intent = if change.created {
                VariableIntent::Created
            } else {
                VariableIntent::Updated
            };
            self.result.append_informational(
                key,
                intent,
                VariableRecord {
                    name: change.name,
                    value: change.value.to_string(),
                    scope_key: change.scope_key,
                    process_instance_key: template.process_instance_key,
                    process_definition_key: template.process_definition_key,
                },
            );
        }
    }

    /// Drops the instance and its variable scope.
    pub fn remove_instance(&mut self, key: i64) -> Option<ElementInstance> {
        self.state.variables.remove_scope(key);
        self.state.instances.remove(key)
    }

    /// Writes `ElementTerminated` for a terminating scope once nothing is
    /// left inside it.
    pub fn finish_scope_termination(&mut self, scope_key: i64) {
        let Some(scope) = self.state.instances.get(scope_key) else {
            return;
        };
        if scope.state == LifecycleState::Terminating && scope.active_tokens == 0 {
            let scope = scope.clone();
            self.write_lifecycle(&scope, ProcessInstanceIntent::ElementTerminated);
        }
    }

    /// Starts completing an activated scope with no tokens left.
    pub fn complete_scope_if_done(&mut self, scope_key: i64) {
        let Some(scope) = self.state.instances.get(scope_key) else {
            return;
        };
        if scope.state == LifecycleState::Activated && scope.active_tokens == 0 {
            let scope = scope.clone();
            self.write_lifecycle(&scope, ProcessInstanceIntent::ElementCompleting);
        }
    }
}

pub(super) fn element_of<'p>(
    process: &'p ExecutableProcess,
    record: &ProcessInstanceRecord,
) -> Result<&'p ExecutableElement, ProcessingError> {
    process
        .element_by_id(&record.element_id)
        .ok_or_else(|| ProcessingError::MissingElement {
            element_id: record.element_id.clone(),
            process_definition_key: record.process_definition_key,
        })
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use tracing::debug;

use super::events::open_events;
use super::join::activate_inclusive_joins;
use crate::bpmn::{ElementIndex, ElementKind, EventDefinition, ExecutableProcess, FlowIndex};
use crate::engine::{Context, ProcessingError, ProcessingOutcome};
use crate::expr::{apply_mappings, ProcessingFailure};
use crate::record::*;
use crate::state::{ElementInstance, LifecycleState};

pub(super) fn on_activating(
    ctx: &mut Context<'_>,
    process: &ExecutableProcess,
    element_index: ElementIndex,
    key: i64,
    record: ProcessInstanceRecord,
) -> ProcessingOutcome {
    let element = process.element(element_index);
    let flow_scope = (record.flow_scope_key != NO_KEY).then_some(record.flow_scope_key);

    match ctx.state.instances.get(key) {
        Some(existing) if existing.state == LifecycleState::Activating => {
            // re-driven after an incident was resolved
        }
        Some(existing) => {
            return Err(ProcessingError::IllegalTransition {
                key,
                from: existing.state,
                to: LifecycleState::Activating,
            });
        }
        None => {
            if let Some(scope_key) = flow_scope {
                let scope_state = ctx.state.instances.get(scope_key).map(|s| s.state);
                if scope_state != Some(LifecycleState::Activated) {
                    debug!(key, scope_key, "flow scope is not active, dropping activation");
                    ctx.state.instances.take_trigger(key);
                    ctx.state.instances.consume_tokens(scope_key, 1);
                    ctx.finish_scope_termination(scope_key);
                    return Ok(());
                }
            }
            ctx.state
                .instances
                .insert(ElementInstance::new(key, element_index, record.clone()));
            ctx.state.variables.create_scope(key, flow_scope);
            if let Some(scope_key) = flow_scope {
                activate_inclusive_joins(ctx, process, scope_key);
            }
        }
    }

    if !element.input_mappings.is_empty() {
        let source = ctx.state.variables.collect(key);
        match apply_mappings(&element.input_mappings, &source) {
            Ok(mapped) => {
                let changes = ctx.state.variables.set_local_document(key, &mapped);
                ctx.write_variable_changes(changes, &record);
            }
            Err(failure) => {
                let instance = instance_of(ctx, key)?;
                ctx.raise_incident(failure, &instance, ProcessInstanceIntent::ElementActivating);
                return Ok(());
            }
        }
    }

    ctx.result
        .append_event(key, ProcessInstanceIntent::ElementActivated, record);
    Ok(())
}

pub(super) fn on_activated(
    ctx: &mut Context<'_>,
    process: &ExecutableProcess,
    instance: ElementInstance,
) -> ProcessingOutcome {
    let element = process.element(instance.element);

    match &element.kind {
        ElementKind::Process | ElementKind::SubProcess => {
            if !open_events(ctx, process, &instance, boundary_events(process, instance.element))? {
                return Ok(());
            }
            // a timer start event leaves its trigger on the process instance
            let start = match ctx.state.instances.take_trigger(instance.key) {
                Some(trigger) => trigger.element,
                None => element.none_start.ok_or_else(|| {
                    ProcessingError::InconsistentState(format!("scope '{}' has no none start event", element.id))
                })?,
            };
            ctx.activate_element(instance.key, &instance.record, process.element(start));
        }

        ElementKind::StartEvent { .. }
        | ElementKind::EndEvent
        | ElementKind::ParallelGateway
        | ElementKind::BoundaryEvent { .. } => {
            ctx.write_lifecycle(&instance, ProcessInstanceIntent::ElementCompleting);
        }

        ElementKind::ServiceTask { job_type, retries } => {
            if !open_events(ctx, process, &instance, boundary_events(process, instance.element))? {
                return Ok(());
            }
            create_job(ctx, &instance, job_type, *retries);
        }

        ElementKind::ReceiveTask { message } => {
            let mut events = boundary_events(process, instance.element);
            events.push((instance.element, EventDefinition::Message(message.clone())));
            open_events(ctx, process, &instance, events)?;
        }

        ElementKind::IntermediateCatchEvent { event } => {
            if ctx.state.instances.trigger(instance.key).is_some() {
                // the event already happened at an event-based gateway
                ctx.write_lifecycle(&instance, ProcessInstanceIntent::ElementCompleting);
            } else {
                open_events(ctx, process, &instance, vec![(instance.element, event.clone())])?;
            }
        }

        ElementKind::EventBasedGateway => {
            let events = process
                .outgoing(instance.element)
                .filter_map(|flow| match &process.element(flow.target).kind {
                    ElementKind::IntermediateCatchEvent { event } => Some((flow.target, event.clone())),
                    _ => None,
                })
                .collect();
            open_events(ctx, process, &instance, events)?;
        }

        ElementKind::ExclusiveGateway { default_flow } => {
            choose_flows(ctx, process, &instance, *default_flow, false)?;
        }

        ElementKind::InclusiveGateway { default_flow } => {
            choose_flows(ctx, process, &instance, *default_flow, true)?;
        }
    }
    Ok(())
}

fn boundary_events(process: &ExecutableProcess, activity: ElementIndex) -> Vec<(ElementIndex, EventDefinition)> {
    process
        .element(activity)
        .boundary_events
        .iter()
        .filter_map(|index| match &process.element(*index).kind {
            ElementKind::BoundaryEvent { event, .. } => Some((*index, event.clone())),
            _ => None,
        })
        .collect()
}

fn create_job(ctx: &mut Context<'_>, instance: &ElementInstance, job_type: &str, retries: i32) {
    let job_key = ctx.next_key();
    let record = JobRecord {
        job_type: job_type.to_string(),
        retries,
        bpmn_process_id: instance.record.bpmn_process_id.clone(),
        process_definition_key: instance.record.process_definition_key,
        process_instance_key: instance.record.process_instance_key,
        element_id: instance.record.element_id.clone(),
        element_instance_key: instance.key,
        ..JobRecord::default()
    };
    ctx.state.jobs.create(job_key, record.clone());
    if let Some(task) = ctx.state.instances.get_mut(instance.key) {
        task.job_key = job_key;
    }
    ctx.result.append_event(job_key, JobIntent::Created, record);
}

/// Picks the first outgoing flow whose condition holds (`all`: every such
/// flow), else the default flow. Without either, exactly one
/// `ConditionError` incident is raised.
fn choose_flows(
    ctx: &mut Context<'_>,
    process: &ExecutableProcess,
    instance: &ElementInstance,
    default_flow: Option<FlowIndex>,
    all: bool,
) -> ProcessingOutcome {
    let element = process.element(instance.element);
    if element.outgoing.is_empty() {
        ctx.write_lifecycle(instance, ProcessInstanceIntent::ElementCompleting);
        return Ok(());
    }

    let variables = ctx.state.variables.collect(instance.key);
    let mut chosen = Vec::new();
    for flow in process.outgoing(instance.element) {
        if Some(flow.index) == default_flow {
            continue;
        }
        let taken = match &flow.condition {
            None => true,
            Some(condition) => match condition.evaluate(&variables) {
                Ok(taken) => taken,
                Err(failure) => {
                    ctx.raise_incident(failure, instance, ProcessInstanceIntent::ElementActivated);
                    return Ok(());
                }
            },
        };
        if taken {
            chosen.push(flow.index);
            if !all {
                break;
            }
        }
    }

    if chosen.is_empty() {
        chosen.extend(default_flow);
    }
    if chosen.is_empty() {
        let failure = ProcessingFailure::new(
            ErrorType::ConditionError,
            "Expected at least one condition to evaluate to true, or to have a default flow",
        );
        ctx.raise_incident(failure, instance, ProcessInstanceIntent::ElementActivated);
        return Ok(());
    }
    if let Some(gateway) = ctx.state.instances.get_mut(instance.key) {
        gateway.taken_flows = chosen;
    }
    ctx.write_lifecycle(instance, ProcessInstanceIntent::ElementCompleting);
    Ok(())
}

fn instance_of(ctx: &Context<'_>, key: i64) -> Result<ElementInstance, ProcessingError> {
    ctx.state
        .instances
        .get(key)
        .cloned()
        .ok_or_else(|| ProcessingError::InconsistentState(format!("element instance {key} vanished")))
}

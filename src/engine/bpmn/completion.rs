// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::events::close_events;
use super::join::activate_inclusive_joins;
use crate::bpmn::{ElementKind, ExecutableFlow, ExecutableProcess};
use crate::engine::{Context, ProcessingOutcome};
use crate::expr::apply_mappings;
use crate::record::*;
use crate::state::ElementInstance;

pub(super) fn on_completing(
    ctx: &mut Context<'_>,
    process: &ExecutableProcess,
    instance: ElementInstance,
) -> ProcessingOutcome {
    let element = process.element(instance.element);
    close_events(ctx, instance.key);

    // the trigger belongs to the catch event the gateway hands it to
    if matches!(element.kind, ElementKind::EventBasedGateway) {
        ctx.write_lifecycle(&instance, ProcessInstanceIntent::ElementCompleted);
        return Ok(());
    }

    let trigger_variables = ctx
        .state
        .instances
        .trigger(instance.key)
        .map(|t| t.variables.clone())
        .unwrap_or_default();

    let output = if element.output_mappings.is_empty() {
        trigger_variables
    } else {
        let mut source = ctx.state.variables.collect(instance.key);
        source.merge(&trigger_variables);
        match apply_mappings(&element.output_mappings, &source) {
            Ok(mapped) => mapped,
            Err(failure) => {
                ctx.raise_incident(failure, &instance, ProcessInstanceIntent::ElementCompleting);
                return Ok(());
            }
        }
    };

    if !output.is_empty() {
        let scope = instance.flow_scope_key().unwrap_or(instance.key);
        let changes = ctx.state.variables.propagate(scope, &output);
        ctx.write_variable_changes(changes, &instance.record);
    }

    ctx.state.instances.take_trigger(instance.key);
    ctx.write_lifecycle(&instance, ProcessInstanceIntent::ElementCompleted);
    Ok(())
}

pub(super) fn on_completed(
    ctx: &mut Context<'_>,
    process: &ExecutableProcess,
    instance: ElementInstance,
) -> ProcessingOutcome {
    let Some(scope_key) = instance.flow_scope_key() else {
        ctx.remove_instance(instance.key);
        return Ok(());
    };
    let element = process.element(instance.element);

    let flows: Vec<&ExecutableFlow> = match element.kind {
        ElementKind::ExclusiveGateway { .. }
        | ElementKind::InclusiveGateway { .. }
        | ElementKind::EventBasedGateway => instance.taken_flows.iter().map(|f| process.flow(*f)).collect(),
        _ => process.outgoing(instance.element).collect(),
    };
    let handed_over = match element.kind {
        ElementKind::EventBasedGateway => ctx.state.instances.take_trigger(instance.key),
        _ => None,
    };

    for flow in flows {
        take_flow(ctx, process, &instance, scope_key, flow);
        let target = process.element(flow.target);

        if target.is_joining() {
            // the token waits on the join until every incoming flow has one
            ctx.state.instances.spawn_tokens(scope_key, 1);
            if matches!(target.kind, ElementKind::InclusiveGateway { .. }) {
                // checked once this element is gone
                ctx.state
                    .instances
                    .wait_at_join(scope_key, target.index, flow.index);
                continue;
            }
            let joined = ctx
                .state
                .instances
                .arrive_at_join(scope_key, target.index, flow.index, &target.incoming);
            if joined {
                ctx.state
                    .instances
                    .consume_tokens(scope_key, target.incoming.len() as u32);
                ctx.activate_element(scope_key, &instance.record, target);
            }
            continue;
        }

        let key = ctx.activate_element(scope_key, &instance.record, target);
        if let Some(trigger) = &handed_over {
            if trigger.element == target.index {
                ctx.state.instances.set_trigger(key, trigger.clone());
            }
        }
    }

    ctx.remove_instance(instance.key);
    ctx.state.instances.consume_tokens(scope_key, 1);
    activate_inclusive_joins(ctx, process, scope_key);
    ctx.complete_scope_if_done(scope_key);
    ctx.finish_scope_termination(scope_key);
    Ok(())
}

fn take_flow(
    ctx: &mut Context<'_>,
    process: &ExecutableProcess,
    source: &ElementInstance,
    scope_key: i64,
    flow: &ExecutableFlow,
) {
    let key = ctx.next_key();
    let record = ProcessInstanceRecord {
        element_id: flow.id.clone(),
        flow_scope_key: scope_key,
        bpmn_element_type: BpmnElementType::SequenceFlow,
        ..source.record.clone()
    };
    ctx.result
        .append_event(key, ProcessInstanceIntent::SequenceFlowTaken, record);
    tracing::trace!(
        flow = %flow.id,
        target = %process.element(flow.target).id,
        "sequence flow taken"
    );
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::events::close_events;
use super::join::activate_inclusive_joins;
use crate::bpmn::ExecutableProcess;
use crate::engine::{Context, ProcessingOutcome};
use crate::record::*;
use crate::state::{ElementInstance, LifecycleState};

pub(super) fn on_terminating(
    ctx: &mut Context<'_>,
    process: &ExecutableProcess,
    instance: ElementInstance,
) -> ProcessingOutcome {
    close_events(ctx, instance.key);
    cancel_job(ctx, &instance);
    resolve_incidents(ctx, instance.key);

    if !process.element(instance.element).kind.is_scope() {
        ctx.write_lifecycle(&instance, ProcessInstanceIntent::ElementTerminated);
        return Ok(());
    }

    for child_key in ctx.state.instances.children(instance.key) {
        let Some(child) = ctx.state.instances.get(child_key).cloned() else {
            continue;
        };
        if child.state != LifecycleState::Terminating {
            ctx.write_lifecycle(&child, ProcessInstanceIntent::ElementTerminating);
        }
    }

    let waiting = ctx.state.instances.clear_joins(instance.key);
    if waiting > 0 {
        ctx.state.instances.consume_tokens(instance.key, waiting);
    }
    ctx.finish_scope_termination(instance.key);
    Ok(())
}

pub(super) fn on_terminated(
    ctx: &mut Context<'_>,
    process: &ExecutableProcess,
    instance: ElementInstance,
) -> ProcessingOutcome {
    let Some(scope_key) = instance.flow_scope_key() else {
        ctx.remove_instance(instance.key);
        return Ok(());
    };

    // an interrupting boundary event takes over the activity's token
    if let Some(boundary) = instance.interrupting_event {
        let trigger = ctx.state.instances.take_trigger(instance.key);
        let key = ctx.activate_element(scope_key, &instance.record, process.element(boundary));
        if let Some(trigger) = trigger {
            ctx.state.instances.set_trigger(key, trigger);
        }
    }

    ctx.remove_instance(instance.key);
    ctx.state.instances.consume_tokens(scope_key, 1);
    ctx.finish_scope_termination(scope_key);
    activate_inclusive_joins(ctx, process, scope_key);
    ctx.complete_scope_if_done(scope_key);
    Ok(())
}

fn cancel_job(ctx: &mut Context<'_>, instance: &ElementInstance) {
    if instance.job_key == NO_KEY {
        return;
    }
    if let Some(incident) = ctx.state.incidents.of_job(instance.job_key) {
        resolve_incident(ctx, incident);
    }
    if let Some(job) = ctx.state.jobs.remove(instance.job_key) {
        ctx.result
            .append_event(instance.job_key, JobIntent::Canceled, job.record);
    }
}

fn resolve_incidents(ctx: &mut Context<'_>, element_instance_key: i64) {
    for key in ctx.state.incidents.of_element(element_instance_key) {
        resolve_incident(ctx, key);
    }
}

fn resolve_incident(ctx: &mut Context<'_>, key: i64) {
    if let Some(incident) = ctx.state.incidents.remove(key) {
        ctx.result
            .append_event(key, IncidentIntent::Resolved, incident.record);
    }
}

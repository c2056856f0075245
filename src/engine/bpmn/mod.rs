// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The element lifecycle.
//!
//! Every element kind walks the same states:
//!
//! ```text
//! ACTIVATING -> ACTIVATED -> COMPLETING -> COMPLETED
//!      |            |            |
//!      +------------+------------+--> TERMINATING -> TERMINATED
//! ```
//!
//! Each lifecycle event is processed by one step (`on_activating`,
//! `on_activated`, ...); what a step does depends on the element kind.
//! Termination wins: an event that arrives for an instance that is already
//! terminating, or already gone, is stale and skipped.

mod activation;
mod behavior;
mod completion;
mod events;
mod join;
mod termination;

use tracing::debug;

use super::{Context, ProcessingError, ProcessingOutcome};
use crate::record::{ProcessInstanceIntent, ProcessInstanceRecord, RecordValue};
use crate::state::{ElementInstance, LifecycleState};

pub(crate) use events::{close_events, correlate, trigger_event};

pub(super) fn process_event(ctx: &mut Context<'_>, intent: ProcessInstanceIntent) -> ProcessingOutcome {
    let RecordValue::ProcessInstance(value) = &ctx.record.value else {
        return Err(ProcessingError::InconsistentState(format!(
            "process instance event at {} carries {:?}",
            ctx.record.position,
            ctx.record.value_type()
        )));
    };
    let value: ProcessInstanceRecord = value.clone();
    let key = ctx.record.key;
    let process = ctx.executable(value.process_definition_key)?;
    let element = behavior::element_of(&process, &value)?.index;

    match intent {
        ProcessInstanceIntent::ElementActivating => activation::on_activating(ctx, &process, element, key, value),
        ProcessInstanceIntent::ElementActivated => match enter(ctx, key, LifecycleState::Activated)? {
            Some(instance) => activation::on_activated(ctx, &process, instance),
            None => Ok(()),
        },
        ProcessInstanceIntent::ElementCompleting => match enter(ctx, key, LifecycleState::Completing)? {
            Some(instance) => completion::on_completing(ctx, &process, instance),
            None => Ok(()),
        },
        ProcessInstanceIntent::ElementCompleted => match enter(ctx, key, LifecycleState::Completed)? {
            Some(instance) => completion::on_completed(ctx, &process, instance),
            None => Ok(()),
        },
        ProcessInstanceIntent::ElementTerminating => match enter(ctx, key, LifecycleState::Terminating)? {
            Some(instance) => termination::on_terminating(ctx, &process, instance),
            None => Ok(()),
        },
        ProcessInstanceIntent::ElementTerminated => match enter(ctx, key, LifecycleState::Terminated)? {
            Some(instance) => termination::on_terminated(ctx, &process, instance),
            None => Ok(()),
        },
        ProcessInstanceIntent::EventOccurred => events::on_event_occurred(ctx, &process, key),
        ProcessInstanceIntent::SequenceFlowTaken | ProcessInstanceIntent::Cancel => Ok(()),
    }
}

/// Moves the instance to `next`. `None` means the event is stale.
fn enter(
    ctx: &mut Context<'_>,
    key: i64,
    next: LifecycleState,
) -> Result<Option<ElementInstance>, ProcessingError> {
    let Some(instance) = ctx.state.instances.get(key) else {
        debug!(key, ?next, "skipping lifecycle event of a removed element instance");
        return Ok(None);
    };
    let current = instance.state;

    if current == LifecycleState::Terminating && next != LifecycleState::Terminated {
        debug!(key, ?next, "skipping lifecycle event of a terminating element instance");
        return Ok(None);
    }
    if !current.can_transition_to(next) {
        return Err(ProcessingError::IllegalTransition {
            key,
            from: current,
            to: next,
        });
    }

    ctx.state.instances.set_state(key, next);
    Ok(ctx.state.instances.get(key).cloned())
}

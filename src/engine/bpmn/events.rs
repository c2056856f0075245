// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Timers, message subscriptions and the events they fire.
//!
//! An element instance that waits for events owns timers and subscriptions.
//! When one fires, the trigger is stored and `EventOccurred` is written on
//! the owner; the owner's kind decides what happens next. Firing closes the
//! owner's other events, except for non-interrupting boundary events, which
//! activate alongside the running activity.

use serde_json::Value;

use super::behavior::element_of;
use crate::bpmn::{ElementIndex, ElementKind, EventDefinition, ExecutableProcess};
use crate::engine::{Context, ProcessingError, ProcessingOutcome};
use crate::expr::condition::type_name;
use crate::expr::{Document, JsonPath, ProcessingFailure};
use crate::record::*;
use crate::state::{ElementInstance, EventTrigger, LifecycleState};

enum Pending {
    Timer { target: ElementIndex, due_date: i64 },
    Message { target: ElementIndex, name: String, correlation_key: String },
}

fn extract_correlation_key(path: &JsonPath, variables: &Document) -> Result<String, ProcessingFailure> {
    let failure = |detail: String| {
        ProcessingFailure::new(
            ErrorType::ExtractValueError,
            format!("Failed to extract the correlation key for '{path}': {detail}"),
        )
    };
    match path.get(variables) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(failure(format!(
            "The value must be either a string or a number, but was {}",
            type_name(other)
        ))),
        None => Err(failure("no value found".to_string())),
    }
}

/// Opens timers and subscriptions owned by `owner`. Anything the owner had
/// open before is closed first. Returns false when an incident was raised
/// instead; nothing is opened in that case.
pub(super) fn open_events(
    ctx: &mut Context<'_>,
    process: &ExecutableProcess,
    owner: &ElementInstance,
    events: Vec<(ElementIndex, EventDefinition)>,
) -> Result<bool, ProcessingError> {
    close_events(ctx, owner.key);
    if events.is_empty() {
        return Ok(true);
    }

    let variables = ctx.state.variables.collect(owner.key);
    let mut pending = Vec::with_capacity(events.len());
    for (target, event) in events {
        match event {
            EventDefinition::Timer { duration_ms } => pending.push(Pending::Timer {
                target,
                due_date: ctx.now().saturating_add(duration_ms),
            }),
            EventDefinition::Message(message) => {
                match extract_correlation_key(&message.correlation_key, &variables) {
                    Ok(correlation_key) => pending.push(Pending::Message {
                        target,
                        name: message.name,
                        correlation_key,
                    }),
                    Err(failure) => {
                        ctx.raise_incident(failure, owner, ProcessInstanceIntent::ElementActivated);
                        return Ok(false);
                    }
                }
            }
        }
    }

    let mut subscriptions = Vec::new();
    for event in pending {
        match event {
            Pending::Timer { target, due_date } => {
                let key = ctx.next_key();
                let timer = TimerRecord {
                    element_instance_key: owner.key,
                    process_instance_key: owner.record.process_instance_key,
                    process_definition_key: owner.record.process_definition_key,
                    target_element_id: process.element(target).id.clone(),
                    due_date,
                };
                ctx.state.timers.create(key, timer.clone());
                ctx.result.append_event(key, TimerIntent::Created, timer);
            }
            Pending::Message {
                target,
                name,
                correlation_key,
            } => {
                let key = ctx.next_key();
                let subscription = MessageSubscriptionRecord {
                    process_instance_key: owner.record.process_instance_key,
                    element_instance_key: owner.key,
                    bpmn_process_id: owner.record.bpmn_process_id.clone(),
                    message_name: name,
                    correlation_key,
                    target_element_id: process.element(target).id.clone(),
                    message_key: NO_KEY,
                    variables: Document::new(),
                };
                ctx.state.messages.open_subscription(key, subscription.clone());
                ctx.result
                    .append_event(key, MessageSubscriptionIntent::Opened, subscription);
                subscriptions.push(key);
            }
        }
    }

    // buffered messages may fire right away
    for key in subscriptions {
        correlate_buffered(ctx, key)?;
    }
    Ok(true)
}

/// Closes every timer and subscription owned by `owner_key`.
pub(crate) fn close_events(ctx: &mut Context<'_>, owner_key: i64) {
    for key in ctx.state.timers.of_element(owner_key) {
        if let Some(timer) = ctx.state.timers.remove(key) {
            ctx.result.append_event(key, TimerIntent::Canceled, timer);
        }
    }
    for key in ctx.state.messages.subscriptions_of_element(owner_key) {
        if let Some(subscription) = ctx.state.messages.close_subscription(key) {
            ctx.result
                .append_event(key, MessageSubscriptionIntent::Closed, subscription);
        }
    }
}

/// Fires `target` for the owner. Returns false when the owner can no longer
/// react to events.
pub(crate) fn trigger_event(
    ctx: &mut Context<'_>,
    process: &ExecutableProcess,
    owner_key: i64,
    target: ElementIndex,
    variables: Document,
) -> Result<bool, ProcessingError> {
    let Some(owner) = ctx.state.instances.get(owner_key).cloned() else {
        return Ok(false);
    };
    if owner.state != LifecycleState::Activated {
        return Ok(false);
    }

    let target_element = process.element(target);
    if let ElementKind::BoundaryEvent {
        cancel_activity: false,
        ..
    } = target_element.kind
    {
        let scope_key = owner.record.flow_scope_key;
        let key = ctx.activate_element(scope_key, &owner.record, target_element);
        ctx.state.instances.set_trigger(
            key,
            EventTrigger {
                element: target,
                variables,
            },
        );
        return Ok(true);
    }

    close_events(ctx, owner_key);
    ctx.state.instances.set_trigger(
        owner_key,
        EventTrigger {
            element: target,
            variables,
        },
    );
    ctx.write_lifecycle(&owner, ProcessInstanceIntent::EventOccurred);
    Ok(true)
}

/// Correlates a message to an open subscription.
pub(crate) fn correlate(
    ctx: &mut Context<'_>,
    subscription_key: i64,
    message_key: i64,
    variables: &Document,
) -> Result<bool, ProcessingError> {
    let Some(subscription) = ctx.state.messages.subscription(subscription_key).cloned() else {
        return Ok(false);
    };
    if ctx
        .state
        .messages
        .is_correlated(message_key, subscription.process_instance_key)
    {
        return Ok(false);
    }
    let Some(owner) = ctx.state.instances.get(subscription.element_instance_key).cloned() else {
        return Ok(false);
    };
    if owner.state != LifecycleState::Activated {
        return Ok(false);
    }
    let process = ctx.executable(owner.record.process_definition_key)?;
    let target = process
        .lookup(&subscription.target_element_id)
        .ok_or_else(|| ProcessingError::MissingElement {
            element_id: subscription.target_element_id.clone(),
            process_definition_key: owner.record.process_definition_key,
        })?;

    ctx.state
        .messages
        .mark_correlated(message_key, subscription.process_instance_key);
    let mut correlated = subscription;
    correlated.message_key = message_key;
    correlated.variables = variables.clone();
    ctx.result
        .append_event(subscription_key, MessageSubscriptionIntent::Correlated, correlated);

    trigger_event(ctx, &process, owner.key, target, variables.clone())
}

fn correlate_buffered(ctx: &mut Context<'_>, subscription_key: i64) -> ProcessingOutcome {
    let Some(subscription) = ctx.state.messages.subscription(subscription_key).cloned() else {
        return Ok(());
    };
    let candidates = ctx.state.messages.buffered(
        &subscription.message_name,
        &subscription.correlation_key,
        ctx.now(),
    );
    for message_key in candidates {
        let Some(message) = ctx.state.messages.message(message_key).cloned() else {
            continue;
        };
        if correlate(ctx, subscription_key, message_key, &message.variables)? {
            break;
        }
    }
    Ok(())
}

pub(super) fn on_event_occurred(
    ctx: &mut Context<'_>,
    process: &ExecutableProcess,
    key: i64,
) -> ProcessingOutcome {
    let Some(instance) = ctx.state.instances.get(key).cloned() else {
        return Ok(());
    };
    if instance.state != LifecycleState::Activated {
        return Ok(());
    }
    let Some(trigger) = ctx.state.instances.trigger(key).cloned() else {
        return Ok(());
    };
    let element = element_of(process, &instance.record)?;

    if trigger.element == instance.element {
        ctx.write_lifecycle(&instance, ProcessInstanceIntent::ElementCompleting);
        return Ok(());
    }

    match process.element(trigger.element).kind {
        ElementKind::BoundaryEvent { .. } => {
            if let Some(activity) = ctx.state.instances.get_mut(key) {
                activity.interrupting_event = Some(trigger.element);
            }
            ctx.write_lifecycle(&instance, ProcessInstanceIntent::ElementTerminating);
        }
        ElementKind::IntermediateCatchEvent { .. }
            if matches!(element.kind, ElementKind::EventBasedGateway) =>
        {
            let flow = process
                .outgoing(instance.element)
                .find(|f| f.target == trigger.element)
                .map(|f| f.index);
            if let Some(gateway) = ctx.state.instances.get_mut(key) {
                gateway.taken_flows = flow.into_iter().collect();
            }
            ctx.write_lifecycle(&instance, ProcessInstanceIntent::ElementCompleting);
        }
        _ => {
            return Err(ProcessingError::InconsistentState(format!(
                "element '{}' cannot react to an event of '{}'",
                element.id,
                process.element(trigger.element).id
            )));
        }
    }
    Ok(())
}

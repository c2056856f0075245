// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! `Message Publish`.
//!
//! A message correlates to every open subscription with its name and
//! correlation key, at most once per process instance. With a time to live
//! it is also buffered for subscriptions opened before it expires. Expired
//! messages are dropped the next time a message is published.
//!
//! A message whose name matches a message start event also creates a new
//! instance of that process, whatever its correlation key.

use super::bpmn::correlate;
use super::instance::create_process_instance;
use super::{Context, ProcessingError, ProcessingOutcome};
use crate::expr::Document;
use crate::record::*;
use crate::state::EventTrigger;

pub(super) fn publish(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let RecordValue::Message(command) = &ctx.record.value else {
        return Err(ProcessingError::invalid_argument("Expected a message record"));
    };
    if command.name.is_empty() {
        return Err(ProcessingError::invalid_argument(
            "Expected to publish a message with a name, but none given",
        ));
    }
    if command.time_to_live < 0 {
        return Err(ProcessingError::invalid_argument(format!(
            "Expected a time to live of zero or more, but it was {}",
            command.time_to_live
        )));
    }

    let now = ctx.now();
    for expired in ctx.state.messages.expired(now) {
        ctx.state.messages.remove_message(expired);
    }

    if ctx
        .state
        .messages
        .has_message_id(&command.name, &command.correlation_key, &command.message_id, now)
    {
        return Err(ProcessingError::rejection(
            RejectionType::AlreadyExists,
            format!(
                "Expected to publish a new message with id '{}', but a message with that id was already published",
                command.message_id
            ),
        ));
    }

    let key = ctx.next_key();
    let mut message = command.clone();
    message.deadline = now.saturating_add(message.time_to_live);
    ctx.result
        .append_event(key, MessageIntent::Published, message.clone());
    ctx.result.respond_with_last();

    if message.time_to_live > 0 {
        ctx.state.messages.buffer(key, message.clone());
    }
    for subscription in ctx
        .state
        .messages
        .subscriptions_for(&message.name, &message.correlation_key)
    {
        correlate(ctx, subscription, key, &message.variables)?;
    }
    for (subscription_key, subscription) in ctx.state.messages.start_subscriptions_for(&message.name) {
        start_instance(ctx, subscription_key, subscription, key, &message)?;
    }
    if message.time_to_live == 0 {
        ctx.state.messages.forget_correlations(key);
    }
    Ok(())
}

fn start_instance(
    ctx: &mut Context<'_>,
    subscription_key: i64,
    subscription: MessageSubscriptionRecord,
    message_key: i64,
    message: &MessageRecord,
) -> ProcessingOutcome {
    let deployed = ctx
        .state
        .processes
        .latest_by_id(&subscription.bpmn_process_id)
        .cloned()
        .ok_or_else(|| {
            ProcessingError::InconsistentState(format!(
                "message start subscription {subscription_key} belongs to undeployed process '{}'",
                subscription.bpmn_process_id
            ))
        })?;
    let process = ctx.executable(deployed.key)?;
    let start = process
        .lookup(&subscription.target_element_id)
        .ok_or_else(|| ProcessingError::MissingElement {
            element_id: subscription.target_element_id.clone(),
            process_definition_key: deployed.key,
        })?;

    let trigger = EventTrigger {
        element: start,
        variables: Document::new(),
    };
    let instance_key = create_process_instance(ctx, &deployed, &message.variables, Some(trigger), false);
    // a buffered copy must not correlate into the instance it started
    ctx.state.messages.mark_correlated(message_key, instance_key);

    let mut correlated = subscription;
    correlated.process_instance_key = instance_key;
    correlated.message_key = message_key;
    correlated.variables = message.variables.clone();
    ctx.result
        .append_event(subscription_key, MessageSubscriptionIntent::Correlated, correlated);
    tracing::debug!(
        instance_key,
        bpmn_process_id = %deployed.bpmn_process_id,
        message = %message.name,
        "process instance started by message"
    );
    Ok(())
}

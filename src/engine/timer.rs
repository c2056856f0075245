// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::bpmn::trigger_event;
use super::instance::create_process_instance;
use super::{Context, ProcessingError, ProcessingOutcome};
use crate::expr::Document;
use crate::record::*;
use crate::state::EventTrigger;

pub(super) fn trigger(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let key = ctx.record.key;
    let timer = ctx.state.timers.remove(key).ok_or_else(|| {
        ProcessingError::not_found(format!(
            "Expected to trigger timer with key '{key}', but no such timer was found"
        ))
    })?;
    ctx.result
        .append_event(key, TimerIntent::Triggered, timer.clone());
    ctx.result.respond_with_last();

    let process = ctx.executable(timer.process_definition_key)?;
    let target = process
        .lookup(&timer.target_element_id)
        .ok_or_else(|| ProcessingError::MissingElement {
            element_id: timer.target_element_id.clone(),
            process_definition_key: timer.process_definition_key,
        })?;

    if timer.element_instance_key == NO_KEY {
        let deployed = ctx
            .state
            .processes
            .get(timer.process_definition_key)
            .cloned()
            .ok_or(ProcessingError::MissingProcess(timer.process_definition_key))?;
        let trigger = EventTrigger {
            element: target,
            variables: Document::new(),
        };
        create_process_instance(ctx, &deployed, &Document::new(), Some(trigger), false);
        return Ok(());
    }

    trigger_event(ctx, &process, timer.element_instance_key, target, Document::new())?;
    Ok(())
}

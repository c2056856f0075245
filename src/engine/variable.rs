// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::{Context, ProcessingError, ProcessingOutcome};
use crate::record::*;

/// `VariableDocument Update`: sets variables on an element instance's scope,
/// locally or propagated to the scope that already defines each name.
pub(super) fn update(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let RecordValue::VariableDocument(command) = &ctx.record.value else {
        return Err(ProcessingError::invalid_argument("Expected a variable document record"));
    };
    let scope_key = command.scope_key;
    let instance = ctx
        .state
        .instances
        .get(scope_key)
        .cloned()
        .filter(|_| ctx.state.variables.has_scope(scope_key))
        .ok_or_else(|| {
            ProcessingError::not_found(format!(
                "Expected to update variables for element with key '{scope_key}', but no such element was found"
            ))
        })?;

    let key = ctx.next_key();
    ctx.result
        .append_event(key, VariableDocumentIntent::Updated, command.clone());
    ctx.result.respond_with_last();

    let changes = match command.update_semantics {
        UpdateSemantics::Local => ctx
            .state
            .variables
            .set_local_document(scope_key, &command.variables),
        UpdateSemantics::Propagate => ctx.state.variables.propagate(scope_key, &command.variables),
    };
    ctx.write_variable_changes(changes, &instance.record);
    Ok(())
}

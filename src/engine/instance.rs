// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::{Context, ProcessingError, ProcessingOutcome};
use crate::expr::Document;
use crate::record::*;
use crate::state::{DeployedProcess, EventTrigger, LifecycleState};

pub(super) fn create(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let RecordValue::ProcessInstanceCreation(command) = &ctx.record.value else {
        return Err(ProcessingError::invalid_argument("Expected a process instance creation record"));
    };

    let deployed = if command.process_definition_key != NO_KEY {
        ctx.state.processes.get(command.process_definition_key).cloned().ok_or_else(|| {
            ProcessingError::not_found(format!(
                "Expected to find process definition with key '{}', but none found",
                command.process_definition_key
            ))
        })?
    } else if command.bpmn_process_id.is_empty() {
        return Err(ProcessingError::invalid_argument(
            "Expected either a process id or a process definition key, but none given",
        ));
    } else {
        let found = if command.version < 0 {
            ctx.state.processes.latest_by_id(&command.bpmn_process_id)
        } else {
            ctx.state
                .processes
                .by_id_and_version(&command.bpmn_process_id, command.version)
        };
        found.cloned().ok_or_else(|| {
            ProcessingError::not_found(format!(
                "Expected to find process definition with process id '{}', but none found",
                command.bpmn_process_id
            ))
        })?
    };

    let process = ctx.executable(deployed.key)?;
    if process.process().none_start.is_none() {
        return Err(ProcessingError::invalid_state(format!(
            "Expected to create instance of process '{}' with a none start event, but there is no such event",
            deployed.bpmn_process_id
        )));
    }

    let key = create_process_instance(ctx, &deployed, &command.variables, None, true);
    tracing::debug!(key, bpmn_process_id = %deployed.bpmn_process_id, "process instance created");
    Ok(())
}

/// Creates a process instance with its variables and writes the activation
/// of the process element. A timer or message start event passes its
/// trigger.
pub(super) fn create_process_instance(
    ctx: &mut Context<'_>,
    deployed: &DeployedProcess,
    variables: &Document,
    trigger: Option<EventTrigger>,
    respond: bool,
) -> i64 {
    let key = ctx.next_key();
    let record = ProcessInstanceRecord {
        bpmn_process_id: deployed.bpmn_process_id.clone(),
        version: deployed.version,
        process_definition_key: deployed.key,
        process_instance_key: key,
        element_id: deployed.bpmn_process_id.clone(),
        flow_scope_key: NO_KEY,
        bpmn_element_type: BpmnElementType::Process,
    };

    ctx.result.append_event(
        key,
        ProcessInstanceCreationIntent::Created,
        ProcessInstanceCreationRecord {
            bpmn_process_id: deployed.bpmn_process_id.clone(),
            version: deployed.version,
            process_definition_key: deployed.key,
            process_instance_key: key,
            variables: variables.clone(),
        },
    );
    if respond {
        ctx.result.respond_with_last();
    }

    ctx.state.variables.create_scope(key, None);
    let changes = ctx.state.variables.set_local_document(key, variables);
    ctx.write_variable_changes(changes, &record);

    if let Some(trigger) = trigger {
        ctx.state.instances.set_trigger(key, trigger);
    }
    ctx.result
        .append_event(key, ProcessInstanceIntent::ElementActivating, record);
    key
}

pub(super) fn cancel(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let key = ctx.record.key;
    let not_found = || {
        ProcessingError::not_found(format!(
            "Expected to cancel a process instance with key '{key}', but no such process instance was found"
        ))
    };
    let instance = ctx.state.instances.get(key).cloned().ok_or_else(not_found)?;
    if instance.flow_scope_key().is_some() {
        return Err(not_found());
    }
    if instance.state == LifecycleState::Terminating {
        return Err(ProcessingError::invalid_state(format!(
            "Expected to cancel a process instance with key '{key}', but it is already being terminated"
        )));
    }

    ctx.write_lifecycle(&instance, ProcessInstanceIntent::ElementTerminating);
    ctx.result.respond_with_last();
    Ok(())
}

// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::bpmn::process_event;
use super::{Context, ProcessingError, ProcessingOutcome, ProcessingResult};
use crate::record::*;
use crate::state::FailedEvent;

/// Resolves an incident. An element incident runs the lifecycle step that
/// failed again, within this command. If the step fails again the command
/// is rejected and the incident stays open.
pub(super) fn resolve(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let key = ctx.record.key;
    let incident = ctx.state.incidents.get(key).cloned().ok_or_else(|| {
        ProcessingError::not_found(format!(
            "Expected to resolve incident with key '{key}', but no such incident was found"
        ))
    })?;

    let job_key = incident.record.job_key;
    if job_key != NO_KEY {
        let retries = ctx.state.jobs.get(job_key).map_or(0, |j| j.record.retries);
        if retries <= 0 {
            return Err(ProcessingError::invalid_state(format!(
                "Expected to resolve incident with key '{key}', but job '{job_key}' has no retries left; update the job's retries first"
            )));
        }
    }

    ctx.state.incidents.remove(key);
    ctx.result
        .append_event(key, IncidentIntent::Resolved, incident.record);
    ctx.result.respond_with_last();

    if let Some(failed) = incident.failed_event {
        let follow_ups = rerun(ctx, &failed)?;
        if let Some(message) = raised_incident(&follow_ups) {
            return Err(ProcessingError::invalid_state(format!(
                "Expected to resolve incident with key '{key}', but element '{}' still fails: {message}",
                failed.value.element_id
            )));
        }
        ctx.result
            .append_informational(failed.key, failed.intent, failed.value);
        ctx.result.extend(follow_ups);
    }
    Ok(())
}

/// Processes the failed lifecycle event as if it had just been read.
fn rerun(ctx: &mut Context<'_>, failed: &FailedEvent) -> Result<ProcessingResult, ProcessingError> {
    let record = TypedRecord {
        position: ctx.record.position,
        source_position: ctx.record.source_position,
        key: failed.key,
        timestamp: ctx.record.timestamp,
        metadata: RecordMetadata::event(failed.intent),
        value: RecordValue::ProcessInstance(failed.value.clone()),
    };
    let mut result = ProcessingResult::new();
    let mut rerun = Context {
        state: &mut *ctx.state,
        record: &record,
        result: &mut result,
    };
    process_event(&mut rerun, failed.intent)?;
    Ok(result)
}

fn raised_incident(result: &ProcessingResult) -> Option<&str> {
    result.records().iter().find_map(|r| match (&r.value, r.intent()) {
        (RecordValue::Incident(incident), Intent::Incident(IncidentIntent::Created)) => {
            Some(incident.error_message.as_str())
        }
        _ => None,
    })
}

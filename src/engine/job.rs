// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Job commands. Jobs are owned by service task instances; completing one
//! fires the task's own event.

use super::bpmn::trigger_event;
use super::{Context, ProcessingError, ProcessingOutcome};
use crate::record::*;
use crate::state::{Incident, Job, JobStatus};

fn job_command(ctx: &Context<'_>) -> Result<JobRecord, ProcessingError> {
    match &ctx.record.value {
        RecordValue::Job(job) => Ok(job.clone()),
        _ => Err(ProcessingError::invalid_argument("Expected a job record")),
    }
}

fn existing_job(ctx: &Context<'_>, action: &str) -> Result<Job, ProcessingError> {
    let key = ctx.record.key;
    ctx.state.jobs.get(key).cloned().ok_or_else(|| {
        ProcessingError::not_found(format!(
            "Expected to {action} job with key '{key}', but no such job was found"
        ))
    })
}

pub(super) fn complete(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let command = job_command(ctx)?;
    let job = existing_job(ctx, "complete")?;
    let key = job.key;
    if job.status == JobStatus::Failed {
        return Err(ProcessingError::invalid_state(format!(
            "Expected to complete job with key '{key}', but it has no retries left"
        )));
    }

    ctx.state.jobs.remove(key);
    let mut completed = job.record;
    completed.variables = command.variables;
    ctx.result
        .append_event(key, JobIntent::Completed, completed.clone());
    ctx.result.respond_with_last();

    let owner_key = completed.element_instance_key;
    let Some(owner) = ctx.state.instances.get_mut(owner_key) else {
        return Ok(());
    };
    owner.job_key = NO_KEY;
    let (element, definition_key) = (owner.element, owner.record.process_definition_key);
    let process = ctx.executable(definition_key)?;
    trigger_event(ctx, &process, owner_key, element, completed.variables)?;
    Ok(())
}

pub(super) fn fail(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let command = job_command(ctx)?;
    let job = existing_job(ctx, "fail")?;
    let key = job.key;
    if job.status == JobStatus::Failed {
        return Err(ProcessingError::invalid_state(format!(
            "Expected to fail job with key '{key}', but it has no retries left"
        )));
    }

    let failed = ctx
        .state
        .jobs
        .fail(key, command.retries, &command.error_message)
        .map(|j| j.record.clone())
        .ok_or_else(|| ProcessingError::InconsistentState(format!("job {key} vanished")))?;
    ctx.result.append_event(key, JobIntent::Failed, failed.clone());
    ctx.result.respond_with_last();

    if failed.retries <= 0 {
        raise_job_incident(ctx, key, &failed);
    }
    Ok(())
}

fn raise_job_incident(ctx: &mut Context<'_>, job_key: i64, job: &JobRecord) {
    let key = ctx.next_key();
    let message = if job.error_message.is_empty() {
        "No more retries left.".to_string()
    } else {
        job.error_message.clone()
    };
    let record = IncidentRecord {
        error_type: ErrorType::JobNoRetries,
        error_message: message,
        bpmn_process_id: job.bpmn_process_id.clone(),
        process_definition_key: job.process_definition_key,
        process_instance_key: job.process_instance_key,
        element_id: job.element_id.clone(),
        element_instance_key: job.element_instance_key,
        job_key,
        variable_scope_key: job.element_instance_key,
    };
    ctx.state.incidents.create(Incident {
        key,
        record: record.clone(),
        failed_event: None,
    });
    ctx.result.append_event(key, IncidentIntent::Created, record);
}

pub(super) fn update_retries(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let command = job_command(ctx)?;
    let job = existing_job(ctx, "update retries of")?;
    let key = job.key;
    if command.retries < 1 {
        return Err(ProcessingError::invalid_argument(format!(
            "Expected to update retries of job with key '{key}' with a positive amount of retries, but got {}",
            command.retries
        )));
    }

    ctx.state.jobs.set_retries(key, command.retries);
    if job.status == JobStatus::Failed {
        ctx.state.jobs.make_activatable(key);
    }
    let updated = ctx
        .state
        .jobs
        .get(key)
        .map(|j| j.record.clone())
        .ok_or_else(|| ProcessingError::InconsistentState(format!("job {key} vanished")))?;
    ctx.result
        .append_event(key, JobIntent::RetriesUpdated, updated);
    ctx.result.respond_with_last();

    if let Some(incident_key) = ctx.state.incidents.of_job(key) {
        if let Some(incident) = ctx.state.incidents.remove(incident_key) {
            ctx.result
                .append_event(incident_key, IncidentIntent::Resolved, incident.record);
        }
    }
    Ok(())
}

pub(super) fn time_out(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let job = existing_job(ctx, "time out")?;
    let key = job.key;
    if job.status != JobStatus::Activated {
        return Err(ProcessingError::invalid_state(format!(
            "Expected to time out activated job with key '{key}', but it is not activated"
        )));
    }

    let timed_out = ctx
        .state
        .jobs
        .make_activatable(key)
        .map(|j| j.record.clone())
        .ok_or_else(|| ProcessingError::InconsistentState(format!("job {key} vanished")))?;
    ctx.result.append_event(key, JobIntent::TimedOut, timed_out);
    ctx.result.respond_with_last();
    Ok(())
}

pub(super) fn activate_batch(ctx: &mut Context<'_>) -> ProcessingOutcome {
    let RecordValue::JobBatch(batch) = &ctx.record.value else {
        return Err(ProcessingError::invalid_argument("Expected a job batch record"));
    };
    if batch.job_type.is_empty() {
        return Err(ProcessingError::invalid_argument(
            "Expected to activate jobs of a non-empty type, but none given",
        ));
    }
    if batch.max_jobs_to_activate < 1 {
        return Err(ProcessingError::invalid_argument(format!(
            "Expected to activate at least one job, but max jobs to activate was {}",
            batch.max_jobs_to_activate
        )));
    }
    if batch.timeout < 1 {
        return Err(ProcessingError::invalid_argument(format!(
            "Expected an activation timeout greater than zero, but it was {}",
            batch.timeout
        )));
    }

    let deadline = ctx.now().saturating_add(batch.timeout);
    let mut activated = JobBatchRecord {
        job_type: batch.job_type.clone(),
        worker: batch.worker.clone(),
        timeout: batch.timeout,
        max_jobs_to_activate: batch.max_jobs_to_activate,
        job_keys: Vec::new(),
        jobs: Vec::new(),
    };
    for key in ctx
        .state
        .jobs
        .activatable(&batch.job_type, batch.max_jobs_to_activate as usize)
    {
        let Some(job) = ctx.state.jobs.activate(key, &batch.worker, deadline) else {
            continue;
        };
        let mut record = job.record.clone();
        record.variables = ctx.state.variables.collect(record.element_instance_key);
        activated.job_keys.push(key);
        activated.jobs.push(record);
    }

    let key = ctx.next_key();
    ctx.result
        .append_event(key, JobBatchIntent::Activated, activated);
    ctx.result.respond_with_last();
    Ok(())
}

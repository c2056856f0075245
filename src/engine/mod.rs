// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Record processing.
//!
//! # Architecture
//! [`Engine::process`] applies one record to the state and collects the
//! follow-up records it produces. Dispatch is a single `match` over the
//! record's `(record type, intent)`; records without a handler are not
//! processed at all.
//!
//! # Guarantees
//! - All or nothing: when a handler fails, every state change it made is
//!   rolled back and its follow-ups are discarded.
//! - A rejected command leaves exactly one `CommandRejection` follow-up.
//! - Processing is a pure function of state and record. "Now" is the
//!   record's timestamp, never the wall clock.

mod bpmn;
mod deployment;
mod error;
mod incident;
mod instance;
mod job;
mod message;
mod result;
mod timer;
mod variable;

use std::sync::Arc;

use tracing::debug;

use crate::bpmn::ExecutableProcess;
use crate::record::*;
use crate::state::EngineState;

pub use error::{ProcessingError, ProcessingOutcome};
pub use result::{CommandResponse, FollowUpRecord, ProcessingResult};

/// Everything a handler touches while processing one record.
pub(crate) struct Context<'a> {
    pub state: &'a mut EngineState,
    pub record: &'a TypedRecord,
    pub result: &'a mut ProcessingResult,
}

impl Context<'_> {
    pub fn now(&self) -> i64 {
        self.record.timestamp
    }

    pub fn next_key(&mut self) -> i64 {
        self.state.keys.next_key()
    }

    pub fn executable(&self, process_definition_key: i64) -> Result<Arc<ExecutableProcess>, ProcessingError> {
        self.state
            .processes
            .executable(process_definition_key)
            .ok_or(ProcessingError::MissingProcess(process_definition_key))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Engine;

impl Engine {
    pub fn new() -> Self {
        Self
    }

    /// Whether records of this kind are dispatched at all.
    pub fn handles(record_type: RecordType, intent: Intent) -> bool {
        use ProcessInstanceIntent as PI;
        match record_type {
            RecordType::Command => matches!(
                intent,
                Intent::Deployment(DeploymentIntent::Create)
                    | Intent::ProcessInstanceCreation(ProcessInstanceCreationIntent::Create)
                    | Intent::ProcessInstance(PI::Cancel)
                    | Intent::Job(JobIntent::Complete | JobIntent::Fail | JobIntent::UpdateRetries | JobIntent::TimeOut)
                    | Intent::JobBatch(JobBatchIntent::Activate)
                    | Intent::Incident(IncidentIntent::Resolve)
                    | Intent::Timer(TimerIntent::Trigger)
                    | Intent::Message(MessageIntent::Publish)
                    | Intent::VariableDocument(VariableDocumentIntent::Update)
            ),
            RecordType::Event => matches!(
                intent,
                Intent::ProcessInstance(
                    PI::ElementActivating
                        | PI::ElementActivated
                        | PI::ElementCompleting
                        | PI::ElementCompleted
                        | PI::ElementTerminating
                        | PI::ElementTerminated
                        | PI::EventOccurred
                )
            ),
            RecordType::CommandRejection => false,
        }
    }

    pub fn can_process(&self, record: &TypedRecord) -> bool {
        Self::handles(record.record_type(), record.intent())
    }

    pub fn process(
        &self,
        state: &mut EngineState,
        record: &TypedRecord,
        result: &mut ProcessingResult,
    ) -> ProcessingOutcome {
        if !self.can_process(record) {
            return Ok(());
        }

        let outcome = {
            let mut ctx = Context {
                state: &mut *state,
                record,
                result: &mut *result,
            };
            dispatch(&mut ctx)
        };

        match outcome {
            Ok(()) => {
                state.commit();
                Ok(())
            }
            Err(ProcessingError::Rejection {
                rejection_type,
                reason,
            }) if record.is_command() => {
                state.rollback();
                result.clear();
                debug!(
                    position = record.position,
                    intent = %record.intent().name(),
                    ?rejection_type,
                    %reason,
                    "command rejected"
                );
                result.append_rejection(
                    record.key,
                    record.intent(),
                    record.value.clone(),
                    rejection_type,
                    &reason,
                );
                result.respond_with_last();
                Ok(())
            }
            Err(ProcessingError::Rejection { reason, .. }) => {
                state.rollback();
                result.clear();
                Err(ProcessingError::InconsistentState(format!(
                    "event at position {} was rejected: {reason}",
                    record.position
                )))
            }
            Err(e) => {
                state.rollback();
                result.clear();
                Err(e)
            }
        }
    }
}

fn dispatch(ctx: &mut Context<'_>) -> ProcessingOutcome {
    use ProcessInstanceIntent as PI;
    match (ctx.record.record_type(), ctx.record.intent()) {
        (RecordType::Command, Intent::Deployment(DeploymentIntent::Create)) => deployment::create(ctx),
        (RecordType::Command, Intent::ProcessInstanceCreation(ProcessInstanceCreationIntent::Create)) => {
            instance::create(ctx)
        }
        (RecordType::Command, Intent::ProcessInstance(PI::Cancel)) => instance::cancel(ctx),
        (RecordType::Command, Intent::Job(JobIntent::Complete)) => job::complete(ctx),
        (RecordType::Command, Intent::Job(JobIntent::Fail)) => job::fail(ctx),
        (RecordType::Command, Intent::Job(JobIntent::UpdateRetries)) => job::update_retries(ctx),
        (RecordType::Command, Intent::Job(JobIntent::TimeOut)) => job::time_out(ctx),
        (RecordType::Command, Intent::JobBatch(JobBatchIntent::Activate)) => job::activate_batch(ctx),
        (RecordType::Command, Intent::Incident(IncidentIntent::Resolve)) => incident::resolve(ctx),
        (RecordType::Command, Intent::Timer(TimerIntent::Trigger)) => timer::trigger(ctx),
        (RecordType::Command, Intent::Message(MessageIntent::Publish)) => message::publish(ctx),
        (RecordType::Command, Intent::VariableDocument(VariableDocumentIntent::Update)) => variable::update(ctx),
        (RecordType::Event, Intent::ProcessInstance(intent)) => bpmn::process_event(ctx, intent),
        _ => Ok(()),
    }
}

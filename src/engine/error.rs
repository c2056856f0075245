// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use thiserror::Error;

use crate::error::KernelError;
use crate::record::RejectionType;
use crate::state::LifecycleState;

#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The command is refused. The engine rolls back and writes a
    /// `CommandRejection`; this never escapes `Engine::process`.
    #[error("Command rejected ({rejection_type:?}): {reason}")]
    Rejection {
        rejection_type: RejectionType,
        reason: String,
    },

    #[error("Process definition {0} is not deployed")]
    MissingProcess(i64),

    #[error("Element '{element_id}' does not exist in process definition {process_definition_key}")]
    MissingElement {
        element_id: String,
        process_definition_key: i64,
    },

    #[error("Illegal transition of element instance {key} from {from:?} to {to:?}")]
    IllegalTransition {
        key: i64,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl ProcessingError {
    pub fn rejection(rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        ProcessingError::Rejection {
            rejection_type,
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::rejection(RejectionType::NotFound, reason)
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::rejection(RejectionType::InvalidArgument, reason)
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::rejection(RejectionType::InvalidState, reason)
    }
}

pub type ProcessingOutcome = std::result::Result<(), ProcessingError>;

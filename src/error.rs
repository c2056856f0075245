// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Kernel error types.

use thiserror::Error;

use crate::bpmn::DeploymentError;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Unsupported protocol version {0}")]
    UnsupportedProtocol(u16),

    #[error("Invalid process: {0}")]
    Deployment(#[from] DeploymentError),

    #[error("State snapshot is invalid: {0}")]
    InvalidSnapshot(String),
}

pub type KernelResult<T> = std::result::Result<T, KernelError>;
pub type Result<T> = KernelResult<T>;

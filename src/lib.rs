// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! brook-kernel: the deterministic core of a partitioned workflow engine.
//!
//! # Architecture
//! - [`record`]: the typed records that make up a partition log.
//! - [`bpmn`]: process models, their validation and compiled form.
//! - [`expr`]: variable documents, JSON paths, conditions and mappings.
//! - [`state`]: the partition state, journaled so a failed record leaves
//!   no trace.
//! - [`engine`]: applies one record to the state and produces follow-ups.
//!
//! # Guarantees
//! Processing the same records from the same state always yields the same
//! follow-ups and the same state hash. Nothing here reads the clock, spawns
//! threads or does I/O.

pub mod bpmn;
pub mod engine;
pub mod error;
pub mod expr;
pub mod record;
pub mod state;

pub use engine::{Engine, ProcessingError, ProcessingResult};
pub use error::{KernelError, Result};
pub use record::TypedRecord;
pub use state::EngineState;

#[cfg(test)]
mod tests;

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

pub mod snapload;
pub mod snapshots;
pub mod validate;

use snapvisor_core::{HardValidationError, OrchestratorError};
use thiserror::Error;

/// Failure of a CLI command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("Invalid argument: {0}")]
    Argument(#[from] HardValidationError),

    #[error("Failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type CommandResult<T = ()> = Result<T, CommandError>;

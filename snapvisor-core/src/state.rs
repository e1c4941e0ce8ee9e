// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! MicroVM lifecycle state machine with typed transitions.
//!
//! Implements the lifecycle:
//! Absent → Running → Paused → {Offloaded, Running};
//! Offloaded → Loaded → Running → Absent.
//! Invalid transitions result in StateTransitionError.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::VmId;

/// MicroVM lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmState {
    /// No record exists for the identity (never started, or stopped).
    Absent,

    /// The microVM is executing.
    Running,

    /// Execution is frozen; the process and network slot are held.
    Paused,

    /// Restored from a snapshot and not yet resumed. Behaves like `Paused`
    /// except that it cannot be stopped before being resumed.
    Loaded,

    /// The process is gone and the slot released; only the snapshot remains.
    Offloaded,
}

/// Lifecycle operations that drive transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Start,
    Pause,
    Checkpoint,
    Offload,
    Restore,
    Resume,
    Stop,
}

impl Operation {
    /// Get the operation name for logs and error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Checkpoint => "checkpoint",
            Self::Offload => "offload",
            Self::Restore => "restore",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }

    pub const ALL: [Operation; 7] = [
        Self::Start,
        Self::Pause,
        Self::Checkpoint,
        Self::Offload,
        Self::Restore,
        Self::Resume,
        Self::Stop,
    ];
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl VmState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Absent => "Absent",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Loaded => "Loaded",
            Self::Offloaded => "Offloaded",
        }
    }

    /// The state reached by applying `operation`, or None if illegal.
    ///
    /// Offload's snapshot requirement is checked separately by the caller.
    pub fn next(&self, operation: Operation) -> Option<VmState> {
        use Operation as Op;

        match (self, operation) {
            (Self::Absent, Op::Start) => Some(Self::Running),
            (Self::Absent | Self::Offloaded, Op::Restore) => Some(Self::Loaded),

            (Self::Running, Op::Pause) => Some(Self::Paused),

            (Self::Paused, Op::Checkpoint) => Some(Self::Paused),
            (Self::Loaded, Op::Checkpoint) => Some(Self::Loaded),

            (Self::Paused | Self::Loaded, Op::Resume) => Some(Self::Running),

            (Self::Paused | Self::Loaded, Op::Offload) => Some(Self::Offloaded),

            // Loaded must be resumed before it can be stopped.
            (Self::Running | Self::Paused, Op::Stop) => Some(Self::Absent),

            _ => None,
        }
    }

    /// Check whether `operation` is legal from this state.
    pub fn allows(&self, operation: Operation) -> bool {
        self.next(operation).is_some()
    }

    /// Whether a hypervisor process exists in this state.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Loaded)
    }

    /// Validate a transition, producing the target state or a typed error.
    pub fn transition(
        &self,
        vm_id: &VmId,
        operation: Operation,
    ) -> Result<VmState, StateTransitionError> {
        match self.next(operation) {
            Some(next) => Ok(next),
            None if operation == Operation::Start || operation == Operation::Restore => {
                Err(StateTransitionError::IdentityInUse {
                    vm_id: vm_id.clone(),
                    state: self.name(),
                    operation: operation.name(),
                })
            }
            None => Err(StateTransitionError::InvalidTransition {
                vm_id: vm_id.clone(),
                from: self.name(),
                operation: operation.name(),
            }),
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Transition bookkeeping for one VM record.
#[derive(Debug)]
pub struct TransitionLog {
    last_transition: Instant,
    transition_count: u64,
}

impl TransitionLog {
    pub fn new() -> Self {
        Self {
            last_transition: Instant::now(),
            transition_count: 0,
        }
    }

    /// Record a completed transition.
    pub fn record(&mut self, vm_id: &VmId, from: VmState, to: VmState, operation: Operation) {
        tracing::debug!(
            vm_id = %vm_id,
            from = from.name(),
            to = to.name(),
            operation = operation.name(),
            "State transition"
        );
        self.last_transition = Instant::now();
        self.transition_count += 1;
    }

    /// Get time since last transition.
    pub fn time_in_current_state(&self) -> std::time::Duration {
        self.last_transition.elapsed()
    }

    /// Get total number of transitions.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }
}

impl Default for TransitionLog {
    fn default() -> Self {
        Self::new()
    }
}

//! Custom error types for snapvisor.
//!
//! Explicit enum error types per concern; no `Box<dyn Error>`, no `anyhow::Result`.
//! Every error maps onto one caller-visible [`ErrorKind`].

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ImageRef, SnapshotKey, VmId};

/// Caller-visible classification of every orchestrator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No network slot or storage capacity available.
    ResourceExhausted,
    /// Unknown identity, missing snapshot or missing image.
    NotFound,
    /// Operation illegal in the current lifecycle state.
    InvalidState,
    /// Snapshot or image read/write failure, including corrupt snapshots.
    Io,
    /// Deadline exceeded on a blocking call.
    Timeout,
    /// Caller cancelled the operation.
    Cancelled,
    /// Rejected configuration or argument.
    InvalidArgument,
    /// The hypervisor backend failed.
    Hypervisor,
}

impl ErrorKind {
    /// Label used in logs and metrics.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ResourceExhausted => "resource_exhausted",
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::Io => "io",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidArgument => "invalid_argument",
            Self::Hypervisor => "hypervisor",
        }
    }
}

/// Top-level error type for the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Invalid state: {0}")]
    InvalidState(#[from] StateTransitionError),

    #[error("VM not found: {0}")]
    VmNotFound(VmId),

    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: &'static str },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Network pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl OrchestratorError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HardValidation(_) | Self::ConfigNotFound { .. } | Self::ConfigParse { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::VmNotFound(_) => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Pool(e) => e.kind(),
            Self::Image(e) => e.kind(),
            Self::Snapshot(e) => e.kind(),
            Self::Hypervisor(_) => ErrorKind::Hypervisor,
            Self::Io { .. } => ErrorKind::Io,
        }
    }
}

/// Hard validation errors reject configuration or arguments outright.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Value out of bounds: {field} = {value} (min: {min}, max: {max})")]
    OutOfBounds {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Unknown storage driver: {name} (expected one of: {expected})")]
    UnknownStorageDriver { name: String, expected: String },
}

/// Lifecycle state machine violations.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot {operation} VM {vm_id} in state {from}")]
    InvalidTransition {
        vm_id: VmId,
        from: &'static str,
        operation: &'static str,
    },

    #[error("Cannot {operation} VM {vm_id}: identity already in use ({state})")]
    IdentityInUse {
        vm_id: VmId,
        state: &'static str,
        operation: &'static str,
    },

    #[error("Cannot offload VM {vm_id}: no published snapshot")]
    NoSnapshot { vm_id: VmId },
}

/// Network resource pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("All {capacity} network slots are in use")]
    Exhausted { capacity: usize },

    #[error("Network pool has been torn down")]
    Closed,

    #[error("Cannot tear down network pool: {outstanding} slots still leased")]
    LeasesOutstanding { outstanding: usize },
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Exhausted { .. } | Self::Closed => ErrorKind::ResourceExhausted,
            Self::LeasesOutstanding { .. } => ErrorKind::InvalidState,
        }
    }
}

/// Image cache errors.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image not found: {reference}")]
    NotFound { reference: ImageRef },

    #[error("Failed to cache image {reference}: {source}")]
    Io {
        reference: ImageRef,
        #[source]
        source: std::io::Error,
    },
}

impl ImageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Io { .. } => ErrorKind::Io,
        }
    }
}

/// Snapshot store errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot not found: {key}")]
    NotFound { key: SnapshotKey },

    #[error("Checkpoint already in flight for snapshot {key}")]
    InFlight { key: SnapshotKey },

    #[error("Snapshot {key} is corrupt: {reason}")]
    Corrupt { key: SnapshotKey, reason: String },

    #[error("Snapshot {key} cannot be used here: {reason}")]
    Incompatible { key: SnapshotKey, reason: String },

    #[error("Snapshot IO error on {key}: {context} - {source}")]
    Io {
        key: SnapshotKey,
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl SnapshotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InFlight { .. } => ErrorKind::InvalidState,
            Self::Corrupt { .. } | Self::Io { .. } => ErrorKind::Io,
            Self::Incompatible { .. } => ErrorKind::InvalidArgument,
        }
    }
}

/// Hypervisor control boundary errors.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("Failed to spawn hypervisor process: {reason}")]
    SpawnFailed { reason: String },

    #[error("API socket {path} not ready after {timeout_ms}ms")]
    SocketTimeout { path: PathBuf, timeout_ms: u64 },

    #[error("API request {method} {endpoint} failed with {status}: {body}")]
    Api {
        method: &'static str,
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("API transport error: {reason}")]
    Transport { reason: String },

    #[error("Hypervisor process for VM {vm_id} is not running")]
    ProcessGone { vm_id: VmId },

    #[error("Hypervisor IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid hypervisor state file: {reason}")]
    InvalidStateFile { reason: String },

    #[error("Injected fault in {operation}")]
    Injected { operation: &'static str },
}

/// Result type alias using OrchestratorError.
pub type OrchResult<T> = Result<T, OrchestratorError>;

/// Result type alias for hypervisor adapters.
pub type HypervisorResult<T> = Result<T, HypervisorError>;

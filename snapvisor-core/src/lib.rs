// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Snapvisor Core Library
//!
//! MicroVM lifecycle orchestration for serverless function instances.
//! Provides the lifecycle state machine, network slot pool, image cache,
//! snapshot store, hypervisor control boundary and the orchestrator that
//! composes them.

pub mod config;
pub mod context;
pub mod error;
pub mod hypervisor;
pub mod image;
pub mod metrics;
pub mod network;
pub mod orchestrator;
pub mod registry;
pub mod snapshot;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, HypervisorBackend, OrchestratorConfig, StorageDriver};
pub use context::{CancelHandle, OpContext};
pub use error::{ErrorKind, HardValidationError, OrchResult, OrchestratorError};
pub use hypervisor::{Endpoint, Hypervisor, SimulatedHypervisor};
pub use image::{DirectorySource, ImageSource, ResolvedImage};
pub use network::{NetworkPool, NetworkSlot};
pub use orchestrator::{Orchestrator, PoolStats, SnapshotSpec, StartReport, VmSpec};
pub use registry::VmInfo;
pub use snapshot::{RestoreStrategy, SnapshotMetadata, SnapshotStore};
pub use state::{Operation, VmState};
pub use types::{ImageRef, MemorySize, Namespace, Revision, SnapshotKey, VcpuCount, VmId};

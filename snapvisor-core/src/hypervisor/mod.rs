// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Hypervisor control boundary.
//!
//! The orchestrator composes these calls and never reaches past them. Each
//! adapter owns its process type; dropping a process handle without calling
//! [`Hypervisor::stop`] must still terminate the VM.

pub mod firecracker;
pub mod simulated;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::HypervisorResult;
use crate::network::NetworkSlot;
use crate::types::{ImageRef, MemorySize, SnapshotKey, VcpuCount, VmId};

pub use firecracker::{FirecrackerConfig, FirecrackerHypervisor, FirecrackerProcess};
pub use simulated::{SimulatedHypervisor, SimulatedProcess};

/// Port the guest function server listens on.
pub const GUEST_PORT: u16 = 50051;

/// Everything needed to bring up one microVM.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub vm_id: VmId,
    pub image: ImageRef,
    /// Cached root filesystem. Read-only; adapters copy it before writing.
    pub rootfs: PathBuf,
    pub memory: MemorySize,
    pub vcpus: VcpuCount,
    pub network: NetworkSlot,
    /// Per-VM scratch directory owned by the orchestrator.
    pub work_dir: PathBuf,
}

/// Where a running guest can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn for_slot(slot: &NetworkSlot) -> Self {
        Self {
            ip: slot.guest_ip,
            port: GUEST_PORT,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Files a checkpoint is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointTarget {
    pub state_path: PathBuf,
    pub memory_path: PathBuf,
    pub disk_path: PathBuf,
}

/// How guest memory is supplied on restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryBackend {
    /// Fully verified file, loaded up front.
    File(PathBuf),
    /// File whose pages are faulted in on first access.
    OnDemand(PathBuf),
    /// File served through a userfault page-fault handler.
    Uffd(PathBuf),
}

impl MemoryBackend {
    pub fn path(&self) -> &Path {
        match self {
            Self::File(path) | Self::OnDemand(path) | Self::Uffd(path) => path,
        }
    }

    pub fn is_lazy(&self) -> bool {
        !matches!(self, Self::File(_))
    }
}

/// Materialized snapshot handed to [`Hypervisor::restore`].
#[derive(Debug, Clone)]
pub struct RestoreSource {
    pub key: SnapshotKey,
    pub state_path: PathBuf,
    pub memory: MemoryBackend,
    /// Private writable disk for the restored VM.
    pub disk_path: PathBuf,
    pub memory_size: MemorySize,
    /// Length of the guest memory image in bytes.
    pub memory_len: u64,
}

/// The capability the orchestrator needs from a virtualization engine.
///
/// Calls block until the VM reached the requested state. The orchestrator
/// bounds every call with its own deadline and may drop the future.
#[async_trait]
pub trait Hypervisor: Send + Sync + 'static {
    /// Handle to one live VM process.
    type Process: Send + Sync + 'static;

    /// Adapter name for logs.
    fn name(&self) -> &'static str;

    /// Create and boot a VM.
    async fn create(&self, spec: &LaunchSpec) -> HypervisorResult<Self::Process>;

    /// Freeze guest execution.
    async fn pause(&self, process: &Self::Process) -> HypervisorResult<()>;

    /// Unfreeze guest execution.
    async fn resume(&self, process: &Self::Process) -> HypervisorResult<Endpoint>;

    /// Terminate the VM and release its process.
    async fn stop(&self, process: Self::Process) -> HypervisorResult<()>;

    /// Write a full checkpoint of a paused VM.
    async fn checkpoint(
        &self,
        process: &Self::Process,
        target: &CheckpointTarget,
    ) -> HypervisorResult<()>;

    /// Reconstruct a paused VM from a materialized snapshot.
    async fn restore(
        &self,
        source: &RestoreSource,
        spec: &LaunchSpec,
    ) -> HypervisorResult<Self::Process>;
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-process simulated hypervisor.
//!
//! Each simulated guest is a tiny deterministic machine: guest memory is one
//! page per MiB, and every invocation of the guest's function increments a
//! counter stored in memory page 0 and appends to its disk. Checkpoints and
//! restores write and read real files, so snapshot integrity, sparseness and
//! lazy loading behave as they would with a real engine.
//!
//! Faults (failures and latency) can be injected per call for testing.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{CheckpointTarget, Endpoint, Hypervisor, LaunchSpec, MemoryBackend, RestoreSource};
use crate::error::{HypervisorError, HypervisorResult};
use crate::types::{MemorySize, VmId};

/// Bytes of simulated guest memory per MiB of configured memory.
pub const PAGE_SIZE: u64 = 4096;
const ROOTFS_FILE: &str = "rootfs.ext4";
const STATE_FORMAT: &str = "snapvisor-sim/1";
/// Offset on disk where the guest records its invocation counter.
const DISK_COUNTER_OFFSET: u64 = PAGE_SIZE;

/// Hypervisor calls that can be faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimCall {
    Create,
    Pause,
    Resume,
    Stop,
    Checkpoint,
    Restore,
}

impl SimCall {
    fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Checkpoint => "checkpoint",
            Self::Restore => "restore",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    format: String,
    vm_id: VmId,
    memory: MemorySize,
    memory_len: u64,
    vcpus: u8,
}

enum GuestMemory {
    Resident(Vec<u8>),
    /// Not yet read; faulted in from the file on first access.
    Deferred(PathBuf),
}

struct GuestState {
    paused: bool,
    memory: GuestMemory,
}

struct Guest {
    vm_id: VmId,
    pid: u64,
    endpoint: Endpoint,
    disk_path: PathBuf,
    memory: MemorySize,
    vcpus: u8,
    state: Mutex<GuestState>,
}

impl Guest {
    fn lock(&self) -> MutexGuard<'_, GuestState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn memory_len(&self) -> u64 {
        self.memory.mib() as u64 * PAGE_SIZE
    }

    /// Resident guest memory, faulting it in if deferred.
    async fn resident_memory(&self) -> HypervisorResult<Vec<u8>> {
        let deferred = match &self.lock().memory {
            GuestMemory::Resident(bytes) => return Ok(bytes.clone()),
            GuestMemory::Deferred(path) => path.clone(),
        };

        let bytes = tokio::fs::read(&deferred)
            .await
            .map_err(|source| HypervisorError::Io {
                context: "fault in guest memory",
                source,
            })?;
        if bytes.len() as u64 != self.memory_len() {
            return Err(HypervisorError::InvalidStateFile {
                reason: format!(
                    "memory file is {} bytes, expected {}",
                    bytes.len(),
                    self.memory_len()
                ),
            });
        }

        tracing::trace!(vm_id = %self.vm_id, "Guest memory faulted in");

        let mut state = self.lock();
        if let GuestMemory::Deferred(_) = state.memory {
            state.memory = GuestMemory::Resident(bytes.clone());
        }
        Ok(bytes)
    }
}

fn read_counter(memory: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&memory[..8]);
    u64::from_le_bytes(buf)
}

#[derive(Default)]
struct SimInner {
    guests: DashMap<Endpoint, Arc<Guest>>,
    live: AtomicUsize,
    next_pid: AtomicU64,
    pending_failures: Mutex<HashMap<SimCall, u32>>,
    latency: Mutex<HashMap<SimCall, Duration>>,
}

/// Handle to one simulated guest.
pub struct SimulatedProcess {
    guest: Arc<Guest>,
    inner: Arc<SimInner>,
}

impl SimulatedProcess {
    pub fn vm_id(&self) -> &VmId {
        &self.guest.vm_id
    }

    pub fn pid(&self) -> u64 {
        self.guest.pid
    }

    pub fn endpoint(&self) -> Endpoint {
        self.guest.endpoint
    }

    pub fn is_paused(&self) -> bool {
        self.guest.lock().paused
    }

    /// Whether guest memory has been read into the process.
    pub fn memory_resident(&self) -> bool {
        matches!(self.guest.lock().memory, GuestMemory::Resident(_))
    }
}

impl Drop for SimulatedProcess {
    fn drop(&mut self) {
        self.inner
            .guests
            .remove_if(&self.guest.endpoint, |_, guest| Arc::ptr_eq(guest, &self.guest));
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SimulatedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedProcess")
            .field("vm_id", &self.guest.vm_id)
            .field("pid", &self.guest.pid)
            .finish()
    }
}

/// Deterministic in-process hypervisor.
#[derive(Clone, Default)]
pub struct SimulatedHypervisor {
    inner: Arc<SimInner>,
}

impl SimulatedHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls of `call` fail.
    pub fn fail_next(&self, call: SimCall, count: u32) {
        let mut pending = self
            .inner
            .pending_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        *pending.entry(call).or_insert(0) += count;
    }

    /// Delay every `call` by `delay` before it takes effect.
    pub fn set_latency(&self, call: SimCall, delay: Duration) {
        self.inner
            .latency
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(call, delay);
    }

    /// Number of processes that exist right now.
    pub fn live_processes(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Invoke the function served at `endpoint`, returning the guest's
    /// invocation count afterwards.
    pub async fn invoke(&self, endpoint: &Endpoint) -> HypervisorResult<u64> {
        let guest = self
            .inner
            .guests
            .get(endpoint)
            .map(|g| Arc::clone(g.value()))
            .ok_or_else(|| HypervisorError::Transport {
                reason: format!("connection refused: {}", endpoint),
            })?;

        guest.resident_memory().await?;

        let count = {
            let mut state = guest.lock();
            if state.paused {
                return Err(HypervisorError::Transport {
                    reason: format!("guest at {} is not running", endpoint),
                });
            }
            match &mut state.memory {
                GuestMemory::Resident(memory) => {
                    let count = read_counter(memory) + 1;
                    memory[..8].copy_from_slice(&count.to_le_bytes());
                    count
                }
                GuestMemory::Deferred(_) => {
                    return Err(HypervisorError::InvalidStateFile {
                        reason: "guest memory not resident".to_string(),
                    })
                }
            }
        };

        let mut disk = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&guest.disk_path)
            .await
            .map_err(|source| HypervisorError::Io {
                context: "open guest disk",
                source,
            })?;
        disk.seek(SeekFrom::Start(DISK_COUNTER_OFFSET))
            .await
            .map_err(|source| HypervisorError::Io {
                context: "write guest disk",
                source,
            })?;
        disk.write_all(&count.to_le_bytes())
            .await
            .map_err(|source| HypervisorError::Io {
                context: "write guest disk",
                source,
            })?;

        Ok(count)
    }

    /// Apply injected latency and failures for `call`.
    async fn intercept(&self, call: SimCall) -> HypervisorResult<()> {
        let delay = self
            .inner
            .latency
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&call)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut pending = self
            .inner
            .pending_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(remaining) = pending.get_mut(&call) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HypervisorError::Injected {
                    operation: call.name(),
                });
            }
        }
        Ok(())
    }

    fn register(&self, guest: Guest) -> SimulatedProcess {
        let guest = Arc::new(guest);
        self.inner.guests.insert(guest.endpoint, Arc::clone(&guest));
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        SimulatedProcess {
            guest,
            inner: Arc::clone(&self.inner),
        }
    }

    async fn prepare_work_dir(spec: &LaunchSpec) -> HypervisorResult<PathBuf> {
        tokio::fs::create_dir_all(&spec.work_dir)
            .await
            .map_err(|source| HypervisorError::Io {
                context: "create work dir",
                source,
            })?;
        Ok(spec.work_dir.join(ROOTFS_FILE))
    }
}

impl std::fmt::Debug for SimulatedHypervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedHypervisor")
            .field("live", &self.live_processes())
            .finish()
    }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    type Process = SimulatedProcess;

    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn create(&self, spec: &LaunchSpec) -> HypervisorResult<SimulatedProcess> {
        self.intercept(SimCall::Create).await?;

        let disk_path = Self::prepare_work_dir(spec).await?;
        tokio::fs::copy(&spec.rootfs, &disk_path)
            .await
            .map_err(|source| HypervisorError::Io {
                context: "copy rootfs",
                source,
            })?;

        let memory_len = spec.memory.mib() as u64 * PAGE_SIZE;
        let process = self.register(Guest {
            vm_id: spec.vm_id.clone(),
            pid: self.inner.next_pid.fetch_add(1, Ordering::SeqCst) + 1,
            endpoint: Endpoint::for_slot(&spec.network),
            disk_path,
            memory: spec.memory,
            vcpus: spec.vcpus.value(),
            state: Mutex::new(GuestState {
                paused: false,
                memory: GuestMemory::Resident(vec![0u8; memory_len as usize]),
            }),
        });

        tracing::debug!(
            vm_id = %spec.vm_id,
            image = %spec.image,
            pid = process.pid(),
            "Simulated guest booted"
        );
        Ok(process)
    }

    async fn pause(&self, process: &SimulatedProcess) -> HypervisorResult<()> {
        self.intercept(SimCall::Pause).await?;
        process.guest.lock().paused = true;
        Ok(())
    }

    async fn resume(&self, process: &SimulatedProcess) -> HypervisorResult<Endpoint> {
        self.intercept(SimCall::Resume).await?;
        process.guest.lock().paused = false;
        Ok(process.guest.endpoint)
    }

    async fn stop(&self, process: SimulatedProcess) -> HypervisorResult<()> {
        self.intercept(SimCall::Stop).await?;
        tracing::debug!(vm_id = %process.guest.vm_id, pid = process.pid(), "Simulated guest stopped");
        drop(process);
        Ok(())
    }

    async fn checkpoint(
        &self,
        process: &SimulatedProcess,
        target: &CheckpointTarget,
    ) -> HypervisorResult<()> {
        let guest = &process.guest;
        if !guest.lock().paused {
            return Err(HypervisorError::Api {
                method: "PUT",
                endpoint: "/snapshot/create".to_string(),
                status: 400,
                body: "VM must be paused before taking a snapshot".to_string(),
            });
        }

        let memory = guest.resident_memory().await?;
        let io = |context: &'static str| move |source| HypervisorError::Io { context, source };

        tokio::fs::write(&target.memory_path, &memory)
            .await
            .map_err(io("write memory file"))?;

        // Latency lands between the memory and state writes so an abandoned
        // checkpoint leaves partial output behind.
        self.intercept(SimCall::Checkpoint).await?;

        let state = StateFile {
            format: STATE_FORMAT.to_string(),
            vm_id: guest.vm_id.clone(),
            memory: guest.memory,
            memory_len: guest.memory_len(),
            vcpus: guest.vcpus,
        };
        let state = serde_json::to_vec(&state).map_err(|e| HypervisorError::InvalidStateFile {
            reason: e.to_string(),
        })?;
        tokio::fs::write(&target.state_path, state)
            .await
            .map_err(io("write state file"))?;
        tokio::fs::copy(&guest.disk_path, &target.disk_path)
            .await
            .map_err(io("copy disk"))?;

        Ok(())
    }

    async fn restore(
        &self,
        source: &RestoreSource,
        spec: &LaunchSpec,
    ) -> HypervisorResult<SimulatedProcess> {
        self.intercept(SimCall::Restore).await?;

        let raw = tokio::fs::read(&source.state_path)
            .await
            .map_err(|source| HypervisorError::Io {
                context: "read state file",
                source,
            })?;
        let state: StateFile =
            serde_json::from_slice(&raw).map_err(|e| HypervisorError::InvalidStateFile {
                reason: e.to_string(),
            })?;
        if state.format != STATE_FORMAT {
            return Err(HypervisorError::InvalidStateFile {
                reason: format!("unknown format {}", state.format),
            });
        }
        if state.memory != spec.memory || state.memory_len != source.memory_len {
            return Err(HypervisorError::InvalidStateFile {
                reason: format!(
                    "snapshot has {} ({} bytes), restore requested {}",
                    state.memory, state.memory_len, spec.memory
                ),
            });
        }

        let memory = match &source.memory {
            MemoryBackend::File(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|source| HypervisorError::Io {
                        context: "read memory file",
                        source,
                    })?;
                if bytes.len() as u64 != state.memory_len {
                    return Err(HypervisorError::InvalidStateFile {
                        reason: "memory file length mismatch".to_string(),
                    });
                }
                GuestMemory::Resident(bytes)
            }
            MemoryBackend::OnDemand(path) | MemoryBackend::Uffd(path) => {
                GuestMemory::Deferred(path.clone())
            }
        };

        let disk_path = Self::prepare_work_dir(spec).await?;
        if source.disk_path != disk_path {
            tokio::fs::rename(&source.disk_path, &disk_path)
                .await
                .map_err(|source| HypervisorError::Io {
                    context: "move restored disk",
                    source,
                })?;
        }

        let process = self.register(Guest {
            vm_id: spec.vm_id.clone(),
            pid: self.inner.next_pid.fetch_add(1, Ordering::SeqCst) + 1,
            endpoint: Endpoint::for_slot(&spec.network),
            disk_path,
            memory: spec.memory,
            vcpus: spec.vcpus.value(),
            state: Mutex::new(GuestState {
                paused: true,
                memory,
            }),
        });

        tracing::debug!(
            vm_id = %spec.vm_id,
            image = %spec.image,
            key = %source.key,
            from_vm = %state.vm_id,
            lazy = source.memory.is_lazy(),
            "Simulated guest restored"
        );
        Ok(process)
    }
}

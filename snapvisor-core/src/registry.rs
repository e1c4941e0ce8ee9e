// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! VM instance registry with per-identity serialization.
//!
//! Each identity maps to its own async mutex, so operations on one VM queue
//! behind each other while unrelated VMs proceed. A cell whose record is
//! removed is retired and unlinked from the map; a waiter that wakes up
//! holding a retired cell retries against the map. Two records for one
//! identity can therefore never coexist.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::hypervisor::Endpoint;
use crate::metrics::VMS_BY_STATE;
use crate::network::{NetworkSlot, SlotLease};
use crate::state::{Operation, TransitionLog, VmState};
use crate::types::{ImageRef, MemorySize, Revision, SnapshotKey, VcpuCount, VmId};

/// How the VM's current process came to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootOrigin {
    Cold,
    Snapshot(SnapshotKey),
}

/// Lifecycle phase of a VM that has a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivePhase {
    Running,
    Paused,
    Loaded,
}

impl From<LivePhase> for VmState {
    fn from(phase: LivePhase) -> Self {
        match phase {
            LivePhase::Running => VmState::Running,
            LivePhase::Paused => VmState::Paused,
            LivePhase::Loaded => VmState::Loaded,
        }
    }
}

/// Whether the VM holds host resources.
pub enum Residency<P> {
    /// A process exists and holds a network slot.
    Live {
        process: P,
        lease: SlotLease,
        phase: LivePhase,
    },
    /// Only the snapshot remains.
    Offloaded,
}

/// One registered VM.
pub struct VmInstance<P> {
    pub vm_id: VmId,
    pub image: ImageRef,
    pub revision: Revision,
    pub memory: MemorySize,
    pub vcpus: VcpuCount,
    /// Preferred sparse flag for this VM's checkpoints.
    pub sparse: bool,
    pub origin: BootOrigin,
    /// Last snapshot published for this VM.
    pub snapshot: Option<SnapshotKey>,
    pub residency: Residency<P>,
    pub created_at: SystemTime,
    transitions: TransitionLog,
    retired: bool,
}

impl<P> VmInstance<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vm_id: VmId,
        image: ImageRef,
        revision: Revision,
        memory: MemorySize,
        vcpus: VcpuCount,
        sparse: bool,
        origin: BootOrigin,
        residency: Residency<P>,
        operation: Operation,
    ) -> Self {
        let snapshot = match &origin {
            BootOrigin::Snapshot(key) => Some(key.clone()),
            BootOrigin::Cold => None,
        };

        let mut instance = Self {
            vm_id,
            image,
            revision,
            memory,
            vcpus,
            sparse,
            origin,
            snapshot,
            residency,
            created_at: SystemTime::now(),
            transitions: TransitionLog::new(),
            retired: false,
        };
        let state = instance.state();
        instance.record(VmState::Absent, state, operation);
        instance
    }

    pub fn state(&self) -> VmState {
        match &self.residency {
            Residency::Live { phase, .. } => (*phase).into(),
            Residency::Offloaded => VmState::Offloaded,
        }
    }

    pub fn process(&self) -> Option<&P> {
        match &self.residency {
            Residency::Live { process, .. } => Some(process),
            Residency::Offloaded => None,
        }
    }

    pub fn slot(&self) -> Option<&NetworkSlot> {
        match &self.residency {
            Residency::Live { lease, .. } => Some(lease.slot()),
            Residency::Offloaded => None,
        }
    }

    /// Guest endpoint while a process exists.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.slot().map(Endpoint::for_slot)
    }

    /// Change the phase of a live VM, recording the transition.
    pub fn set_phase(&mut self, next: LivePhase, operation: Operation) {
        let from = self.state();
        if let Residency::Live { phase, .. } = &mut self.residency {
            *phase = next;
        }
        self.record(from, next.into(), operation);
    }

    /// Replace the residency wholesale, returning the previous one.
    pub fn replace_residency(
        &mut self,
        residency: Residency<P>,
        operation: Operation,
    ) -> Residency<P> {
        let from = self.state();
        let previous = std::mem::replace(&mut self.residency, residency);
        let to = self.state();
        self.record(from, to, operation);
        previous
    }

    /// Deregister the record, handing back the process and lease if live.
    pub fn retire(mut self, operation: Operation) -> Option<(P, SlotLease)> {
        let from = self.state();
        let residency = std::mem::replace(&mut self.residency, Residency::Offloaded);
        self.record(from, VmState::Absent, operation);
        self.retired = true;

        match residency {
            Residency::Live { process, lease, .. } => Some((process, lease)),
            Residency::Offloaded => None,
        }
    }

    fn record(&mut self, from: VmState, to: VmState, operation: Operation) {
        if from != to {
            if from != VmState::Absent {
                VMS_BY_STATE.with_label_values(&[from.name()]).dec();
            }
            if to != VmState::Absent {
                VMS_BY_STATE.with_label_values(&[to.name()]).inc();
            }
        }
        self.transitions.record(&self.vm_id, from, to, operation);
    }

    /// Handle-free view of this record.
    pub fn info(&self) -> VmInfo {
        VmInfo {
            vm_id: self.vm_id.clone(),
            image: self.image.clone(),
            revision: self.revision.clone(),
            memory_mib: self.memory.mib(),
            vcpus: self.vcpus.value(),
            sparse: self.sparse,
            state: self.state(),
            origin: self.origin.clone(),
            snapshot: self.snapshot.clone(),
            network: self.slot().cloned(),
            endpoint: self.endpoint(),
            transitions: self.transitions.transition_count(),
            seconds_in_state: self.transitions.time_in_current_state().as_secs_f64(),
        }
    }
}

impl<P> Drop for VmInstance<P> {
    fn drop(&mut self) {
        if !self.retired {
            VMS_BY_STATE.with_label_values(&[self.state().name()]).dec();
        }
    }
}

/// Snapshot of a VM record without process or lease handles.
#[derive(Debug, Clone, Serialize)]
pub struct VmInfo {
    pub vm_id: VmId,
    pub image: ImageRef,
    pub revision: Revision,
    pub memory_mib: u32,
    pub vcpus: u8,
    pub sparse: bool,
    pub state: VmState,
    pub origin: BootOrigin,
    pub snapshot: Option<SnapshotKey>,
    pub network: Option<NetworkSlot>,
    pub endpoint: Option<Endpoint>,
    pub transitions: u64,
    pub seconds_in_state: f64,
}

struct Cell<P> {
    retired: bool,
    instance: Option<VmInstance<P>>,
}

type CellRef<P> = Arc<Mutex<Cell<P>>>;

/// Registry of VM records keyed by identity.
pub struct VmRegistry<P> {
    cells: Arc<DashMap<VmId, CellRef<P>>>,
}

impl<P: Send + 'static> VmRegistry<P> {
    pub fn new() -> Self {
        Self {
            cells: Arc::new(DashMap::new()),
        }
    }

    /// Acquire exclusive access to `vm_id`'s record, waiting for any
    /// operation already holding it.
    pub async fn lock(&self, vm_id: &VmId) -> VmGuard<P> {
        loop {
            let cell = self
                .cells
                .entry(vm_id.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Cell {
                        retired: false,
                        instance: None,
                    }))
                })
                .clone();

            let guard = Arc::clone(&cell).lock_owned().await;
            if guard.retired {
                continue;
            }

            return VmGuard {
                vm_id: vm_id.clone(),
                cell,
                guard: Some(guard),
                cells: Arc::clone(&self.cells),
            };
        }
    }

    /// Identities that currently have a cell. Cells being created or
    /// retired concurrently may or may not be included.
    pub fn ids(&self) -> Vec<VmId> {
        let mut ids: Vec<VmId> = self.cells.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<P: Send + 'static> Default for VmRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to one identity's record.
///
/// If the guard is dropped with no record present, the identity's cell is
/// retired and removed from the registry.
pub struct VmGuard<P> {
    vm_id: VmId,
    cell: CellRef<P>,
    guard: Option<OwnedMutexGuard<Cell<P>>>,
    cells: Arc<DashMap<VmId, CellRef<P>>>,
}

impl<P> VmGuard<P> {
    fn cell(&self) -> &Cell<P> {
        // Present until drop.
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("guard taken before drop"),
        }
    }

    fn cell_mut(&mut self) -> &mut Cell<P> {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("guard taken before drop"),
        }
    }

    pub fn vm_id(&self) -> &VmId {
        &self.vm_id
    }

    /// Current lifecycle state; `Absent` when no record exists.
    pub fn state(&self) -> VmState {
        self.instance()
            .map(VmInstance::state)
            .unwrap_or(VmState::Absent)
    }

    pub fn instance(&self) -> Option<&VmInstance<P>> {
        self.cell().instance.as_ref()
    }

    pub fn instance_mut(&mut self) -> Option<&mut VmInstance<P>> {
        self.cell_mut().instance.as_mut()
    }

    /// Register a record. The identity must currently be absent.
    pub fn insert(&mut self, instance: VmInstance<P>) {
        debug_assert!(self.cell().instance.is_none());
        self.cell_mut().instance = Some(instance);
    }

    /// Remove and return the record.
    pub fn take(&mut self) -> Option<VmInstance<P>> {
        self.cell_mut().instance.take()
    }
}

impl<P> Drop for VmGuard<P> {
    fn drop(&mut self) {
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        if guard.instance.is_none() {
            guard.retired = true;
            self.cells
                .remove_if(&self.vm_id, |_, cell| Arc::ptr_eq(cell, &self.cell));
        }
        drop(guard);
    }
}

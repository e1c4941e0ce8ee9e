// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Lifecycle orchestrator.
//!
//! Drives a [`Hypervisor`] through start, pause, checkpoint, offload, restore,
//! resume and stop for many VMs at once. Each operation holds only its own
//! identity's registry lock, validates the transition, performs every
//! blocking call under the caller's [`OpContext`] and commits the record
//! change once nothing can fail any more. Resources acquired along the way
//! are RAII guards, so an error or a dropped future rolls them back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::OrchestratorConfig;
use crate::context::OpContext;
use crate::error::{OrchResult, OrchestratorError, StateTransitionError};
use crate::hypervisor::{Endpoint, Hypervisor, LaunchSpec};
use crate::image::{DirectorySource, ImageCache, ImageSource, ResolvedImage};
use crate::metrics::{OPERATION_DURATION, OPERATION_ERRORS};
use crate::network::NetworkPool;
use crate::registry::{BootOrigin, LivePhase, Residency, VmInfo, VmInstance, VmRegistry};
use crate::snapshot::{PublishSpec, SnapshotMetadata, SnapshotStore};
use crate::state::{Operation, VmState};
use crate::types::{ImageRef, MemorySize, Revision, SnapshotKey, VcpuCount, VmId};

/// Budget for the best-effort call that undoes a timed-out pause or resume.
const COMPENSATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters for a cold start.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub vm_id: VmId,
    pub image: ImageRef,
    pub revision: Revision,
    pub memory: MemorySize,
    pub vcpus: VcpuCount,
    /// Default sparse flag for this VM's checkpoints.
    pub sparse: bool,
}

impl VmSpec {
    pub fn new(vm_id: VmId, image: ImageRef, memory: MemorySize, vcpus: VcpuCount) -> Self {
        Self {
            vm_id,
            image,
            revision: Revision::initial(),
            memory,
            vcpus,
            sparse: false,
        }
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }
}

/// Where and how a checkpoint is written. Unset fields fall back to the
/// VM's identity and its sparse preference.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSpec {
    pub key: Option<SnapshotKey>,
    pub sparse: Option<bool>,
}

impl SnapshotSpec {
    pub fn key(key: SnapshotKey) -> Self {
        Self {
            key: Some(key),
            sparse: None,
        }
    }

    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = Some(sparse);
        self
    }
}

/// Result of a successful start.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StartReport {
    pub endpoint: Endpoint,
    pub boot_latency: Duration,
}

/// Network pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub available: usize,
}

/// Coordinates VM lifecycles over one hypervisor, network pool, image cache
/// and snapshot store.
pub struct Orchestrator<H: Hypervisor> {
    config: OrchestratorConfig,
    hypervisor: H,
    pool: NetworkPool,
    images: ImageCache,
    store: SnapshotStore,
    registry: VmRegistry<H::Process>,
    created_snapshots: DashMap<SnapshotKey, ()>,
}

impl<H: Hypervisor> Orchestrator<H> {
    /// Build an orchestrator reading images from `source`.
    pub fn new(
        config: OrchestratorConfig,
        hypervisor: H,
        source: Arc<dyn ImageSource>,
    ) -> OrchResult<Self> {
        let pool = NetworkPool::new(&config.namespace, config.pool_size)?;
        let images = ImageCache::new(source, config.image_cache_dir.clone());
        let store = SnapshotStore::open(config.snapshot_root.clone())?;

        tracing::info!(
            hypervisor = hypervisor.name(),
            namespace = %config.namespace,
            storage_driver = %config.storage_driver,
            pool_size = config.pool_size,
            restore_strategy = %config.restore_strategy(),
            full_local = config.flags.full_local,
            test_mode = config.flags.test_mode,
            "Orchestrator initialized"
        );

        Ok(Self {
            config,
            hypervisor,
            pool,
            images,
            store,
            registry: VmRegistry::new(),
            created_snapshots: DashMap::new(),
        })
    }

    /// Build an orchestrator reading images from the configured image
    /// source directory.
    pub fn with_directory_source(config: OrchestratorConfig, hypervisor: H) -> OrchResult<Self> {
        let source = Arc::new(DirectorySource::new(config.image_source_dir.clone()));
        Self::new(config, hypervisor, source)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    /// A context bounded by the configured default operation timeout.
    pub fn context(&self) -> OpContext {
        OpContext::with_timeout(self.config.operation_timeout)
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Cold-boot a VM. The identity must be unused.
    pub async fn start(&self, ctx: &OpContext, spec: VmSpec) -> OrchResult<StartReport> {
        let started = Instant::now();
        let vm_id = spec.vm_id.clone();
        let result = self.start_inner(ctx, spec).await;
        observe(Operation::Start, &vm_id, started, &result);
        result
    }

    async fn start_inner(&self, ctx: &OpContext, spec: VmSpec) -> OrchResult<StartReport> {
        let started = Instant::now();
        let mut guard = self.registry.lock(&spec.vm_id).await;
        guard.state().transition(&spec.vm_id, Operation::Start)?;

        let image = ctx
            .run("resolve image", self.images.resolve(&spec.image))
            .await?;
        let lease = self.pool.try_acquire()?;

        let work_dir = self.config.vm_work_dir(&spec.vm_id);
        let scratch = ScratchDir::fresh(&work_dir).await?;

        let launch = LaunchSpec {
            vm_id: spec.vm_id.clone(),
            image: spec.image.clone(),
            rootfs: image.rootfs.clone(),
            memory: spec.memory,
            vcpus: spec.vcpus,
            network: lease.slot().clone(),
            work_dir,
        };
        let process = ctx.run("create", self.hypervisor.create(&launch)).await?;

        let endpoint = Endpoint::for_slot(lease.slot());
        scratch.keep();
        guard.insert(VmInstance::new(
            spec.vm_id.clone(),
            spec.image.clone(),
            spec.revision.clone(),
            spec.memory,
            spec.vcpus,
            spec.sparse,
            BootOrigin::Cold,
            Residency::Live {
                process,
                lease,
                phase: LivePhase::Running,
            },
            Operation::Start,
        ));

        let boot_latency = started.elapsed();
        tracing::info!(
            vm_id = %spec.vm_id,
            image = %spec.image,
            revision = %spec.revision,
            endpoint = %endpoint,
            elapsed_ms = boot_latency.as_millis() as u64,
            "VM started"
        );

        Ok(StartReport {
            endpoint,
            boot_latency,
        })
    }

    /// Freeze a running VM.
    pub async fn pause(&self, ctx: &OpContext, vm_id: &VmId) -> OrchResult<()> {
        let started = Instant::now();
        let result = self.pause_inner(ctx, vm_id).await;
        observe(Operation::Pause, vm_id, started, &result);
        result
    }

    async fn pause_inner(&self, ctx: &OpContext, vm_id: &VmId) -> OrchResult<()> {
        let mut guard = self.registry.lock(vm_id).await;
        let instance = guard
            .instance_mut()
            .ok_or_else(|| OrchestratorError::VmNotFound(vm_id.clone()))?;
        instance.state().transition(vm_id, Operation::Pause)?;

        let result = {
            let process = live_process(instance, Operation::Pause)?;
            let result = ctx.run("pause", self.hypervisor.pause(process)).await;
            if is_interrupted(&result) {
                let undo = OpContext::with_timeout(COMPENSATION_TIMEOUT);
                if let Err(e) = undo.run("resume", self.hypervisor.resume(process)).await {
                    tracing::warn!(vm_id = %vm_id, error = %e, "Compensating resume failed");
                }
            }
            result
        };
        result?;

        instance.set_phase(LivePhase::Paused, Operation::Pause);
        tracing::info!(
            vm_id = %vm_id,
            image = %instance.image,
            revision = %instance.revision,
            "VM paused"
        );
        Ok(())
    }

    /// Unfreeze a paused or freshly restored VM, returning its endpoint.
    pub async fn resume(&self, ctx: &OpContext, vm_id: &VmId) -> OrchResult<Endpoint> {
        let started = Instant::now();
        let result = self.resume_inner(ctx, vm_id).await;
        observe(Operation::Resume, vm_id, started, &result);
        result
    }

    async fn resume_inner(&self, ctx: &OpContext, vm_id: &VmId) -> OrchResult<Endpoint> {
        let mut guard = self.registry.lock(vm_id).await;
        let instance = guard
            .instance_mut()
            .ok_or_else(|| OrchestratorError::VmNotFound(vm_id.clone()))?;
        let from = instance.state();
        from.transition(vm_id, Operation::Resume)?;

        let result = {
            let process = live_process(instance, Operation::Resume)?;
            let result = ctx.run("resume", self.hypervisor.resume(process)).await;
            if is_interrupted(&result) {
                let undo = OpContext::with_timeout(COMPENSATION_TIMEOUT);
                if let Err(e) = undo.run("pause", self.hypervisor.pause(process)).await {
                    tracing::warn!(vm_id = %vm_id, error = %e, "Compensating pause failed");
                }
            }
            result
        };
        let endpoint = result?;

        instance.set_phase(LivePhase::Running, Operation::Resume);
        tracing::info!(
            vm_id = %vm_id,
            image = %instance.image,
            revision = %instance.revision,
            from = from.name(),
            endpoint = %endpoint,
            "VM resumed"
        );
        Ok(endpoint)
    }

    /// Persist a paused or loaded VM as a snapshot. The VM stays where it is.
    pub async fn checkpoint(
        &self,
        ctx: &OpContext,
        vm_id: &VmId,
        spec: SnapshotSpec,
    ) -> OrchResult<SnapshotMetadata> {
        let started = Instant::now();
        let result = self.checkpoint_inner(ctx, vm_id, spec).await;
        observe(Operation::Checkpoint, vm_id, started, &result);
        result
    }

    async fn checkpoint_inner(
        &self,
        ctx: &OpContext,
        vm_id: &VmId,
        spec: SnapshotSpec,
    ) -> OrchResult<SnapshotMetadata> {
        let mut guard = self.registry.lock(vm_id).await;
        let instance = guard
            .instance()
            .ok_or_else(|| OrchestratorError::VmNotFound(vm_id.clone()))?;
        instance.state().transition(vm_id, Operation::Checkpoint)?;

        let key = spec.key.unwrap_or_else(|| SnapshotKey::for_vm(vm_id));
        let sparse = !self.config.materialize_snapshots() && spec.sparse.unwrap_or(instance.sparse);

        let image = ctx
            .run("resolve image", self.images.resolve(&instance.image))
            .await?;
        let staged = self.store.stage(&key).await?;

        let process = live_process(instance, Operation::Checkpoint)?;
        ctx.run(
            "checkpoint",
            self.hypervisor.checkpoint(process, &staged.target()),
        )
        .await?;

        let metadata = self
            .store
            .publish(
                staged,
                PublishSpec {
                    image: &image,
                    revision: &instance.revision,
                    memory: instance.memory,
                    vcpus: instance.vcpus,
                    sparse,
                    storage_driver: self.config.storage_driver,
                },
                ctx,
            )
            .await?;
        self.created_snapshots.insert(key.clone(), ());

        tracing::info!(
            vm_id = %vm_id,
            image = %instance.image,
            revision = %instance.revision,
            key = %key,
            sparse,
            "VM checkpointed"
        );

        if let Some(instance) = guard.instance_mut() {
            instance.snapshot = Some(key);
        }
        Ok(metadata)
    }

    /// Reconstruct a VM from snapshot `key` under `vm_id`, leaving it Loaded.
    /// The identity must be unused or offloaded.
    pub async fn restore(
        &self,
        ctx: &OpContext,
        vm_id: &VmId,
        key: &SnapshotKey,
    ) -> OrchResult<Duration> {
        let started = Instant::now();
        let result = self.restore_inner(ctx, vm_id, key).await;
        observe(Operation::Restore, vm_id, started, &result);
        result
    }

    async fn restore_inner(
        &self,
        ctx: &OpContext,
        vm_id: &VmId,
        key: &SnapshotKey,
    ) -> OrchResult<Duration> {
        let started = Instant::now();
        let mut guard = self.registry.lock(vm_id).await;
        let from = guard.state();
        from.transition(vm_id, Operation::Restore)?;

        let snapshot = ctx
            .run("open snapshot", self.store.open_snapshot(key))
            .await?;
        let metadata = snapshot.metadata.clone();
        let image = ctx
            .run("resolve image", self.images.resolve(&metadata.image))
            .await?;
        let lease = self.pool.try_acquire()?;

        let work_dir = self.config.vm_work_dir(vm_id);
        let scratch = ScratchDir::fresh(&work_dir).await?;
        let strategy = self.config.restore_strategy();
        let source = self
            .store
            .materialize(&snapshot, &image, strategy, &work_dir, ctx)
            .await?;

        let launch = LaunchSpec {
            vm_id: vm_id.clone(),
            image: metadata.image.clone(),
            rootfs: image.rootfs.clone(),
            memory: metadata.memory,
            vcpus: metadata.vcpus,
            network: lease.slot().clone(),
            work_dir,
        };
        let process = ctx
            .run("restore", self.hypervisor.restore(&source, &launch))
            .await?;

        scratch.keep();
        let residency = Residency::Live {
            process,
            lease,
            phase: LivePhase::Loaded,
        };
        match guard.instance_mut() {
            Some(instance) => {
                instance.image = metadata.image.clone();
                instance.revision = metadata.revision.clone();
                instance.memory = metadata.memory;
                instance.vcpus = metadata.vcpus;
                instance.origin = BootOrigin::Snapshot(key.clone());
                instance.snapshot = Some(key.clone());
                instance.replace_residency(residency, Operation::Restore);
            }
            None => guard.insert(VmInstance::new(
                vm_id.clone(),
                metadata.image.clone(),
                metadata.revision.clone(),
                metadata.memory,
                metadata.vcpus,
                metadata.sparse,
                BootOrigin::Snapshot(key.clone()),
                residency,
                Operation::Restore,
            )),
        }

        let latency = started.elapsed();
        tracing::info!(
            vm_id = %vm_id,
            image = %metadata.image,
            revision = %metadata.revision,
            key = %key,
            from = from.name(),
            strategy = %strategy,
            elapsed_ms = latency.as_millis() as u64,
            "VM restored"
        );
        Ok(latency)
    }

    /// Release a VM's process and network slot, keeping only its snapshot.
    pub async fn offload(&self, ctx: &OpContext, vm_id: &VmId) -> OrchResult<()> {
        let started = Instant::now();
        let result = self.offload_inner(ctx, vm_id).await;
        observe(Operation::Offload, vm_id, started, &result);
        result
    }

    async fn offload_inner(&self, ctx: &OpContext, vm_id: &VmId) -> OrchResult<()> {
        let mut guard = self.registry.lock(vm_id).await;
        let instance = guard
            .instance_mut()
            .ok_or_else(|| OrchestratorError::VmNotFound(vm_id.clone()))?;
        let from = instance.state();
        from.transition(vm_id, Operation::Offload)?;

        let key = instance
            .snapshot
            .clone()
            .unwrap_or_else(|| SnapshotKey::for_vm(vm_id));
        if !self.store.exists(&key) {
            return Err(StateTransitionError::NoSnapshot {
                vm_id: vm_id.clone(),
            }
            .into());
        }

        instance.snapshot = Some(key.clone());
        let previous = instance.replace_residency(Residency::Offloaded, Operation::Offload);
        if let Residency::Live { process, lease, .. } = previous {
            self.terminate(ctx, vm_id, process).await;
            drop(lease);
        }
        remove_work_dir(&self.config.vm_work_dir(vm_id)).await;

        tracing::info!(
            vm_id = %vm_id,
            image = %instance.image,
            revision = %instance.revision,
            key = %key,
            from = from.name(),
            "VM offloaded"
        );
        Ok(())
    }

    /// Terminate a running or paused VM and deregister it.
    pub async fn stop(&self, ctx: &OpContext, vm_id: &VmId) -> OrchResult<()> {
        let started = Instant::now();
        let result = self.stop_inner(ctx, vm_id).await;
        observe(Operation::Stop, vm_id, started, &result);
        result
    }

    async fn stop_inner(&self, ctx: &OpContext, vm_id: &VmId) -> OrchResult<()> {
        let mut guard = self.registry.lock(vm_id).await;
        let state = guard.state();
        if state == VmState::Absent {
            return Err(OrchestratorError::VmNotFound(vm_id.clone()));
        }
        state.transition(vm_id, Operation::Stop)?;

        let Some(instance) = guard.take() else {
            return Err(OrchestratorError::VmNotFound(vm_id.clone()));
        };
        self.deregister(ctx, instance, Operation::Stop).await;
        Ok(())
    }

    /// Tear down every VM and the network pool.
    ///
    /// Individual VM failures are logged and skipped. Only pool teardown can
    /// fail the call. In test mode, snapshots and images this orchestrator
    /// created are removed as well.
    pub async fn cleanup(&self) -> OrchResult<()> {
        let started = Instant::now();
        let ids = self.registry.ids();
        tracing::info!(vms = ids.len(), "Cleaning up");

        for vm_id in &ids {
            let mut guard = self.registry.lock(vm_id).await;
            let Some(instance) = guard.take() else {
                continue;
            };
            let ctx = self.context();
            self.deregister(&ctx, instance, Operation::Stop).await;
        }

        if self.config.flags.test_mode {
            self.purge_artifacts().await;
        }

        self.pool.teardown()?;

        tracing::info!(
            vms = ids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cleanup complete"
        );
        Ok(())
    }

    /// Resolve an image ahead of the first start that needs it.
    pub async fn get_image(&self, ctx: &OpContext, image: &ImageRef) -> OrchResult<ResolvedImage> {
        ctx.run("resolve image", self.images.resolve(image)).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current lifecycle state of `vm_id`; `Absent` if unknown.
    pub async fn state(&self, vm_id: &VmId) -> VmState {
        self.registry.lock(vm_id).await.state()
    }

    /// Handle-free view of one VM record.
    pub async fn instance_info(&self, vm_id: &VmId) -> OrchResult<VmInfo> {
        self.registry
            .lock(vm_id)
            .await
            .instance()
            .map(VmInstance::info)
            .ok_or_else(|| OrchestratorError::VmNotFound(vm_id.clone()))
    }

    /// Every registered VM, ordered by identity.
    pub async fn list(&self) -> Vec<VmInfo> {
        let mut infos = Vec::new();
        for vm_id in self.registry.ids() {
            if let Some(info) = self.registry.lock(&vm_id).await.instance().map(VmInstance::info) {
                infos.push(info);
            }
        }
        infos
    }

    /// Endpoint of a running VM.
    pub async fn endpoint(&self, vm_id: &VmId) -> OrchResult<Endpoint> {
        let guard = self.registry.lock(vm_id).await;
        let instance = guard
            .instance()
            .ok_or_else(|| OrchestratorError::VmNotFound(vm_id.clone()))?;
        match (instance.state(), instance.endpoint()) {
            (VmState::Running, Some(endpoint)) => Ok(endpoint),
            (state, _) => Err(StateTransitionError::InvalidTransition {
                vm_id: vm_id.clone(),
                from: state.name(),
                operation: "reach",
            }
            .into()),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.pool.capacity(),
            in_use: self.pool.in_use(),
            available: self.pool.available(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Retire a record that has already been removed from the registry,
    /// terminating its process if it has one.
    async fn deregister(&self, ctx: &OpContext, instance: VmInstance<H::Process>, operation: Operation) {
        let vm_id = instance.vm_id.clone();
        let image = instance.image.clone();
        let revision = instance.revision.clone();
        let from = instance.state();

        if let Some((process, lease)) = instance.retire(operation) {
            self.terminate(ctx, &vm_id, process).await;
            drop(lease);
        }
        remove_work_dir(&self.config.vm_work_dir(&vm_id)).await;

        tracing::info!(
            vm_id = %vm_id,
            image = %image,
            revision = %revision,
            from = from.name(),
            "VM stopped"
        );
    }

    /// Stop a process. A failed or interrupted graceful stop still ends the
    /// VM because dropping the handle kills it.
    async fn terminate(&self, ctx: &OpContext, vm_id: &VmId, process: H::Process) {
        if let Err(e) = ctx.run("stop", self.hypervisor.stop(process)).await {
            tracing::warn!(
                vm_id = %vm_id,
                error = %e,
                "Graceful stop failed, process terminated"
            );
        }
    }

    async fn purge_artifacts(&self) {
        let keys: Vec<SnapshotKey> = self
            .created_snapshots
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            match self.store.delete(&key).await {
                Ok(()) => {}
                Err(crate::error::SnapshotError::NotFound { .. }) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to purge snapshot"),
            }
            self.created_snapshots.remove(&key);
        }

        let images = self.images.purge_fetched().await;
        tracing::debug!(images, "Purged test artifacts");
    }
}

impl<H: Hypervisor> std::fmt::Debug for Orchestrator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("hypervisor", &self.hypervisor.name())
            .field("namespace", &self.config.namespace)
            .field("pool", &self.pool)
            .field("vms", &self.registry.len())
            .finish()
    }
}

fn live_process<P>(instance: &VmInstance<P>, operation: Operation) -> OrchResult<&P> {
    instance.process().ok_or_else(|| {
        StateTransitionError::InvalidTransition {
            vm_id: instance.vm_id.clone(),
            from: instance.state().name(),
            operation: operation.name(),
        }
        .into()
    })
}

fn is_interrupted<T>(result: &OrchResult<T>) -> bool {
    matches!(
        result,
        Err(OrchestratorError::Timeout { .. } | OrchestratorError::Cancelled { .. })
    )
}

fn observe<T>(operation: Operation, vm_id: &VmId, started: Instant, result: &OrchResult<T>) {
    let elapsed = started.elapsed().as_secs_f64();
    match result {
        Ok(_) => OPERATION_DURATION
            .with_label_values(&[operation.name(), "ok"])
            .observe(elapsed),
        Err(e) => {
            let kind = e.kind();
            OPERATION_DURATION
                .with_label_values(&[operation.name(), "error"])
                .observe(elapsed);
            OPERATION_ERRORS
                .with_label_values(&[operation.name(), kind.name()])
                .inc();
            tracing::warn!(
                vm_id = %vm_id,
                operation = operation.name(),
                kind = kind.name(),
                error = %e,
                "Operation failed"
            );
        }
    }
}

async fn remove_work_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove work dir"),
    }
}

/// Per-VM work directory removed on drop unless kept.
struct ScratchDir {
    path: PathBuf,
    armed: bool,
}

impl ScratchDir {
    /// Create an empty directory at `path`, discarding stale contents.
    async fn fresh(path: &Path) -> OrchResult<Self> {
        remove_work_dir(path).await;
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|source| OrchestratorError::Io {
                context: "create work dir",
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            armed: true,
        })
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        // Only the rename happens inline; the tree is deleted off the worker.
        let discard = self
            .path
            .with_file_name(format!(".discard-{}", uuid::Uuid::new_v4().simple()));
        let doomed = match std::fs::rename(&self.path, &discard) {
            Ok(()) => discard,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(_) => self.path.clone(),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { remove_work_dir(&doomed).await });
            }
            Err(_) => {
                if let Err(e) = std::fs::remove_dir_all(&doomed) {
                    tracing::warn!(path = %doomed.display(), error = %e, "Failed to remove work dir");
                }
            }
        }
    }
}

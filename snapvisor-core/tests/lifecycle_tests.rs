// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end lifecycle tests for snapvisor.
//!
//! These tests drive the orchestrator against the simulated hypervisor and
//! check the externally visible guarantees: state transitions, resource
//! accounting, snapshot durability and guest state preservation.

use std::sync::Arc;
use std::time::Duration;

use snapvisor_core::config::OrchestratorConfigBuilder;
use snapvisor_core::hypervisor::simulated::SimCall;
use snapvisor_core::{
    ErrorKind, ImageRef, MemorySize, OpContext, Orchestrator, OrchestratorConfig,
    SimulatedHypervisor, SnapshotKey, SnapshotSpec, VcpuCount, VmId, VmSpec, VmState,
};
use tempfile::TempDir;

const IMAGE: &str = "ghcr.io/snapvisor/helloworld:v1";

struct Harness {
    _tmp: TempDir,
    orch: Arc<Orchestrator<SimulatedHypervisor>>,
}

impl Harness {
    fn new(pool_size: usize) -> Self {
        Self::with_config(|b| b.pool_size(pool_size))
    }

    fn with_config(configure: impl FnOnce(OrchestratorConfigBuilder) -> OrchestratorConfigBuilder) -> Self {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let config: OrchestratorConfig = configure(OrchestratorConfig::builder().base_dir(tmp.path()))
            .build()
            .expect("Invalid test config");

        // Non-zero content so sparse disk diffs have something to skip.
        let rootfs: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::create_dir_all(&config.image_source_dir).unwrap();
        std::fs::write(
            config
                .image_source_dir
                .join(ImageRef::new(IMAGE).unwrap().file_name()),
            rootfs,
        )
        .unwrap();

        let orch = Orchestrator::with_directory_source(config, SimulatedHypervisor::new())
            .expect("Failed to build orchestrator");
        Self {
            _tmp: tmp,
            orch: Arc::new(orch),
        }
    }

    fn sim(&self) -> &SimulatedHypervisor {
        self.orch.hypervisor()
    }
}

fn id(name: &str) -> VmId {
    VmId::new(name).unwrap()
}

fn key(name: &str) -> SnapshotKey {
    SnapshotKey::new(name).unwrap()
}

fn spec(name: &str) -> VmSpec {
    VmSpec::new(
        id(name),
        ImageRef::new(IMAGE).unwrap(),
        MemorySize::from_mib(4).unwrap(),
        VcpuCount::new(1).unwrap(),
    )
}

fn ctx() -> OpContext {
    OpContext::with_timeout(Duration::from_secs(10))
}

/// Start `name`, invoke it `invocations` times, pause and checkpoint it.
async fn prepared(h: &Harness, name: &str, invocations: u64, snapshot: SnapshotSpec) -> SnapshotKey {
    let vm = id(name);
    let report = h.orch.start(&ctx(), spec(name)).await.unwrap();
    for _ in 0..invocations {
        h.sim().invoke(&report.endpoint).await.unwrap();
    }
    h.orch.pause(&ctx(), &vm).await.unwrap();
    let metadata = h.orch.checkpoint(&ctx(), &vm, snapshot).await.unwrap();
    metadata.key
}

#[tokio::test]
async fn test_start_stop_leaves_identity_absent() {
    let h = Harness::new(2);
    let vm = id("vm-1");

    h.orch.start(&ctx(), spec("vm-1")).await.unwrap();
    h.orch.stop(&ctx(), &vm).await.unwrap();

    assert_eq!(h.orch.state(&vm).await, VmState::Absent);
    assert!(h.orch.list().await.is_empty());
    assert_eq!(h.sim().live_processes(), 0);

    // The identity is reusable.
    h.orch.start(&ctx(), spec("vm-1")).await.unwrap();
    assert_eq!(h.orch.state(&vm).await, VmState::Running);
}

#[tokio::test]
async fn test_illegal_transitions_leave_state_unchanged() {
    let h = Harness::new(2);
    let vm = id("vm-1");

    h.orch.start(&ctx(), spec("vm-1")).await.unwrap();
    h.orch.pause(&ctx(), &vm).await.unwrap();

    let err = h.orch.pause(&ctx(), &vm).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(h.orch.state(&vm).await, VmState::Paused);

    h.orch.resume(&ctx(), &vm).await.unwrap();
    let err = h.orch.resume(&ctx(), &vm).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = h
        .orch
        .checkpoint(&ctx(), &vm, SnapshotSpec::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = h.orch.start(&ctx(), spec("vm-1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(h.orch.state(&vm).await, VmState::Running);
    assert_eq!(h.orch.instance_info(&vm).await.unwrap().transitions, 3);
}

#[tokio::test]
async fn test_offloaded_cannot_pause_or_stop() {
    let h = Harness::new(1);
    let vm = id("vm-1");
    prepared(&h, "vm-1", 0, SnapshotSpec::default()).await;
    h.orch.offload(&ctx(), &vm).await.unwrap();

    for err in [
        h.orch.pause(&ctx(), &vm).await.unwrap_err(),
        h.orch.stop(&ctx(), &vm).await.unwrap_err(),
        h.orch.resume(&ctx(), &vm).await.unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
    assert_eq!(h.orch.state(&vm).await, VmState::Offloaded);
    assert_eq!(h.orch.pool_stats().in_use, 0);
}

#[tokio::test]
async fn test_offload_requires_paused_vm() {
    let h = Harness::new(1);
    let vm = id("vm-1");
    let snapshot = prepared(&h, "vm-1", 1, SnapshotSpec::default()).await;
    h.orch.resume(&ctx(), &vm).await.unwrap();

    let err = h.orch.offload(&ctx(), &vm).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(h.orch.state(&vm).await, VmState::Running);
    assert_eq!(h.orch.pool_stats().in_use, 1);
    assert_eq!(h.sim().live_processes(), 1);
    assert!(h.orch.store().exists(&snapshot));

    h.orch.pause(&ctx(), &vm).await.unwrap();
    h.orch.offload(&ctx(), &vm).await.unwrap();
    assert_eq!(h.orch.state(&vm).await, VmState::Offloaded);
}

#[tokio::test]
async fn test_restore_into_new_identity_preserves_guest_state() {
    let h = Harness::new(2);
    let snapshot = prepared(&h, "vm-a", 2, SnapshotSpec::key(key("hello-snap"))).await;

    let clone = id("vm-b");
    h.orch.restore(&ctx(), &clone, &snapshot).await.unwrap();
    assert_eq!(h.orch.state(&clone).await, VmState::Loaded);

    let info = h.orch.instance_info(&clone).await.unwrap();
    assert_eq!(info.snapshot, Some(snapshot.clone()));
    assert_eq!(info.memory_mib, 4);

    let endpoint = h.orch.resume(&ctx(), &clone).await.unwrap();
    assert_eq!(h.sim().invoke(&endpoint).await.unwrap(), 3);

    // The original keeps its own state.
    let original = h.orch.resume(&ctx(), &id("vm-a")).await.unwrap();
    assert_ne!(original, endpoint);
    assert_eq!(h.sim().invoke(&original).await.unwrap(), 3);
    assert_eq!(h.sim().invoke(&original).await.unwrap(), 4);
}

#[tokio::test]
async fn test_restore_onto_live_identity_fails() {
    let h = Harness::new(2);
    let snapshot = prepared(&h, "vm-1", 0, SnapshotSpec::default()).await;

    let err = h
        .orch
        .restore(&ctx(), &id("vm-1"), &snapshot)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(h.orch.state(&id("vm-1")).await, VmState::Paused);
    assert_eq!(h.orch.pool_stats().in_use, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_capacity_one_admission() {
    let h = Harness::new(1);

    let tasks: Vec<_> = ["vm-1", "vm-2"]
        .into_iter()
        .map(|name| {
            let orch = Arc::clone(&h.orch);
            tokio::spawn(async move { (name, orch.start(&ctx(), spec(name)).await) })
        })
        .collect();

    let mut admitted = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            (name, Ok(_)) => admitted.push(name),
            (name, Err(e)) => {
                assert_eq!(e.kind(), ErrorKind::ResourceExhausted);
                assert_eq!(h.orch.state(&id(name)).await, VmState::Absent);
            }
        }
    }
    assert_eq!(admitted.len(), 1);
    assert_eq!(h.orch.list().await.len(), 1);
    assert_eq!(h.orch.pool_stats().in_use, 1);
    assert_eq!(h.sim().live_processes(), 1);

    // The slot frees up once the winner stops.
    let winner = admitted[0];
    let other = if winner == "vm-1" { "vm-2" } else { "vm-1" };
    h.orch.stop(&ctx(), &id(winner)).await.unwrap();
    h.orch.start(&ctx(), spec(other)).await.unwrap();
    assert_eq!(h.orch.pool_stats().in_use, 1);
}

#[tokio::test]
async fn test_restore_exhausted_pool_registers_nothing() {
    let h = Harness::new(1);
    let snapshot = prepared(&h, "vm-1", 0, SnapshotSpec::default()).await;

    let err = h
        .orch
        .restore(&ctx(), &id("vm-2"), &snapshot)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(h.orch.state(&id("vm-2")).await, VmState::Absent);
    assert!(!h.orch.config().vm_work_dir(&id("vm-2")).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_offload_restore_resume() {
    const VMS: usize = 10;
    let h = Harness::new(VMS);

    for i in 0..VMS {
        prepared(&h, &format!("vm-{}", i), i as u64, SnapshotSpec::default()).await;
    }
    assert_eq!(h.orch.pool_stats().available, 0);

    let tasks: Vec<_> = (0..VMS)
        .map(|i| {
            let orch = Arc::clone(&h.orch);
            tokio::spawn(async move {
                let vm = id(&format!("vm-{}", i));
                orch.offload(&ctx(), &vm).await?;
                orch.restore(&ctx(), &vm, &SnapshotKey::for_vm(&vm)).await?;
                orch.resume(&ctx(), &vm).await
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        let endpoint = task.await.unwrap().unwrap();
        assert_eq!(h.sim().invoke(&endpoint).await.unwrap(), i as u64 + 1);
    }

    let infos = h.orch.list().await;
    assert_eq!(infos.len(), VMS);
    assert!(infos.iter().all(|info| info.state == VmState::Running));
    assert_eq!(h.orch.pool_stats().in_use, VMS);
    assert_eq!(h.sim().live_processes(), VMS);

    // Every VM got a distinct slot.
    let mut slots: Vec<usize> = infos
        .iter()
        .map(|info| info.network.as_ref().unwrap().index)
        .collect();
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), VMS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_same_identity() {
    let h = Harness::new(4);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let orch = Arc::clone(&h.orch);
            tokio::spawn(async move { orch.start(&ctx(), spec("vm-x")).await })
        })
        .collect();

    let mut ok = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidState),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(h.orch.pool_stats().in_use, 1);
    assert_eq!(h.sim().live_processes(), 1);
}

#[tokio::test]
async fn test_repeated_restore_cycles_are_identical() {
    let h = Harness::new(1);
    let vm = id("vm-1");
    let snapshot = prepared(&h, "vm-1", 5, SnapshotSpec::default()).await;
    h.orch.offload(&ctx(), &vm).await.unwrap();

    let mut observed = Vec::new();
    for _ in 0..2 {
        h.orch.restore(&ctx(), &vm, &snapshot).await.unwrap();
        let endpoint = h.orch.resume(&ctx(), &vm).await.unwrap();
        observed.push(h.sim().invoke(&endpoint).await.unwrap());
        h.orch.pause(&ctx(), &vm).await.unwrap();
        h.orch.offload(&ctx(), &vm).await.unwrap();
    }

    assert_eq!(observed, vec![6, 6]);
    assert_eq!(h.orch.state(&vm).await, VmState::Offloaded);
    assert_eq!(h.sim().live_processes(), 0);
}

#[tokio::test]
async fn test_cleanup_leaves_nothing_live() {
    let h = Harness::new(4);

    h.orch.start(&ctx(), spec("running")).await.unwrap();

    h.orch.start(&ctx(), spec("paused")).await.unwrap();
    h.orch.pause(&ctx(), &id("paused")).await.unwrap();

    let snapshot = prepared(&h, "offloaded", 1, SnapshotSpec::default()).await;
    h.orch.offload(&ctx(), &id("offloaded")).await.unwrap();

    h.orch.restore(&ctx(), &id("loaded"), &snapshot).await.unwrap();
    assert_eq!(h.orch.list().await.len(), 4);

    h.orch.cleanup().await.unwrap();

    for name in ["running", "paused", "offloaded", "loaded"] {
        assert_eq!(h.orch.state(&id(name)).await, VmState::Absent);
    }
    assert!(h.orch.list().await.is_empty());
    assert_eq!(h.sim().live_processes(), 0);

    // Snapshots outlive cleanup outside test mode.
    assert!(h.orch.store().exists(&snapshot));

    let err = h.orch.start(&ctx(), spec("late")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}

#[tokio::test]
async fn test_cleanup_survives_failing_stop() {
    let h = Harness::new(2);
    h.orch.start(&ctx(), spec("vm-1")).await.unwrap();
    h.orch.start(&ctx(), spec("vm-2")).await.unwrap();

    h.sim().fail_next(SimCall::Stop, 1);
    h.orch.cleanup().await.unwrap();

    assert!(h.orch.list().await.is_empty());
    assert_eq!(h.sim().live_processes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_checkpoint_leaves_no_snapshot() {
    let h = Harness::new(1);
    let vm = id("vm-1");
    h.orch.start(&ctx(), spec("vm-1")).await.unwrap();
    h.orch.pause(&ctx(), &vm).await.unwrap();

    h.sim()
        .set_latency(SimCall::Checkpoint, Duration::from_millis(500));
    let (cancel_ctx, handle) = ctx().cancellable();
    let task = {
        let orch = Arc::clone(&h.orch);
        let vm = vm.clone();
        tokio::spawn(async move {
            orch.checkpoint(&cancel_ctx, &vm, SnapshotSpec::default())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let snapshot = SnapshotKey::for_vm(&vm);
    assert!(!h.orch.store().exists(&snapshot));
    assert!(!h.orch.store().is_in_flight(&snapshot));
    let staging = h.orch.store().root().join(".staging");
    assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
    assert_eq!(h.orch.state(&vm).await, VmState::Paused);

    // Offload still requires a published snapshot.
    let err = h.orch.offload(&ctx(), &vm).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // A retry succeeds.
    h.sim().set_latency(SimCall::Checkpoint, Duration::ZERO);
    h.orch
        .checkpoint(&ctx(), &vm, SnapshotSpec::default())
        .await
        .unwrap();
    assert!(h.orch.store().exists(&snapshot));
}

#[tokio::test]
async fn test_failed_checkpoint_keeps_vm_paused() {
    let h = Harness::new(1);
    let vm = id("vm-1");
    h.orch.start(&ctx(), spec("vm-1")).await.unwrap();
    h.orch.pause(&ctx(), &vm).await.unwrap();

    h.sim().fail_next(SimCall::Checkpoint, 1);
    let err = h
        .orch
        .checkpoint(&ctx(), &vm, SnapshotSpec::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Hypervisor);
    assert_eq!(h.orch.state(&vm).await, VmState::Paused);
    assert!(!h.orch.store().exists(&SnapshotKey::for_vm(&vm)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_checkpoint_single_flight_per_key() {
    let h = Harness::new(2);
    for name in ["vm-a", "vm-b"] {
        h.orch.start(&ctx(), spec(name)).await.unwrap();
        h.orch.pause(&ctx(), &id(name)).await.unwrap();
    }

    h.sim()
        .set_latency(SimCall::Checkpoint, Duration::from_millis(200));
    let tasks: Vec<_> = ["vm-a", "vm-b"]
        .into_iter()
        .map(|name| {
            let orch = Arc::clone(&h.orch);
            tokio::spawn(async move {
                orch.checkpoint(&ctx(), &id(name), SnapshotSpec::key(key("shared")))
                    .await
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let err = outcomes.into_iter().find_map(Result::err).unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(h.orch.store().exists(&key("shared")));
}

#[tokio::test]
async fn test_corrupt_snapshot_restore_fails_with_io() {
    let h = Harness::new(2);
    let snapshot = prepared(&h, "vm-1", 1, SnapshotSpec::default()).await;

    // Flip a byte without changing the size.
    let memory = h.orch.store().snapshot_dir(&snapshot).join("memory");
    let mut bytes = std::fs::read(&memory).unwrap();
    bytes[0] ^= 0xff;
    std::fs::write(&memory, bytes).unwrap();

    let clone = id("vm-2");
    let err = h.orch.restore(&ctx(), &clone, &snapshot).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(h.orch.state(&clone).await, VmState::Absent);
    assert_eq!(h.orch.pool_stats().in_use, 1);
    assert_eq!(h.sim().live_processes(), 1);
}

#[tokio::test]
async fn test_restore_with_malformed_metadata_fails_with_io() {
    let h = Harness::new(2);
    let snapshot = prepared(&h, "vm-1", 0, SnapshotSpec::default()).await;
    let info = h.orch.store().snapshot_dir(&snapshot).join("info.json");
    std::fs::write(&info, b"{ not json").unwrap();

    let err = h
        .orch
        .restore(&ctx(), &id("vm-2"), &snapshot)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(h.orch.state(&id("vm-2")).await, VmState::Absent);
}

#[tokio::test]
async fn test_restore_missing_snapshot_not_found() {
    let h = Harness::new(1);
    let err = h
        .orch
        .restore(&ctx(), &id("vm-1"), &key("nothing-here"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.orch.pool_stats().in_use, 0);
}

#[tokio::test]
async fn test_failed_start_releases_slot_and_process() {
    let h = Harness::new(1);
    let vm = id("vm-1");

    h.sim().fail_next(SimCall::Create, 1);
    let err = h.orch.start(&ctx(), spec("vm-1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Hypervisor);

    assert_eq!(h.orch.state(&vm).await, VmState::Absent);
    assert_eq!(h.orch.pool_stats().in_use, 0);
    assert_eq!(h.sim().live_processes(), 0);
    assert!(!h.orch.config().vm_work_dir(&vm).exists());

    h.orch.start(&ctx(), spec("vm-1")).await.unwrap();
}

#[tokio::test]
async fn test_start_with_missing_image_not_found() {
    let h = Harness::new(1);
    let mut missing = spec("vm-1");
    missing.image = ImageRef::new("ghcr.io/snapvisor/absent:v1").unwrap();

    let err = h.orch.start(&ctx(), missing).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.orch.pool_stats().in_use, 0);
}

#[tokio::test]
async fn test_sparse_snapshot_smaller_and_equivalent() {
    let h = Harness::new(3);
    let vm = id("vm-1");
    h.orch.start(&ctx(), spec("vm-1")).await.unwrap();
    let endpoint = h.orch.endpoint(&vm).await.unwrap();
    h.sim().invoke(&endpoint).await.unwrap();
    h.orch.pause(&ctx(), &vm).await.unwrap();

    let sparse = h
        .orch
        .checkpoint(&ctx(), &vm, SnapshotSpec::key(key("sparse")).with_sparse(true))
        .await
        .unwrap();
    let dense = h
        .orch
        .checkpoint(&ctx(), &vm, SnapshotSpec::key(key("dense")))
        .await
        .unwrap();
    assert!(sparse.sparse);
    assert!(!dense.sparse);
    assert!(sparse.stored_bytes() < dense.stored_bytes());
    assert_eq!(sparse.memory_len, dense.memory_len);
    assert_eq!(sparse.disk_len, dense.disk_len);

    let mut counts = Vec::new();
    for (name, snapshot) in [("from-sparse", &sparse.key), ("from-dense", &dense.key)] {
        h.orch.stop(&ctx(), &id(name)).await.ok();
        h.orch.restore(&ctx(), &id(name), snapshot).await.unwrap();
        let endpoint = h.orch.resume(&ctx(), &id(name)).await.unwrap();
        counts.push(h.sim().invoke(&endpoint).await.unwrap());
        h.orch.pause(&ctx(), &id(name)).await.unwrap();
    }
    assert_eq!(counts, vec![2, 2]);
}

#[tokio::test]
async fn test_lazy_and_demand_paged_restore() {
    for (lazy, upf) in [(true, false), (false, true)] {
        let h = Harness::with_config(|b| b.pool_size(1).lazy_mode(lazy).upf(upf));
        let vm = id("vm-1");
        let snapshot = prepared(&h, "vm-1", 3, SnapshotSpec::default()).await;
        h.orch.offload(&ctx(), &vm).await.unwrap();

        h.orch.restore(&ctx(), &vm, &snapshot).await.unwrap();
        let endpoint = h.orch.resume(&ctx(), &vm).await.unwrap();
        assert_eq!(h.sim().invoke(&endpoint).await.unwrap(), 4);
    }
}

#[tokio::test]
async fn test_lazy_restore_unaffected_by_republish() {
    for (lazy, upf) in [(true, false), (false, true)] {
        let h = Harness::with_config(|b| b.pool_size(2).lazy_mode(lazy).upf(upf));
        let vm = id("vm-a");
        let shared = prepared(&h, "vm-a", 1, SnapshotSpec::key(key("shared"))).await;
        h.orch.offload(&ctx(), &vm).await.unwrap();
        h.orch.restore(&ctx(), &vm, &shared).await.unwrap();
        let endpoint = h.orch.resume(&ctx(), &vm).await.unwrap();

        // Another VM replaces the snapshot before vm-a touches its memory.
        prepared(&h, "vm-b", 0, SnapshotSpec::key(key("shared"))).await;

        assert_eq!(h.sim().invoke(&endpoint).await.unwrap(), 2);

        // New restores see the replacement.
        h.orch.stop(&ctx(), &id("vm-b")).await.unwrap();
        h.orch.restore(&ctx(), &id("vm-c"), &shared).await.unwrap();
        let endpoint = h.orch.resume(&ctx(), &id("vm-c")).await.unwrap();
        assert_eq!(h.sim().invoke(&endpoint).await.unwrap(), 1);
    }
}

#[tokio::test]
async fn test_timed_out_restore_registers_nothing() {
    let h = Harness::new(2);
    let snapshot = prepared(&h, "vm-1", 0, SnapshotSpec::default()).await;

    h.sim()
        .set_latency(SimCall::Restore, Duration::from_millis(300));
    let short = OpContext::with_timeout(Duration::from_millis(50));
    let err = h
        .orch
        .restore(&short, &id("vm-2"), &snapshot)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(h.orch.state(&id("vm-2")).await, VmState::Absent);
    assert_eq!(h.orch.pool_stats().in_use, 1);
    assert_eq!(h.sim().live_processes(), 1);
}

#[tokio::test]
async fn test_test_mode_cleanup_purges_artifacts() {
    let h = Harness::with_config(|b| b.pool_size(1).test_mode(true));
    let snapshot = prepared(&h, "vm-1", 0, SnapshotSpec::default()).await;
    let image = ImageRef::new(IMAGE).unwrap();
    let cache_entry = h.orch.images().entry_dir(&image);
    assert!(cache_entry.exists());

    h.orch.cleanup().await.unwrap();

    assert!(!h.orch.store().exists(&snapshot));
    assert!(!cache_entry.exists());
    assert!(h.orch.store().list().await.unwrap().is_empty());
}

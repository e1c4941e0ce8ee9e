// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `snapvisor snapload` command - checkpoint/restore load run.
//!
//! Starts one VM, then repeatedly pauses, checkpoints, offloads, restores and
//! resumes it, printing how long every step took.

use std::time::{Duration, Instant};

use clap::Args;
use snapvisor_core::hypervisor::FirecrackerHypervisor;
use snapvisor_core::{
    ConfigLoader, Hypervisor, HypervisorBackend, ImageRef, MemorySize, OpContext, Orchestrator,
    OrchResult, SimulatedHypervisor, SnapshotKey, SnapshotSpec, VcpuCount, VmId, VmSpec,
};

use super::CommandResult;

#[derive(Args, Debug, Clone)]
pub struct Snapload {
    /// VM identity
    #[arg(long)]
    pub vm_id: String,

    /// Function image reference
    #[arg(long)]
    pub image: String,

    /// Guest memory in MiB
    #[arg(long, default_value_t = 256)]
    pub mem: u32,

    /// Guest vCPU count
    #[arg(long, default_value_t = 1)]
    pub vcpus: u8,

    /// Store snapshots sparsely
    #[arg(long)]
    pub sparse: bool,

    /// Number of checkpoint/restore cycles
    #[arg(long, default_value_t = 1)]
    pub cycles: u32,

    /// Print Prometheus metrics when done
    #[arg(long)]
    pub metrics: bool,
}

struct StepTiming {
    cycle: u32,
    step: &'static str,
    elapsed: Duration,
}

pub async fn execute(config_path: &str, args: Snapload) -> CommandResult {
    let config = ConfigLoader::load_file(config_path)?;
    snapvisor_core::metrics::init();

    match config.hypervisor.backend {
        HypervisorBackend::Firecracker => {
            let hypervisor = FirecrackerHypervisor::new(config.hypervisor.firecracker.clone());
            let orch = Orchestrator::with_directory_source(config.orchestrator, hypervisor)?;
            run(orch, args).await
        }
        HypervisorBackend::Simulated => {
            let orch =
                Orchestrator::with_directory_source(config.orchestrator, SimulatedHypervisor::new())?;
            run(orch, args).await
        }
    }
}

async fn run<H: Hypervisor>(orch: Orchestrator<H>, args: Snapload) -> CommandResult {
    let vm_id = VmId::new(args.vm_id.as_str())?;
    let spec = VmSpec::new(
        vm_id.clone(),
        ImageRef::new(args.image.as_str())?,
        MemorySize::from_mib(args.mem)?,
        VcpuCount::new(args.vcpus)?,
    )
    .with_sparse(args.sparse);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              SNAPVISOR SNAPLOAD                              ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!(
        "▶ {} ({}, {} vCPU) via {}, {} cycle(s)",
        vm_id,
        spec.memory,
        spec.vcpus,
        orch.hypervisor().name(),
        args.cycles
    );

    let mut timings = Vec::new();
    let outcome = cycles(&orch, spec, args.cycles, &mut timings).await;

    // Cleanup runs whether or not the cycles succeeded.
    let cleanup = orch.cleanup().await;

    print_timings(&timings);
    if args.metrics {
        println!();
        print!("{}", snapvisor_core::metrics::render());
    }

    outcome?;
    cleanup?;
    println!();
    println!("✓ Snapload complete");
    Ok(())
}

async fn cycles<H: Hypervisor>(
    orch: &Orchestrator<H>,
    spec: VmSpec,
    cycles: u32,
    timings: &mut Vec<StepTiming>,
) -> OrchResult<()> {
    let vm_id = spec.vm_id.clone();
    let key = SnapshotKey::for_vm(&vm_id);
    let full_local = orch.config().materialize_snapshots();

    let started = Instant::now();
    let report = orch.start(&orch.context(), spec).await?;
    timings.push(StepTiming {
        cycle: 0,
        step: "start",
        elapsed: started.elapsed(),
    });
    println!("  ✓ started, endpoint {}", report.endpoint);

    for cycle in 1..=cycles {
        step(timings, cycle, "pause", orch.pause(&orch.context(), &vm_id)).await?;
        step(
            timings,
            cycle,
            "checkpoint",
            orch.checkpoint(&orch.context(), &vm_id, SnapshotSpec::key(key.clone())),
        )
        .await?;

        // Offload needs a paused guest; a full-local run stops from Paused instead.
        if full_local {
            step(timings, cycle, "stop", orch.stop(&orch.context(), &vm_id)).await?;
        } else {
            step(timings, cycle, "offload", orch.offload(&orch.context(), &vm_id)).await?;
        }

        step(
            timings,
            cycle,
            "restore",
            orch.restore(&orch.context(), &vm_id, &key),
        )
        .await?;
        let endpoint = step(timings, cycle, "resume", orch.resume(&orch.context(), &vm_id)).await?;
        println!("  ✓ cycle {} complete, endpoint {}", cycle, endpoint);
    }

    step(timings, cycles, "stop", orch.stop(&orch.context(), &vm_id)).await?;
    Ok(())
}

async fn step<T>(
    timings: &mut Vec<StepTiming>,
    cycle: u32,
    name: &'static str,
    fut: impl std::future::Future<Output = OrchResult<T>>,
) -> OrchResult<T> {
    let started = Instant::now();
    let result = fut.await;
    timings.push(StepTiming {
        cycle,
        step: name,
        elapsed: started.elapsed(),
    });
    if let Err(e) = &result {
        eprintln!("  ✗ cycle {} {} failed: {}", cycle, name, e);
    }
    result
}

fn print_timings(timings: &[StepTiming]) {
    if timings.is_empty() {
        return;
    }

    println!();
    println!("┌───────┬──────────────┬──────────────┐");
    println!("│ Cycle │ Step         │ Time (ms)    │");
    println!("├───────┼──────────────┼──────────────┤");
    for timing in timings {
        println!(
            "│ {:>5} │ {:<12} │ {:>12.3} │",
            timing.cycle,
            timing.step,
            timing.elapsed.as_secs_f64() * 1000.0
        );
    }
    println!("└───────┴──────────────┴──────────────┘");
}

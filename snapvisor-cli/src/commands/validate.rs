// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `snapvisor validate` command - Validate configuration file.

use snapvisor_core::{ConfigLoader, HypervisorBackend};

use super::CommandResult;

pub async fn execute(file: &str) -> CommandResult {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            let orch = &config.orchestrator;
            println!("✓ Configuration is valid");
            println!();
            println!("Orchestrator Settings:");
            println!("  Namespace:          {}", orch.namespace);
            println!("  Storage Driver:     {}", orch.storage_driver);
            println!("  Pool Size:          {}", orch.pool_size);
            println!(
                "  Operation Timeout:  {}ms",
                orch.operation_timeout.as_millis()
            );
            println!("  Restore Strategy:   {}", orch.restore_strategy());
            println!("  Full Local:         {}", orch.flags.full_local);
            println!("  Test Mode:          {}", orch.flags.test_mode);
            println!();
            println!("Paths:");
            println!("  Snapshots:          {}", orch.snapshot_root.display());
            println!("  Image Source:       {}", orch.image_source_dir.display());
            println!("  Image Cache:        {}", orch.image_cache_dir.display());
            println!("  Run Directory:      {}", orch.run_dir.display());
            println!();
            match config.hypervisor.backend {
                HypervisorBackend::Firecracker => {
                    let fc = &config.hypervisor.firecracker;
                    println!("Hypervisor: firecracker");
                    println!("  Binary:             {}", fc.binary.display());
                    println!("  Kernel:             {}", fc.kernel_image.display());
                }
                HypervisorBackend::Simulated => println!("Hypervisor: simulated"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

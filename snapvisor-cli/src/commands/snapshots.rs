// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `snapvisor snapshots` commands - inspect and delete published snapshots.

use snapvisor_core::{ConfigLoader, SnapshotKey, SnapshotStore};

use super::CommandResult;

fn open_store(config_path: &str) -> CommandResult<SnapshotStore> {
    let config = ConfigLoader::load_file(config_path)?;
    Ok(SnapshotStore::open(config.orchestrator.snapshot_root)?)
}

pub async fn list(config_path: &str, json: bool) -> CommandResult {
    let store = open_store(config_path)?;
    let snapshots = store.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("No snapshots in {}.", store.root().display());
        return Ok(());
    }

    println!("╔════════════════════════╦════════════════════════════════╦════════════╦════════╦══════════════╗");
    println!("║ Key                    ║ Image                          ║ Revision   ║ Sparse ║ Stored (KiB) ║");
    println!("╠════════════════════════╬════════════════════════════════╬════════════╬════════╬══════════════╣");

    for snapshot in &snapshots {
        println!(
            "║ {:<22} ║ {:<30} ║ {:<10} ║ {:<6} ║ {:>12} ║",
            snapshot.key.as_str(),
            snapshot.image.as_str(),
            snapshot.revision.as_str(),
            if snapshot.sparse { "yes" } else { "no" },
            snapshot.stored_bytes() / 1024
        );
    }

    println!("╚════════════════════════╩════════════════════════════════╩════════════╩════════╩══════════════╝");
    println!();
    println!("Total: {} snapshot(s)", snapshots.len());

    Ok(())
}

pub async fn delete(config_path: &str, key: &str) -> CommandResult {
    let key = SnapshotKey::new(key)?;
    let store = open_store(config_path)?;
    store
        .delete(&key)
        .await
        .map_err(snapvisor_core::OrchestratorError::from)?;
    println!("✓ Deleted snapshot {}", key);
    Ok(())
}

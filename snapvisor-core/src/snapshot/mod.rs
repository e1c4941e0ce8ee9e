// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Durable snapshot storage.
//!
//! One directory per snapshot key under the store root:
//!
//! ```text
//! <root>/<key>/vm.state
//! <root>/<key>/memory | memory.sparse
//! <root>/<key>/disk   | disk.sparse
//! <root>/<key>/info.json          (written last)
//! <root>/.staging/<key>-<nonce>/  (checkpoint in progress)
//! ```
//!
//! A snapshot becomes visible only when its staging directory is renamed into
//! place, so a reader either sees a complete snapshot or none at all.

mod sparse;
mod store;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::config::StorageDriver;
use crate::types::{ImageRef, MemorySize, Revision, SnapshotKey, VcpuCount};

pub use sparse::{Base as SparseBase, EncodeStats, BLOCK_SIZE};
pub use store::{PublishSpec, SnapshotStore, StagedSnapshot};

/// Current `info.json` format.
pub const FORMAT_VERSION: u32 = 1;

pub const STATE_FILE: &str = "vm.state";
pub const MEMORY_FILE: &str = "memory";
pub const MEMORY_SPARSE_FILE: &str = "memory.sparse";
pub const DISK_FILE: &str = "disk";
pub const DISK_SPARSE_FILE: &str = "disk.sparse";
pub const INFO_FILE: &str = "info.json";

/// Size and checksum of one snapshot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub size: u64,
    pub crc32: u32,
}

/// Contents of `info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub key: SnapshotKey,
    pub image: ImageRef,
    pub image_digest: String,
    pub revision: Revision,
    pub memory: MemorySize,
    pub vcpus: VcpuCount,
    pub sparse: bool,
    pub storage_driver: StorageDriver,
    pub created_at: SystemTime,
    /// Guest memory length once reconstructed.
    pub memory_len: u64,
    /// Disk length once reconstructed.
    pub disk_len: u64,
    pub files: BTreeMap<String, FileRecord>,
}

impl SnapshotMetadata {
    pub fn memory_file(&self) -> &'static str {
        if self.sparse {
            MEMORY_SPARSE_FILE
        } else {
            MEMORY_FILE
        }
    }

    pub fn disk_file(&self) -> &'static str {
        if self.sparse {
            DISK_SPARSE_FILE
        } else {
            DISK_FILE
        }
    }

    /// Total bytes stored on disk, excluding `info.json`.
    pub fn stored_bytes(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }
}

/// A published, validated snapshot ready to be materialized.
#[derive(Debug, Clone)]
pub struct PublishedSnapshot {
    pub key: SnapshotKey,
    pub dir: PathBuf,
    pub metadata: SnapshotMetadata,
}

/// How restore obtains guest memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStrategy {
    /// Verify and load all memory before the VM is handed back.
    #[default]
    Eager,
    /// Validate sizes only; memory pages are read on first access.
    Lazy,
    /// Memory is served to the hypervisor through a userfault handler.
    DemandPaged,
}

impl RestoreStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Eager => "eager",
            Self::Lazy => "lazy",
            Self::DemandPaged => "demand_paged",
        }
    }

    /// Whether memory checksums are verified before the VM is restored.
    pub fn verifies_memory(&self) -> bool {
        matches!(self, Self::Eager)
    }
}

impl std::fmt::Display for RestoreStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

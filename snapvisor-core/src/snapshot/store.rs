// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Staging, atomic publish and restore materialization.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;

use super::sparse::{self, Base};
use super::{
    FileRecord, PublishedSnapshot, RestoreStrategy, SnapshotMetadata, DISK_FILE,
    DISK_SPARSE_FILE, FORMAT_VERSION, INFO_FILE, MEMORY_FILE, MEMORY_SPARSE_FILE, STATE_FILE,
};
use crate::config::StorageDriver;
use crate::context::OpContext;
use crate::error::{OrchResult, OrchestratorError, SnapshotError};
use crate::hypervisor::{CheckpointTarget, MemoryBackend, RestoreSource};
use crate::image::ResolvedImage;
use crate::metrics::SNAPSHOT_BYTES_WRITTEN;
use crate::types::{MemorySize, Revision, SnapshotKey, VcpuCount};

const STAGING_DIR: &str = ".staging";
const TRASH_DIR: &str = ".trash";
const PINNED_DIR: &str = "snapshot";

/// Describes the snapshot being published.
#[derive(Debug, Clone)]
pub struct PublishSpec<'a> {
    pub image: &'a ResolvedImage,
    pub revision: &'a Revision,
    pub memory: MemorySize,
    pub vcpus: VcpuCount,
    pub sparse: bool,
    pub storage_driver: StorageDriver,
}

/// Directory-per-key snapshot store.
#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    in_flight: Arc<DashMap<SnapshotKey, ()>>,
}

/// A checkpoint being written. Dropping it discards everything written so far.
#[derive(Debug)]
pub struct StagedSnapshot {
    key: SnapshotKey,
    dir: PathBuf,
    in_flight: Arc<DashMap<SnapshotKey, ()>>,
    published: bool,
}

impl StagedSnapshot {
    pub fn key(&self) -> &SnapshotKey {
        &self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the hypervisor writes the raw checkpoint.
    pub fn target(&self) -> CheckpointTarget {
        CheckpointTarget {
            state_path: self.dir.join(STATE_FILE),
            memory_path: self.dir.join(MEMORY_FILE),
            disk_path: self.dir.join(DISK_FILE),
        }
    }
}

impl Drop for StagedSnapshot {
    fn drop(&mut self) {
        if !self.published {
            if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        key = %self.key,
                        path = %self.dir.display(),
                        error = %e,
                        "Failed to discard staged snapshot"
                    );
                }
            } else {
                tracing::debug!(key = %self.key, "Staged snapshot discarded");
            }
        }
        self.in_flight.remove(&self.key);
    }
}

impl SnapshotStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Staging directories left behind by an interrupted process are purged.
    pub fn open(root: impl Into<PathBuf>) -> OrchResult<Self> {
        let root = root.into();
        let io_err =
            |context: &'static str| move |source: io::Error| OrchestratorError::Io { context, source };

        std::fs::create_dir_all(&root).map_err(io_err("create snapshot root"))?;

        let mut purged = 0;
        for name in [STAGING_DIR, TRASH_DIR] {
            let dir = root.join(name);
            if dir.exists() {
                for entry in std::fs::read_dir(&dir).map_err(io_err("read staging dir"))? {
                    let entry = entry.map_err(io_err("read staging dir"))?;
                    std::fs::remove_dir_all(entry.path())
                        .map_err(io_err("purge staging dir"))?;
                    purged += 1;
                }
            }
            std::fs::create_dir_all(&dir).map_err(io_err("create staging dir"))?;
        }

        tracing::info!(
            root = %root.display(),
            purged_staging = purged,
            "Snapshot store opened"
        );

        Ok(Self {
            root,
            in_flight: Arc::new(DashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Published location of `key`.
    pub fn snapshot_dir(&self, key: &SnapshotKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Whether a published snapshot exists for `key`.
    pub fn exists(&self, key: &SnapshotKey) -> bool {
        self.snapshot_dir(key).join(INFO_FILE).is_file()
    }

    /// Whether a checkpoint is currently being written for `key`.
    pub fn is_in_flight(&self, key: &SnapshotKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Reserve `key` and create a fresh staging directory for it.
    pub async fn stage(&self, key: &SnapshotKey) -> Result<StagedSnapshot, SnapshotError> {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => return Err(SnapshotError::InFlight { key: key.clone() }),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let dir = self
            .root
            .join(STAGING_DIR)
            .join(format!("{}-{}", key, uuid::Uuid::new_v4().simple()));

        // Constructed before creating the directory so a failure releases the key.
        let staged = StagedSnapshot {
            key: key.clone(),
            dir,
            in_flight: Arc::clone(&self.in_flight),
            published: false,
        };

        tokio::fs::create_dir_all(&staged.dir)
            .await
            .map_err(|source| SnapshotError::Io {
                key: key.clone(),
                context: "create staging dir",
                source,
            })?;

        Ok(staged)
    }

    /// Seal a staged checkpoint and make it visible under its key.
    ///
    /// Checks `ctx` between steps; once the final rename has happened the
    /// snapshot is published and the call succeeds.
    pub async fn publish(
        &self,
        staged: StagedSnapshot,
        spec: PublishSpec<'_>,
        ctx: &OpContext,
    ) -> OrchResult<SnapshotMetadata> {
        let key = staged.key.clone();
        let target = self.snapshot_dir(&key);
        let trash = self
            .root
            .join(TRASH_DIR)
            .join(format!("{}-{}", key, uuid::Uuid::new_v4().simple()));
        let root = self.root.clone();
        let ctx = ctx.clone();
        let base_rootfs = spec.image.rootfs.clone();

        let mut metadata = SnapshotMetadata {
            format_version: FORMAT_VERSION,
            key: key.clone(),
            image: spec.image.reference.clone(),
            image_digest: spec.image.digest.clone(),
            revision: spec.revision.clone(),
            memory: spec.memory,
            vcpus: spec.vcpus,
            sparse: spec.sparse,
            storage_driver: spec.storage_driver,
            created_at: SystemTime::now(),
            memory_len: 0,
            disk_len: 0,
            files: BTreeMap::new(),
        };

        let started = std::time::Instant::now();
        let metadata = tokio::task::spawn_blocking(move || -> OrchResult<SnapshotMetadata> {
            let mut staged = staged;
            let dir = staged.dir.clone();
            let io = |context: &'static str| {
                let key = key.clone();
                move |source| SnapshotError::Io {
                    key,
                    context,
                    source,
                }
            };

            ctx.check("publish")?;

            let memory_raw = dir.join(MEMORY_FILE);
            let disk_raw = dir.join(DISK_FILE);
            metadata.memory_len = std::fs::metadata(&memory_raw)
                .map_err(io("stat memory file"))?
                .len();
            metadata.disk_len = std::fs::metadata(&disk_raw)
                .map_err(io("stat disk file"))?
                .len();

            if metadata.sparse {
                sparse::encode(&memory_raw, Base::Zeros, &dir.join(MEMORY_SPARSE_FILE))
                    .map_err(io("encode sparse memory"))?;
                std::fs::remove_file(&memory_raw).map_err(io("remove raw memory"))?;
                ctx.check("publish")?;

                sparse::encode(&disk_raw, Base::File(&base_rootfs), &dir.join(DISK_SPARSE_FILE))
                    .map_err(io("encode sparse disk"))?;
                std::fs::remove_file(&disk_raw).map_err(io("remove raw disk"))?;
                ctx.check("publish")?;
            }

            let files = [STATE_FILE, metadata.memory_file(), metadata.disk_file()];
            for name in files {
                let path = dir.join(name);
                let record = checksum_file(&path).map_err(io("checksum snapshot file"))?;
                File::open(&path)
                    .and_then(|f| f.sync_all())
                    .map_err(io("sync snapshot file"))?;
                metadata.files.insert(name.to_string(), record);
            }
            ctx.check("publish")?;

            let info = serde_json::to_vec_pretty(&metadata).map_err(|e| {
                SnapshotError::Io {
                    key: key.clone(),
                    context: "encode info.json",
                    source: io::Error::new(io::ErrorKind::InvalidData, e),
                }
            })?;
            let mut info_file = File::create(dir.join(INFO_FILE)).map_err(io("write info.json"))?;
            info_file.write_all(&info).map_err(io("write info.json"))?;
            info_file.sync_all().map_err(io("sync info.json"))?;
            sync_dir(&dir).map_err(io("sync staging dir"))?;

            // Last point at which the checkpoint can still be abandoned.
            ctx.check("publish")?;

            let replaced = target.exists();
            if replaced {
                std::fs::rename(&target, &trash).map_err(io("retire previous snapshot"))?;
            }
            if let Err(e) = rename_dir(&dir, &target) {
                if replaced {
                    if let Err(restore) = std::fs::rename(&trash, &target) {
                        tracing::error!(
                            key = %key,
                            error = %restore,
                            "Failed to reinstate previous snapshot"
                        );
                    }
                }
                return Err(io("publish snapshot")(e).into());
            }
            staged.published = true;
            sync_dir(&root).map_err(io("sync snapshot root"))?;

            if trash.exists() {
                if let Err(e) = std::fs::remove_dir_all(&trash) {
                    tracing::warn!(key = %key, error = %e, "Failed to remove replaced snapshot");
                }
            }

            Ok(metadata)
        })
        .await
        .map_err(|e| OrchestratorError::Io {
            context: "publish task",
            source: io::Error::other(e),
        })??;

        let stored = metadata.stored_bytes();
        SNAPSHOT_BYTES_WRITTEN.inc_by(stored);

        tracing::info!(
            key = %metadata.key,
            image = %metadata.image,
            revision = %metadata.revision,
            sparse = metadata.sparse,
            stored_bytes = stored,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot published"
        );

        Ok(metadata)
    }

    /// Open a published snapshot, validating metadata and file sizes.
    pub async fn open_snapshot(&self, key: &SnapshotKey) -> Result<PublishedSnapshot, SnapshotError> {
        let dir = self.snapshot_dir(key);
        let task_key = key.clone();

        tokio::task::spawn_blocking(move || read_published(&task_key, dir))
            .await
            .map_err(|e| SnapshotError::Io {
                key: key.clone(),
                context: "open task",
                source: io::Error::other(e),
            })?
    }

    /// Turn a published snapshot into files a hypervisor can restore from.
    ///
    /// Anything the restored VM may write goes into `work_dir`; the published
    /// snapshot is only read.
    pub async fn materialize(
        &self,
        snapshot: &PublishedSnapshot,
        base: &ResolvedImage,
        strategy: RestoreStrategy,
        work_dir: &Path,
        ctx: &OpContext,
    ) -> OrchResult<RestoreSource> {
        let metadata = &snapshot.metadata;
        if metadata.sparse && base.digest != metadata.image_digest {
            return Err(SnapshotError::Incompatible {
                key: snapshot.key.clone(),
                reason: format!(
                    "base image digest {} does not match {}",
                    base.digest, metadata.image_digest
                ),
            }
            .into());
        }

        let snapshot = snapshot.clone();
        let base_rootfs = base.rootfs.clone();
        let work_dir = work_dir.to_path_buf();
        let ctx = ctx.clone();
        let started = std::time::Instant::now();

        let source = tokio::task::spawn_blocking(move || -> OrchResult<RestoreSource> {
            let key = snapshot.key.clone();
            let metadata = &snapshot.metadata;
            let io = |context: &'static str| {
                let key = key.clone();
                move |source| SnapshotError::Io {
                    key,
                    context,
                    source,
                }
            };

            std::fs::create_dir_all(&work_dir).map_err(io("create work dir"))?;
            ctx.check("materialize")?;

            // Everything below reads through links private to this VM, so a
            // later publish to the same key cannot change what it sees.
            let snapshot = pin_snapshot(&snapshot, &work_dir.join(PINNED_DIR))?;
            ctx.check("materialize")?;

            let state_path = snapshot.dir.join(STATE_FILE);
            verify_file(&snapshot, STATE_FILE)?;

            // Disk: always a private writable copy.
            let disk_path = work_dir.join(DISK_FILE);
            let disk_name = metadata.disk_file();
            if metadata.sparse {
                verify_file(&snapshot, disk_name)?;
                ctx.check("materialize")?;
                sparse::decode(&snapshot.dir.join(disk_name), Base::File(&base_rootfs), &disk_path)
                    .map_err(io("reconstruct disk"))?;
            } else {
                let copied = copy_with_checksum(&snapshot.dir.join(disk_name), &disk_path)
                    .map_err(io("copy disk"))?;
                check_record(&snapshot, disk_name, copied)?;
            }
            check_len(&snapshot, &disk_path, metadata.disk_len, "disk")?;
            ctx.check("materialize")?;

            let memory_name = metadata.memory_file();
            let memory_path = if metadata.sparse {
                verify_file(&snapshot, memory_name)?;
                let path = work_dir.join(MEMORY_FILE);
                sparse::decode(&snapshot.dir.join(memory_name), Base::Zeros, &path)
                    .map_err(io("reconstruct memory"))?;
                check_len(&snapshot, &path, metadata.memory_len, "memory")?;
                path
            } else {
                if strategy.verifies_memory() {
                    verify_file(&snapshot, memory_name)?;
                }
                snapshot.dir.join(memory_name)
            };
            ctx.check("materialize")?;

            let memory = match strategy {
                RestoreStrategy::Eager => MemoryBackend::File(memory_path),
                RestoreStrategy::Lazy => MemoryBackend::OnDemand(memory_path),
                RestoreStrategy::DemandPaged => MemoryBackend::Uffd(memory_path),
            };

            Ok(RestoreSource {
                key,
                state_path,
                memory,
                disk_path,
                memory_size: metadata.memory,
                memory_len: metadata.memory_len,
            })
        })
        .await
        .map_err(|e| OrchestratorError::Io {
            context: "materialize task",
            source: io::Error::other(e),
        })??;

        tracing::debug!(
            key = %source.key,
            strategy = %strategy,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot materialized"
        );

        Ok(source)
    }

    /// List every published snapshot. Unreadable entries are skipped.
    pub async fn list(&self) -> OrchResult<Vec<SnapshotMetadata>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|source| OrchestratorError::Io {
                context: "list snapshots",
                source,
            })?;

        let mut snapshots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| OrchestratorError::Io {
                context: "list snapshots",
                source,
            })?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let Ok(key) = SnapshotKey::new(name.as_str()) else {
                continue;
            };
            match self.open_snapshot(&key).await {
                Ok(snapshot) => snapshots.push(snapshot.metadata),
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable snapshot"),
            }
        }

        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(snapshots)
    }

    /// Delete a published snapshot.
    pub async fn delete(&self, key: &SnapshotKey) -> Result<(), SnapshotError> {
        if self.is_in_flight(key) {
            return Err(SnapshotError::InFlight { key: key.clone() });
        }

        let dir = self.snapshot_dir(key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(key = %key, "Snapshot deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SnapshotError::NotFound { key: key.clone() })
            }
            Err(source) => Err(SnapshotError::Io {
                key: key.clone(),
                context: "delete snapshot",
                source,
            }),
        }
    }
}

fn read_published(key: &SnapshotKey, dir: PathBuf) -> Result<PublishedSnapshot, SnapshotError> {
    let corrupt = |reason: String| SnapshotError::Corrupt {
        key: key.clone(),
        reason,
    };

    if !dir.is_dir() {
        return Err(SnapshotError::NotFound { key: key.clone() });
    }

    let info = match std::fs::read(dir.join(INFO_FILE)) {
        Ok(info) => info,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(corrupt("missing info.json".to_string()))
        }
        Err(source) => {
            return Err(SnapshotError::Io {
                key: key.clone(),
                context: "read info.json",
                source,
            })
        }
    };

    let metadata: SnapshotMetadata = serde_json::from_slice(&info)
        .map_err(|e| corrupt(format!("malformed info.json: {}", e)))?;

    if metadata.format_version != FORMAT_VERSION {
        return Err(SnapshotError::Incompatible {
            key: key.clone(),
            reason: format!("unsupported format version {}", metadata.format_version),
        });
    }
    if &metadata.key != key {
        return Err(corrupt(format!("info.json names key {}", metadata.key)));
    }

    for name in [STATE_FILE, metadata.memory_file(), metadata.disk_file()] {
        let record = metadata
            .files
            .get(name)
            .ok_or_else(|| corrupt(format!("no record for {}", name)))?;
        let size = std::fs::metadata(dir.join(name))
            .map_err(|_| corrupt(format!("missing {}", name)))?
            .len();
        if size != record.size {
            return Err(corrupt(format!(
                "{} is {} bytes, expected {}",
                name, size, record.size
            )));
        }
    }

    Ok(PublishedSnapshot {
        key: key.clone(),
        dir,
        metadata,
    })
}

fn checksum_file(path: &Path) -> io::Result<FileRecord> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(FileRecord {
        size,
        crc32: hasher.finalize(),
    })
}

fn copy_with_checksum(src: &Path, dst: &Path) -> io::Result<FileRecord> {
    let mut input = File::open(src)?;
    let mut output = File::create(dst)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n])?;
        size += n as u64;
    }
    output.sync_all()?;
    Ok(FileRecord {
        size,
        crc32: hasher.finalize(),
    })
}

fn verify_file(snapshot: &PublishedSnapshot, name: &str) -> Result<(), SnapshotError> {
    let actual = checksum_file(&snapshot.dir.join(name)).map_err(|source| SnapshotError::Io {
        key: snapshot.key.clone(),
        context: "read snapshot file",
        source,
    })?;
    check_record(snapshot, name, actual)
}

fn check_record(
    snapshot: &PublishedSnapshot,
    name: &str,
    actual: FileRecord,
) -> Result<(), SnapshotError> {
    match snapshot.metadata.files.get(name) {
        Some(expected) if *expected == actual => Ok(()),
        Some(expected) => Err(SnapshotError::Corrupt {
            key: snapshot.key.clone(),
            reason: format!(
                "{} checksum {:08x} ({} bytes), expected {:08x} ({} bytes)",
                name, actual.crc32, actual.size, expected.crc32, expected.size
            ),
        }),
        None => Err(SnapshotError::Corrupt {
            key: snapshot.key.clone(),
            reason: format!("no record for {}", name),
        }),
    }
}

fn check_len(
    snapshot: &PublishedSnapshot,
    path: &Path,
    expected: u64,
    what: &str,
) -> Result<(), SnapshotError> {
    let actual = std::fs::metadata(path)
        .map_err(|source| SnapshotError::Io {
            key: snapshot.key.clone(),
            context: "stat reconstructed file",
            source,
        })?
        .len();
    if actual != expected {
        return Err(SnapshotError::Corrupt {
            key: snapshot.key.clone(),
            reason: format!("reconstructed {} is {} bytes, expected {}", what, actual, expected),
        });
    }
    Ok(())
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(test)]
static FAIL_RENAME_INTO: std::sync::Mutex<Option<PathBuf>> = std::sync::Mutex::new(None);

fn rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    #[cfg(test)]
    {
        let mut fail = FAIL_RENAME_INTO.lock().unwrap_or_else(|e| e.into_inner());
        if fail.as_deref() == Some(to) {
            *fail = None;
            return Err(io::Error::other("rename refused"));
        }
    }
    std::fs::rename(from, to)
}

/// Link the files of a published snapshot into `dir` and return a view of
/// the snapshot that reads from there.
///
/// Published files are never modified in place, so a hard link keeps the
/// exact bytes alive even if the key is republished and the old directory
/// removed. Across filesystems the files are copied and checked instead.
/// Fails if the key was republished before every file was linked.
fn pin_snapshot(snapshot: &PublishedSnapshot, dir: &Path) -> Result<PublishedSnapshot, SnapshotError> {
    let io = |context: &'static str| {
        let key = snapshot.key.clone();
        move |source| SnapshotError::Io {
            key,
            context,
            source,
        }
    };

    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(io("clear pinned snapshot"))?;
    }
    std::fs::create_dir_all(dir).map_err(io("create pinned snapshot"))?;

    let metadata = &snapshot.metadata;
    for name in [STATE_FILE, metadata.memory_file(), metadata.disk_file()] {
        let src = snapshot.dir.join(name);
        let dst = dir.join(name);
        if let Err(e) = std::fs::hard_link(&src, &dst) {
            tracing::debug!(key = %snapshot.key, file = name, error = %e, "Copying snapshot file");
            let copied = copy_with_checksum(&src, &dst).map_err(io("copy snapshot file"))?;
            check_record(snapshot, name, copied)?;
        }
    }

    let current = read_published(&snapshot.key, snapshot.dir.clone())?;
    if current.metadata != snapshot.metadata {
        return Err(SnapshotError::Corrupt {
            key: snapshot.key.clone(),
            reason: "snapshot was replaced during restore".to_string(),
        });
    }

    Ok(PublishedSnapshot {
        key: snapshot.key.clone(),
        dir: dir.to_path_buf(),
        metadata: snapshot.metadata.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageRef;
    use tempfile::TempDir;

    fn image(tmp: &Path) -> ResolvedImage {
        let rootfs = tmp.join("base.ext4");
        std::fs::write(&rootfs, vec![7u8; 8192]).unwrap();
        ResolvedImage {
            reference: ImageRef::new("test/hello:latest").unwrap(),
            digest: "sha256:test".to_string(),
            rootfs,
            size_bytes: 8192,
        }
    }

    fn key(name: &str) -> SnapshotKey {
        SnapshotKey::new(name).unwrap()
    }

    async fn checkpoint(
        store: &SnapshotStore,
        key: &SnapshotKey,
        image: &ResolvedImage,
        fill: u8,
    ) -> OrchResult<SnapshotMetadata> {
        let staged = store.stage(key).await?;
        let target = staged.target();
        std::fs::write(&target.state_path, b"state").unwrap();
        std::fs::write(&target.memory_path, vec![fill; 4096]).unwrap();
        std::fs::write(&target.disk_path, vec![7u8; 8192]).unwrap();

        let revision = Revision::initial();
        let spec = PublishSpec {
            image,
            revision: &revision,
            memory: MemorySize::from_mib(4).unwrap(),
            vcpus: VcpuCount::new(1).unwrap(),
            sparse: false,
            storage_driver: StorageDriver::Naive,
        };
        store.publish(staged, spec, &OpContext::background()).await
    }

    #[tokio::test]
    async fn test_publish_and_open() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::open(tmp.path().join("snapshots")).unwrap();
        let image = image(tmp.path());

        let metadata = checkpoint(&store, &key("snap-1"), &image, 1).await.unwrap();
        assert!(store.exists(&key("snap-1")));
        assert!(!store.is_in_flight(&key("snap-1")));
        assert_eq!(metadata.memory_len, 4096);
        assert_eq!(metadata.disk_len, 8192);

        let opened = store.open_snapshot(&key("snap-1")).await.unwrap();
        assert_eq!(opened.metadata, metadata);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_purges_leftover_staging() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("snapshots");
        std::fs::create_dir_all(root.join(STAGING_DIR).join("snap-1-abc")).unwrap();
        std::fs::create_dir_all(root.join(TRASH_DIR).join("snap-0-def")).unwrap();

        let store = SnapshotStore::open(&root).unwrap();
        assert_eq!(std::fs::read_dir(root.join(STAGING_DIR)).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(root.join(TRASH_DIR)).unwrap().count(), 0);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::open(tmp.path()).unwrap();

        let err = store.delete(&key("nothing")).await.unwrap_err();
        assert!(matches!(err, SnapshotError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_restored_memory_outlives_republish() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::open(tmp.path().join("snapshots")).unwrap();
        let image = image(tmp.path());
        checkpoint(&store, &key("shared"), &image, 1).await.unwrap();

        let mut sources = Vec::new();
        for strategy in [RestoreStrategy::Eager, RestoreStrategy::Lazy, RestoreStrategy::DemandPaged] {
            let snapshot = store.open_snapshot(&key("shared")).await.unwrap();
            let work_dir = tmp.path().join(format!("work-{}", strategy));
            let source = store
                .materialize(&snapshot, &image, strategy, &work_dir, &OpContext::background())
                .await
                .unwrap();
            assert!(source.memory.path().starts_with(&work_dir));
            assert!(source.state_path.starts_with(&work_dir));
            sources.push(source);
        }

        checkpoint(&store, &key("shared"), &image, 2).await.unwrap();
        let republished = store.snapshot_dir(&key("shared")).join(MEMORY_FILE);
        assert_eq!(std::fs::read(republished).unwrap(), vec![2u8; 4096]);

        for source in sources {
            assert_eq!(std::fs::read(source.memory.path()).unwrap(), vec![1u8; 4096]);
        }
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_previous_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::open(tmp.path().join("snapshots")).unwrap();
        let image = image(tmp.path());
        let original = checkpoint(&store, &key("snap-1"), &image, 1).await.unwrap();

        *FAIL_RENAME_INTO.lock().unwrap() = Some(store.snapshot_dir(&key("snap-1")));
        let err = checkpoint(&store, &key("snap-1"), &image, 2).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);

        let kept = store.open_snapshot(&key("snap-1")).await.unwrap();
        assert_eq!(kept.metadata, original);
        let memory = kept.dir.join(MEMORY_FILE);
        assert_eq!(std::fs::read(memory).unwrap(), vec![1u8; 4096]);
        assert!(!store.is_in_flight(&key("snap-1")));
        assert_eq!(std::fs::read_dir(store.root().join(STAGING_DIR)).unwrap().count(), 0);

        // A retry replaces it normally.
        checkpoint(&store, &key("snap-1"), &image, 2).await.unwrap();
        let memory = store.snapshot_dir(&key("snap-1")).join(MEMORY_FILE);
        assert_eq!(std::fs::read(memory).unwrap(), vec![2u8; 4096]);
    }
}

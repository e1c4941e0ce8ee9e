// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Root-filesystem image cache.
//!
//! Resolves an [`ImageRef`] to a local ext4 file. The first resolution of a
//! reference fetches it from an [`ImageSource`] into the cache directory;
//! concurrent resolutions of the same reference wait on that single fetch.
//! Entries survive across orchestrator instances: a cache directory that
//! already holds the image is reused without fetching.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::error::ImageError;
use crate::types::ImageRef;

const ROOTFS_FILE: &str = "rootfs.ext4";
const DIGEST_FILE: &str = "digest";

/// Where images come from on a cache miss.
#[async_trait]
pub trait ImageSource: Send + Sync + 'static {
    /// Write the root filesystem for `image` to `dest`.
    async fn fetch(&self, image: &ImageRef, dest: &Path) -> Result<(), ImageError>;
}

/// Serves images out of a flat directory of pre-built ext4 files.
///
/// `ghcr.io/org/app:v1` is looked up as `<root>/ghcr.io_org_app_v1.ext4`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path the source reads `image` from.
    pub fn path_for(&self, image: &ImageRef) -> PathBuf {
        self.root.join(image.file_name())
    }
}

#[async_trait]
impl ImageSource for DirectorySource {
    async fn fetch(&self, image: &ImageRef, dest: &Path) -> Result<(), ImageError> {
        let src = self.path_for(image);
        match tokio::fs::copy(&src, dest).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ImageError::NotFound {
                reference: image.clone(),
            }),
            Err(source) => Err(ImageError::Io {
                reference: image.clone(),
                source,
            }),
        }
    }
}

/// A locally available image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub reference: ImageRef,
    /// `sha256:<hex>` of the root filesystem contents.
    pub digest: String,
    pub rootfs: PathBuf,
    pub size_bytes: u64,
}

/// Shared, single-flight image cache.
pub struct ImageCache {
    source: Arc<dyn ImageSource>,
    cache_dir: PathBuf,
    entries: DashMap<ImageRef, Arc<OnceCell<ResolvedImage>>>,
    /// Images this instance fetched itself, for test-mode purging.
    fetched: DashMap<ImageRef, PathBuf>,
    fetch_count: AtomicU64,
}

impl ImageCache {
    pub fn new(source: Arc<dyn ImageSource>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            cache_dir: cache_dir.into(),
            entries: DashMap::new(),
            fetched: DashMap::new(),
            fetch_count: AtomicU64::new(0),
        }
    }

    /// Cache directory for `image`, named by the hash of its reference.
    pub fn entry_dir(&self, image: &ImageRef) -> PathBuf {
        let name = hex::encode(Sha256::digest(image.as_str().as_bytes()));
        self.cache_dir.join(name)
    }

    /// Resolve `image`, fetching it on first use.
    pub async fn resolve(&self, image: &ImageRef) -> Result<ResolvedImage, ImageError> {
        let cell = self
            .entries
            .entry(image.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        // A failed fetch leaves the cell empty so a later call retries.
        let resolved = cell.get_or_try_init(|| self.load_or_fetch(image)).await?;
        Ok(resolved.clone())
    }

    /// Resolve from cache only; never fetches.
    pub fn cached(&self, image: &ImageRef) -> Option<ResolvedImage> {
        self.entries
            .get(image)
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of fetches this cache has performed against its source.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::Relaxed)
    }

    /// Remove every image this instance fetched. Best-effort.
    pub async fn purge_fetched(&self) -> usize {
        let fetched: Vec<(ImageRef, PathBuf)> = self
            .fetched
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut removed = 0;
        for (image, dir) in fetched {
            self.entries.remove(&image);
            self.fetched.remove(&image);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(image = %image, error = %e, "Failed to purge cached image")
                }
            }
        }
        removed
    }

    async fn load_or_fetch(&self, image: &ImageRef) -> Result<ResolvedImage, ImageError> {
        let dir = self.entry_dir(image);
        let rootfs = dir.join(ROOTFS_FILE);
        let io_err = |source| ImageError::Io {
            reference: image.clone(),
            source,
        };

        if let Some(resolved) = self.load_existing(image, &dir).await {
            tracing::debug!(image = %image, path = %rootfs.display(), "Image cache hit");
            return Ok(resolved);
        }

        tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;

        let tmp = dir.join(format!("{}.{}.tmp", ROOTFS_FILE, uuid::Uuid::new_v4()));
        let started = std::time::Instant::now();

        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.source.fetch(image, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        let digest = match file_digest(&tmp).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(io_err(e));
            }
        };

        tokio::fs::rename(&tmp, &rootfs).await.map_err(io_err)?;
        tokio::fs::write(dir.join(DIGEST_FILE), digest.as_bytes())
            .await
            .map_err(io_err)?;

        let size_bytes = tokio::fs::metadata(&rootfs).await.map_err(io_err)?.len();
        self.fetched.insert(image.clone(), dir);

        tracing::info!(
            image = %image,
            digest = %digest,
            size_bytes = size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image fetched"
        );

        Ok(ResolvedImage {
            reference: image.clone(),
            digest,
            rootfs,
            size_bytes,
        })
    }

    async fn load_existing(&self, image: &ImageRef, dir: &Path) -> Option<ResolvedImage> {
        let rootfs = dir.join(ROOTFS_FILE);
        let digest = tokio::fs::read_to_string(dir.join(DIGEST_FILE)).await.ok()?;
        let size_bytes = tokio::fs::metadata(&rootfs).await.ok()?.len();

        Some(ResolvedImage {
            reference: image.clone(),
            digest: digest.trim().to_string(),
            rootfs,
            size_bytes,
        })
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("cache_dir", &self.cache_dir)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// `sha256:<hex>` of a file's contents.
pub async fn file_digest(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn image() -> ImageRef {
        ImageRef::new("ghcr.io/ease-lab/helloworld:var_workload").unwrap()
    }

    fn setup() -> (TempDir, DirectorySource, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let source_dir = tmp.path().join("images");
        std::fs::create_dir_all(&source_dir).unwrap();
        let source = DirectorySource::new(&source_dir);
        std::fs::write(source.path_for(&image()), vec![7u8; 8192]).unwrap();
        let cache_dir = tmp.path().join("cache");
        (tmp, source, cache_dir)
    }

    /// Source that counts calls and takes a while, to expose duplicate fetches.
    struct SlowSource {
        inner: DirectorySource,
    }

    #[async_trait]
    impl ImageSource for SlowSource {
        async fn fetch(&self, image: &ImageRef, dest: &Path) -> Result<(), ImageError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.fetch(image, dest).await
        }
    }

    #[tokio::test]
    async fn test_resolve_fetches_once() {
        let (_tmp, source, cache_dir) = setup();
        let cache = ImageCache::new(Arc::new(source), &cache_dir);

        let first = cache.resolve(&image()).await.unwrap();
        let second = cache.resolve(&image()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.fetch_count(), 1);
        assert_eq!(first.size_bytes, 8192);
        assert!(first.digest.starts_with("sha256:"));
        assert!(first.rootfs.starts_with(&cache_dir));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolutions_share_one_fetch() {
        let (_tmp, source, cache_dir) = setup();
        let cache = Arc::new(ImageCache::new(
            Arc::new(SlowSource { inner: source }),
            &cache_dir,
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.resolve(&image()).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_image_is_not_found_and_retryable() {
        let (_tmp, source, cache_dir) = setup();
        let missing = ImageRef::new("ghcr.io/none/missing:latest").unwrap();
        let cache = ImageCache::new(Arc::new(source.clone()), &cache_dir);

        let err = cache.resolve(&missing).await.unwrap_err();
        assert!(matches!(err, ImageError::NotFound { .. }));
        assert!(cache.cached(&missing).is_none());

        std::fs::write(source.path_for(&missing), b"late").unwrap();
        assert!(cache.resolve(&missing).await.is_ok());
    }

    #[tokio::test]
    async fn test_persisted_entry_reused_and_purge() {
        let (_tmp, source, cache_dir) = setup();
        let source = Arc::new(source);

        let cache = ImageCache::new(source.clone(), &cache_dir);
        let resolved = cache.resolve(&image()).await.unwrap();

        let reopened = ImageCache::new(source, &cache_dir);
        let again = reopened.resolve(&image()).await.unwrap();
        assert_eq!(reopened.fetch_count(), 0);
        assert_eq!(resolved.digest, again.digest);

        // Only the instance that fetched purges.
        assert_eq!(reopened.purge_fetched().await, 0);
        assert_eq!(cache.purge_fetched().await, 1);
        assert!(!resolved.rootfs.exists());
    }
}

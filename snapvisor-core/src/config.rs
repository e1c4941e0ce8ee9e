// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Validates orchestrator configuration at boot-up time.
//! Any invalid field results in a HardValidationError that prevents startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HardValidationError, OrchResult, OrchestratorError};
use crate::hypervisor::FirecrackerConfig;
use crate::network::MAX_POOL_CAPACITY;
use crate::snapshot::RestoreStrategy;
use crate::types::Namespace;

/// Longest accepted per-operation timeout: one hour.
const MAX_OPERATION_TIMEOUT_MS: u64 = 3_600_000;

/// Container snapshotter backing VM root filesystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    Devmapper,
    Overlayfs,
    Naive,
}

impl StorageDriver {
    pub const ALL: [StorageDriver; 3] = [Self::Devmapper, Self::Overlayfs, Self::Naive];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Devmapper => "devmapper",
            Self::Overlayfs => "overlayfs",
            Self::Naive => "naive",
        }
    }

    /// Parse a driver name, rejecting unknown drivers.
    pub fn parse(name: &str) -> Result<Self, HardValidationError> {
        Self::ALL
            .into_iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| HardValidationError::UnknownStorageDriver {
                name: name.to_string(),
                expected: Self::ALL.map(|d| d.name()).join(", "),
            })
    }
}

impl std::fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which hypervisor adapter the CLI drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    Firecracker,
    Simulated,
}

/// Construction-time behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeFlags {
    /// Cleanup also purges snapshots and images this orchestrator created.
    pub test_mode: bool,
    /// Restore defers reading guest memory until first access.
    pub lazy_mode: bool,
    /// Restore serves guest memory through a userfault handler.
    pub upf: bool,
    /// Snapshots stay fully materialized on this host.
    pub full_local: bool,
}

// =============================================================================
// Raw (unvalidated) configuration
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOrchestratorConfig {
    #[serde(default = "default_storage_driver")]
    storage_driver: String,
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default = "default_pool_size")]
    pool_size: usize,
    #[serde(default = "default_operation_timeout_ms")]
    operation_timeout_ms: u64,
    #[serde(default)]
    test_mode: bool,
    #[serde(default)]
    lazy_mode: bool,
    #[serde(default)]
    upf: bool,
    #[serde(default)]
    full_local: bool,
}

fn default_storage_driver() -> String {
    StorageDriver::Devmapper.name().to_string()
}

fn default_namespace() -> String {
    Namespace::default().to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_operation_timeout_ms() -> u64 {
    60_000
}

impl Default for RawOrchestratorConfig {
    fn default() -> Self {
        Self {
            storage_driver: default_storage_driver(),
            namespace: default_namespace(),
            pool_size: default_pool_size(),
            operation_timeout_ms: default_operation_timeout_ms(),
            test_mode: false,
            lazy_mode: false,
            upf: false,
            full_local: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPaths {
    #[serde(default = "default_snapshot_root")]
    snapshot_root: PathBuf,
    #[serde(default = "default_image_source_dir")]
    image_source_dir: PathBuf,
    #[serde(default = "default_image_cache_dir")]
    image_cache_dir: PathBuf,
    #[serde(default = "default_run_dir")]
    run_dir: PathBuf,
}

fn default_snapshot_root() -> PathBuf {
    PathBuf::from("/var/lib/snapvisor/snapshots")
}

fn default_image_source_dir() -> PathBuf {
    PathBuf::from("/var/lib/snapvisor/images")
}

fn default_image_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/snapvisor/cache")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/run/snapvisor")
}

impl Default for RawPaths {
    fn default() -> Self {
        Self {
            snapshot_root: default_snapshot_root(),
            image_source_dir: default_image_source_dir(),
            image_cache_dir: default_image_cache_dir(),
            run_dir: default_run_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHypervisorConfig {
    #[serde(default = "default_backend")]
    backend: HypervisorBackend,
    #[serde(default)]
    firecracker: FirecrackerConfig,
}

fn default_backend() -> HypervisorBackend {
    HypervisorBackend::Firecracker
}

impl Default for RawHypervisorConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            firecracker: FirecrackerConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    orchestrator: RawOrchestratorConfig,
    #[serde(default)]
    paths: RawPaths,
    #[serde(default)]
    hypervisor: RawHypervisorConfig,
}

// =============================================================================
// Validated configuration
// =============================================================================

/// Validated orchestrator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub storage_driver: StorageDriver,
    pub namespace: Namespace,
    pub pool_size: usize,
    pub operation_timeout: Duration,
    pub flags: ModeFlags,
    pub snapshot_root: PathBuf,
    pub image_source_dir: PathBuf,
    pub image_cache_dir: PathBuf,
    pub run_dir: PathBuf,
}

impl OrchestratorConfig {
    /// Start building a configuration programmatically.
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    /// Memory restore strategy selected by the mode flags.
    ///
    /// `upf` takes precedence over `lazy_mode`.
    pub fn restore_strategy(&self) -> RestoreStrategy {
        if self.flags.upf {
            RestoreStrategy::DemandPaged
        } else if self.flags.lazy_mode {
            RestoreStrategy::Lazy
        } else {
            RestoreStrategy::Eager
        }
    }

    /// Whether checkpoints must be stored fully materialized.
    pub fn materialize_snapshots(&self) -> bool {
        self.flags.full_local
    }

    /// Per-VM scratch directory.
    pub fn vm_work_dir(&self, vm_id: &crate::types::VmId) -> PathBuf {
        self.run_dir.join(self.namespace.as_str()).join(vm_id.as_str())
    }
}

/// Validated hypervisor selection.
#[derive(Debug, Clone, PartialEq)]
pub struct HypervisorConfig {
    pub backend: HypervisorBackend,
    pub firecracker: FirecrackerConfig,
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub hypervisor: HypervisorConfig,
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> OrchResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(OrchestratorError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| OrchestratorError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> OrchResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| OrchestratorError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> OrchResult<Config> {
        let o = raw.orchestrator;
        let p = raw.paths;

        let orchestrator = OrchestratorConfig::builder()
            .storage_driver(StorageDriver::parse(&o.storage_driver)?)
            .namespace(Namespace::new(o.namespace)?)
            .pool_size(o.pool_size)
            .operation_timeout(Duration::from_millis(o.operation_timeout_ms))
            .test_mode(o.test_mode)
            .lazy_mode(o.lazy_mode)
            .upf(o.upf)
            .full_local(o.full_local)
            .snapshot_root(p.snapshot_root)
            .image_source_dir(p.image_source_dir)
            .image_cache_dir(p.image_cache_dir)
            .run_dir(p.run_dir)
            .build()?;

        let firecracker = raw.hypervisor.firecracker;
        if raw.hypervisor.backend == HypervisorBackend::Firecracker {
            if firecracker.kernel_image.as_os_str().is_empty() {
                return Err(HardValidationError::MissingRequiredField {
                    field: "kernel_image",
                    context: "hypervisor.firecracker".to_string(),
                }
                .into());
            }
            if orchestrator.flags.upf && firecracker.uffd_socket.is_none() {
                return Err(HardValidationError::MissingRequiredField {
                    field: "uffd_socket",
                    context: "hypervisor.firecracker (required by upf)".to_string(),
                }
                .into());
            }
        }

        Ok(Config {
            orchestrator,
            hypervisor: HypervisorConfig {
                backend: raw.hypervisor.backend,
                firecracker,
            },
        })
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfigBuilder {
    storage_driver: StorageDriver,
    namespace: Namespace,
    pool_size: usize,
    operation_timeout: Duration,
    flags: ModeFlags,
    snapshot_root: PathBuf,
    image_source_dir: PathBuf,
    image_cache_dir: PathBuf,
    run_dir: PathBuf,
}

impl Default for OrchestratorConfigBuilder {
    fn default() -> Self {
        Self {
            storage_driver: StorageDriver::Devmapper,
            namespace: Namespace::default(),
            pool_size: default_pool_size(),
            operation_timeout: Duration::from_millis(default_operation_timeout_ms()),
            flags: ModeFlags::default(),
            snapshot_root: default_snapshot_root(),
            image_source_dir: default_image_source_dir(),
            image_cache_dir: default_image_cache_dir(),
            run_dir: default_run_dir(),
        }
    }
}

impl OrchestratorConfigBuilder {
    pub fn storage_driver(mut self, driver: StorageDriver) -> Self {
        self.storage_driver = driver;
        self
    }

    pub fn namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn test_mode(mut self, on: bool) -> Self {
        self.flags.test_mode = on;
        self
    }

    pub fn lazy_mode(mut self, on: bool) -> Self {
        self.flags.lazy_mode = on;
        self
    }

    pub fn upf(mut self, on: bool) -> Self {
        self.flags.upf = on;
        self
    }

    pub fn full_local(mut self, on: bool) -> Self {
        self.flags.full_local = on;
        self
    }

    /// Place every directory under `base`.
    pub fn base_dir(self, base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        self.snapshot_root(base.join("snapshots"))
            .image_source_dir(base.join("images"))
            .image_cache_dir(base.join("cache"))
            .run_dir(base.join("run"))
    }

    pub fn snapshot_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_root = dir.into();
        self
    }

    pub fn image_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_source_dir = dir.into();
        self
    }

    pub fn image_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_cache_dir = dir.into();
        self
    }

    pub fn run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = dir.into();
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<OrchestratorConfig, HardValidationError> {
        if self.pool_size == 0 || self.pool_size > MAX_POOL_CAPACITY {
            return Err(HardValidationError::OutOfBounds {
                field: "pool_size",
                value: self.pool_size as u64,
                min: 1,
                max: MAX_POOL_CAPACITY as u64,
            });
        }

        let timeout_ms = self.operation_timeout.as_millis() as u64;
        if timeout_ms == 0 || timeout_ms > MAX_OPERATION_TIMEOUT_MS {
            return Err(HardValidationError::OutOfBounds {
                field: "operation_timeout_ms",
                value: timeout_ms,
                min: 1,
                max: MAX_OPERATION_TIMEOUT_MS,
            });
        }

        for (field, dir) in [
            ("snapshot_root", &self.snapshot_root),
            ("image_source_dir", &self.image_source_dir),
            ("image_cache_dir", &self.image_cache_dir),
            ("run_dir", &self.run_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(HardValidationError::MissingRequiredField {
                    field,
                    context: "paths".to_string(),
                });
            }
        }

        Ok(OrchestratorConfig {
            storage_driver: self.storage_driver,
            namespace: self.namespace,
            pool_size: self.pool_size,
            operation_timeout: self.operation_timeout,
            flags: self.flags,
            snapshot_root: self.snapshot_root,
            image_source_dir: self.image_source_dir,
            image_cache_dir: self.image_cache_dir,
            run_dir: self.run_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const VALID_CONFIG: &str = r#"
orchestrator:
  storage_driver: devmapper
  namespace: fn-test
  pool_size: 10
  lazy_mode: true

paths:
  snapshot_root: /tmp/snapvisor/snapshots
  image_source_dir: /tmp/snapvisor/images
  image_cache_dir: /tmp/snapvisor/cache
  run_dir: /tmp/snapvisor/run

hypervisor:
  backend: firecracker
  firecracker:
    kernel_image: /var/lib/snapvisor/vmlinux
"#;

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG).unwrap();
        assert_eq!(config.orchestrator.pool_size, 10);
        assert_eq!(config.orchestrator.namespace.as_str(), "fn-test");
        assert_eq!(config.orchestrator.restore_strategy(), RestoreStrategy::Lazy);
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Firecracker);
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = ConfigLoader::load_string(include_str!("../../snapvisor.yaml")).unwrap();
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Firecracker);
        assert_eq!(config.orchestrator.restore_strategy(), RestoreStrategy::Eager);
    }

    #[test]
    fn test_defaults_applied() {
        let config = ConfigLoader::load_string("{}").unwrap();
        assert_eq!(config.orchestrator.storage_driver, StorageDriver::Devmapper);
        assert_eq!(config.orchestrator.pool_size, 10);
        assert_eq!(config.orchestrator.operation_timeout, Duration::from_secs(60));
        assert_eq!(config.orchestrator.flags, ModeFlags::default());
        assert_eq!(config.orchestrator.restore_strategy(), RestoreStrategy::Eager);
    }

    #[test]
    fn test_unknown_storage_driver() {
        let yaml = "orchestrator:\n  storage_driver: zfs\n";
        let err = ConfigLoader::load_string(yaml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("zfs"));
    }

    #[test]
    fn test_pool_size_bounds() {
        assert!(ConfigLoader::load_string("orchestrator:\n  pool_size: 0\n").is_err());
        assert!(ConfigLoader::load_string("orchestrator:\n  pool_size: 5000\n").is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ConfigLoader::load_string("orchestrator:\n  warm_pool: 3\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigParse { .. }));
    }

    #[test]
    fn test_upf_requires_handler_socket_for_firecracker() {
        let yaml = "orchestrator:\n  upf: true\n";
        assert!(ConfigLoader::load_string(yaml).is_err());

        let yaml = "orchestrator:\n  upf: true\nhypervisor:\n  backend: simulated\n";
        let config = ConfigLoader::load_string(yaml).unwrap();
        assert_eq!(config.orchestrator.restore_strategy(), RestoreStrategy::DemandPaged);
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigLoader::load_file("/nonexistent/snapvisor.yaml").unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_builder_base_dir_and_flags() {
        let config = OrchestratorConfig::builder()
            .base_dir("/tmp/sv")
            .pool_size(1)
            .full_local(true)
            .upf(true)
            .lazy_mode(true)
            .build()
            .unwrap();
        assert_eq!(config.snapshot_root, PathBuf::from("/tmp/sv/snapshots"));
        assert!(config.materialize_snapshots());
        assert_eq!(config.restore_strategy(), RestoreStrategy::DemandPaged);
        assert_eq!(
            config.vm_work_dir(&crate::types::VmId::new("7").unwrap()),
            PathBuf::from("/tmp/sv/run/snapvisor/7")
        );
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = OrchestratorConfig::builder()
            .operation_timeout(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(HardValidationError::OutOfBounds { .. })));
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Following the "Newtype" pattern in Rust to ensure valid state by construction.
//! All types validate their invariants at creation time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Maximum guest memory: 32 GiB.
const MAX_MEMORY_MIB: u32 = 32 * 1024;
/// Firecracker supports at most 32 vCPUs per microVM.
const MAX_VCPUS: u8 = 32;
/// Maximum length of identifiers used as directory and device names.
const MAX_ID_LEN: usize = 64;

fn validate_name(field: &'static str, value: &str, extra: &[char]) -> Result<(), HardValidationError> {
    if value.is_empty() {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: value.to_string(),
            reason: "cannot be empty".to_string(),
        });
    }

    if value.len() > MAX_ID_LEN {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: value.to_string(),
            reason: format!("too long: {} chars (max {})", value.len(), MAX_ID_LEN),
        });
    }

    if value.starts_with('.') {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: value.to_string(),
            reason: "cannot start with '.'".to_string(),
        });
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || extra.contains(&c))
    {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: value.to_string(),
            reason: "must contain only ASCII alphanumerics, hyphens and underscores".to_string(),
        });
    }

    Ok(())
}

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = HardValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

string_newtype!(
    /// Validated microVM identity.
    /// Alphanumeric with hyphens, underscores and dots, max 64 chars.
    VmId
);

impl VmId {
    /// Create a new VmId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();
        validate_name("vm_id", &id, &['.'])?;
        Ok(Self(id))
    }
}

string_newtype!(
    /// Validated snapshot key. Used verbatim as the snapshot directory name.
    SnapshotKey
);

impl SnapshotKey {
    /// Create a new SnapshotKey with validation.
    pub fn new(key: impl Into<String>) -> Result<Self, HardValidationError> {
        let key = key.into();
        validate_name("snapshot_key", &key, &['.'])?;
        Ok(Self(key))
    }

    /// Key derived from a VM identity, the default when offloading.
    pub fn for_vm(vm_id: &VmId) -> Self {
        Self(vm_id.as_str().to_string())
    }

    /// Key derived from a function revision, used to share one snapshot
    /// across instances of the same revision.
    pub fn for_revision(revision: &Revision, vm_id: &VmId) -> Result<Self, HardValidationError> {
        Self::new(format!("{}-{}", revision, vm_id))
    }
}

string_newtype!(
    /// Validated function revision label.
    Revision
);

impl Revision {
    /// Create a new Revision with validation.
    pub fn new(revision: impl Into<String>) -> Result<Self, HardValidationError> {
        let revision = revision.into();
        validate_name("revision", &revision, &['.'])?;
        Ok(Self(revision))
    }

    /// The revision assigned when the caller does not supply one.
    pub fn initial() -> Self {
        Self("rev-1".to_string())
    }
}

string_newtype!(
    /// Validated namespace. Scopes run directories and tap device names.
    Namespace
);

impl Namespace {
    /// Create a new Namespace with validation.
    pub fn new(namespace: impl Into<String>) -> Result<Self, HardValidationError> {
        let namespace = namespace.into();
        validate_name("namespace", &namespace, &[])?;
        Ok(Self(namespace))
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self("snapvisor".to_string())
    }
}

/// Validated container image reference, e.g. `ghcr.io/org/helloworld:v1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef(String);

impl ImageRef {
    /// Create a new ImageRef with validation.
    pub fn new(reference: impl Into<String>) -> Result<Self, HardValidationError> {
        let reference = reference.into();

        if reference.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "image",
                value: reference,
                reason: "image reference cannot be empty".to_string(),
            });
        }

        if reference.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "image",
                value: reference,
                reason: "image reference cannot contain whitespace".to_string(),
            });
        }

        if reference.split('/').any(|part| part == "..") {
            return Err(HardValidationError::InvalidFieldValue {
                field: "image",
                value: reference,
                reason: "image reference cannot contain '..' path components".to_string(),
            });
        }

        Ok(Self(reference))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name used for this image inside a flat image directory.
    ///
    /// `ghcr.io/org/app:v1` becomes `ghcr.io_org_app_v1.ext4`.
    pub fn file_name(&self) -> String {
        let flat: String = self
            .0
            .chars()
            .map(|c| match c {
                '/' | ':' | '@' => '_',
                c => c,
            })
            .collect();
        format!("{}.ext4", flat)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ImageRef> for String {
    fn from(image: ImageRef) -> Self {
        image.0
    }
}

/// Validated guest memory size in MiB.
/// Must be positive and at most 32 GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct MemorySize(u32);

impl MemorySize {
    /// Create a new MemorySize with bounds validation.
    pub fn from_mib(mib: u32) -> Result<Self, HardValidationError> {
        if mib == 0 || mib > MAX_MEMORY_MIB {
            return Err(HardValidationError::OutOfBounds {
                field: "memory_mib",
                value: mib as u64,
                min: 1,
                max: MAX_MEMORY_MIB as u64,
            });
        }
        Ok(Self(mib))
    }

    /// Get the memory size in MiB.
    pub fn mib(&self) -> u32 {
        self.0
    }

    /// Get the memory size in bytes.
    pub fn bytes(&self) -> u64 {
        self.0 as u64 * 1024 * 1024
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MiB", self.0)
    }
}

impl TryFrom<u32> for MemorySize {
    type Error = HardValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_mib(value)
    }
}

impl From<MemorySize> for u32 {
    fn from(size: MemorySize) -> Self {
        size.0
    }
}

/// Validated vCPU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct VcpuCount(u8);

impl VcpuCount {
    /// Create a new VcpuCount with bounds validation.
    pub fn new(count: u8) -> Result<Self, HardValidationError> {
        if count == 0 || count > MAX_VCPUS {
            return Err(HardValidationError::OutOfBounds {
                field: "vcpu_count",
                value: count as u64,
                min: 1,
                max: MAX_VCPUS as u64,
            });
        }
        Ok(Self(count))
    }

    /// Get the vCPU count.
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for VcpuCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for VcpuCount {
    type Error = HardValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VcpuCount> for u8 {
    fn from(count: VcpuCount) -> Self {
        count.0
    }
}

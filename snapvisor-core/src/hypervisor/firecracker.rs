// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Firecracker adapter.
//!
//! Spawns one `firecracker` process per VM and drives it over its HTTP API on
//! a Unix socket in the VM's work directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{CheckpointTarget, Endpoint, Hypervisor, LaunchSpec, MemoryBackend, RestoreSource};
use crate::error::{HypervisorError, HypervisorResult};
use crate::types::VmId;

const SOCKET_FILE: &str = "firecracker.sock";
const LOG_FILE: &str = "firecracker.log";
const ROOTFS_FILE: &str = "rootfs.ext4";
const ROOT_DRIVE: &str = "rootfs";
const IFACE: &str = "eth0";

/// Firecracker adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirecrackerConfig {
    /// Path to the `firecracker` binary.
    pub binary: PathBuf,
    /// Uncompressed guest kernel.
    pub kernel_image: PathBuf,
    /// Kernel command line; the guest IP configuration is appended.
    pub boot_args: String,
    /// How long to wait for the API socket to appear.
    pub socket_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub stop_grace_ms: u64,
    /// Page-fault handler socket used for demand-paged restores.
    pub uffd_socket: Option<PathBuf>,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("firecracker"),
            kernel_image: PathBuf::from("/var/lib/snapvisor/vmlinux"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
            socket_timeout_ms: 5_000,
            stop_grace_ms: 2_000,
            uffd_socket: None,
        }
    }
}

// =============================================================================
// API bodies
// =============================================================================

#[derive(Serialize)]
struct MachineConfig {
    vcpu_count: u8,
    mem_size_mib: u32,
    smt: bool,
}

#[derive(Serialize)]
struct BootSource<'a> {
    kernel_image_path: &'a Path,
    boot_args: String,
}

#[derive(Serialize)]
struct Drive<'a> {
    drive_id: &'a str,
    path_on_host: &'a Path,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Serialize)]
struct DrivePatch<'a> {
    drive_id: &'a str,
    path_on_host: &'a Path,
}

#[derive(Serialize)]
struct NetworkInterface<'a> {
    iface_id: &'a str,
    host_dev_name: &'a str,
    guest_mac: &'a str,
}

#[derive(Serialize)]
struct Action {
    action_type: &'static str,
}

#[derive(Serialize)]
struct VmStatePatch {
    state: &'static str,
}

#[derive(Serialize)]
struct SnapshotCreate<'a> {
    snapshot_type: &'static str,
    snapshot_path: &'a Path,
    mem_file_path: &'a Path,
}

#[derive(Serialize)]
struct MemBackend<'a> {
    backend_type: &'static str,
    backend_path: &'a Path,
}

#[derive(Serialize)]
struct NetworkOverride<'a> {
    iface_id: &'a str,
    host_dev_name: &'a str,
}

#[derive(Serialize)]
struct SnapshotLoad<'a> {
    snapshot_path: &'a Path,
    mem_backend: MemBackend<'a>,
    enable_diff_snapshots: bool,
    resume_vm: bool,
    network_overrides: Vec<NetworkOverride<'a>>,
}

// =============================================================================
// API client
// =============================================================================

type HyperClient = Client<UnixConnector, Full<Bytes>>;

struct ApiClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl ApiClient {
    fn new(socket_path: PathBuf) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path,
        }
    }

    async fn send<T: Serialize>(
        &self,
        method: &'static str,
        endpoint: &str,
        body: &T,
    ) -> HypervisorResult<()> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let json = serde_json::to_vec(body).map_err(|e| HypervisorError::Transport {
            reason: format!("encode {} body: {}", endpoint, e),
        })?;

        let req_method = match method {
            "PUT" => hyper::Method::PUT,
            "PATCH" => hyper::Method::PATCH,
            _ => hyper::Method::GET,
        };

        let req = hyper::Request::builder()
            .method(req_method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| HypervisorError::Transport {
                reason: e.to_string(),
            })?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| HypervisorError::Transport {
                reason: format!("{} {}: {}", method, endpoint, e),
            })?;
        let status = res.status();

        if !status.is_success() {
            let body = res
                .into_body()
                .collect()
                .await
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
                .unwrap_or_default();
            return Err(HypervisorError::Api {
                method,
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

// =============================================================================
// Process
// =============================================================================

/// A running `firecracker` process and its API client.
pub struct FirecrackerProcess {
    vm_id: VmId,
    pid: Option<u32>,
    child: Mutex<Child>,
    api: ApiClient,
    work_dir: PathBuf,
    disk_path: PathBuf,
    endpoint: Endpoint,
}

impl FirecrackerProcess {
    pub fn vm_id(&self) -> &VmId {
        &self.vm_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn socket_path(&self) -> &Path {
        &self.api.socket_path
    }
}

impl std::fmt::Debug for FirecrackerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirecrackerProcess")
            .field("vm_id", &self.vm_id)
            .field("pid", &self.pid)
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

/// Drives real Firecracker microVMs.
#[derive(Debug, Clone)]
pub struct FirecrackerHypervisor {
    config: FirecrackerConfig,
}

impl FirecrackerHypervisor {
    pub fn new(config: FirecrackerConfig) -> Self {
        Self { config }
    }

    fn boot_args(&self, spec: &LaunchSpec) -> String {
        format!(
            "{} ip={}::{}:255.255.255.252::{}:off",
            self.config.boot_args, spec.network.guest_ip, spec.network.host_ip, IFACE
        )
    }

    /// Start the process and wait for its API socket.
    async fn spawn(&self, spec: &LaunchSpec) -> HypervisorResult<FirecrackerProcess> {
        tokio::fs::create_dir_all(&spec.work_dir)
            .await
            .map_err(|source| HypervisorError::Io {
                context: "create work dir",
                source,
            })?;

        let socket_path = spec.work_dir.join(SOCKET_FILE);
        let _ = tokio::fs::remove_file(&socket_path).await;

        let log = std::fs::File::create(spec.work_dir.join(LOG_FILE)).map_err(|source| {
            HypervisorError::Io {
                context: "create firecracker log",
                source,
            }
        })?;
        let log_err = log.try_clone().map_err(|source| HypervisorError::Io {
            context: "create firecracker log",
            source,
        })?;

        let mut child = Command::new(&self.config.binary)
            .arg("--api-sock")
            .arg(&socket_path)
            .arg("--id")
            .arg(spec.vm_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HypervisorError::SpawnFailed {
                reason: format!("{}: {}", self.config.binary.display(), e),
            })?;

        let timeout = Duration::from_millis(self.config.socket_timeout_ms);
        let started = Instant::now();
        while !socket_path.exists() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(HypervisorError::SpawnFailed {
                    reason: format!("firecracker exited early with {}", status),
                });
            }
            if started.elapsed() > timeout {
                return Err(HypervisorError::SocketTimeout {
                    path: socket_path,
                    timeout_ms: self.config.socket_timeout_ms,
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tracing::debug!(
            vm_id = %spec.vm_id,
            image = %spec.image,
            pid = child.id(),
            socket = %socket_path.display(),
            "Firecracker process spawned"
        );

        Ok(FirecrackerProcess {
            vm_id: spec.vm_id.clone(),
            pid: child.id(),
            child: Mutex::new(child),
            api: ApiClient::new(socket_path),
            work_dir: spec.work_dir.clone(),
            disk_path: spec.work_dir.join(ROOTFS_FILE),
            endpoint: Endpoint::for_slot(&spec.network),
        })
    }

    async fn configure_network(
        &self,
        process: &FirecrackerProcess,
        spec: &LaunchSpec,
    ) -> HypervisorResult<()> {
        process
            .api
            .send(
                "PUT",
                &format!("/network-interfaces/{}", IFACE),
                &NetworkInterface {
                    iface_id: IFACE,
                    host_dev_name: &spec.network.tap_name,
                    guest_mac: &spec.network.guest_mac,
                },
            )
            .await
    }
}

fn copy_err(source: std::io::Error) -> HypervisorError {
    HypervisorError::Io {
        context: "copy disk",
        source,
    }
}

#[async_trait]
impl Hypervisor for FirecrackerHypervisor {
    type Process = FirecrackerProcess;

    fn name(&self) -> &'static str {
        "firecracker"
    }

    async fn create(&self, spec: &LaunchSpec) -> HypervisorResult<FirecrackerProcess> {
        let process = self.spawn(spec).await?;

        tokio::fs::copy(&spec.rootfs, &process.disk_path)
            .await
            .map_err(copy_err)?;

        process
            .api
            .send(
                "PUT",
                "/machine-config",
                &MachineConfig {
                    vcpu_count: spec.vcpus.value(),
                    mem_size_mib: spec.memory.mib(),
                    smt: false,
                },
            )
            .await?;

        process
            .api
            .send(
                "PUT",
                "/boot-source",
                &BootSource {
                    kernel_image_path: &self.config.kernel_image,
                    boot_args: self.boot_args(spec),
                },
            )
            .await?;

        process
            .api
            .send(
                "PUT",
                &format!("/drives/{}", ROOT_DRIVE),
                &Drive {
                    drive_id: ROOT_DRIVE,
                    path_on_host: &process.disk_path,
                    is_root_device: true,
                    is_read_only: false,
                },
            )
            .await?;

        self.configure_network(&process, spec).await?;

        process
            .api
            .send(
                "PUT",
                "/actions",
                &Action {
                    action_type: "InstanceStart",
                },
            )
            .await?;

        Ok(process)
    }

    async fn pause(&self, process: &FirecrackerProcess) -> HypervisorResult<()> {
        process
            .api
            .send("PATCH", "/vm", &VmStatePatch { state: "Paused" })
            .await
    }

    async fn resume(&self, process: &FirecrackerProcess) -> HypervisorResult<Endpoint> {
        process
            .api
            .send("PATCH", "/vm", &VmStatePatch { state: "Resumed" })
            .await?;
        Ok(process.endpoint)
    }

    async fn stop(&self, process: FirecrackerProcess) -> HypervisorResult<()> {
        let mut child = process.child.into_inner();

        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

            let grace = Duration::from_millis(self.config.stop_grace_ms);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                tracing::warn!(vm_id = %process.vm_id, pid = pid, "Firecracker ignored SIGTERM, killing");
                child.kill().await.map_err(|source| HypervisorError::Io {
                    context: "kill firecracker",
                    source,
                })?;
            }
        }

        let _ = tokio::fs::remove_file(&process.api.socket_path).await;
        tracing::debug!(vm_id = %process.vm_id, "Firecracker process stopped");
        Ok(())
    }

    async fn checkpoint(
        &self,
        process: &FirecrackerProcess,
        target: &CheckpointTarget,
    ) -> HypervisorResult<()> {
        process
            .api
            .send(
                "PUT",
                "/snapshot/create",
                &SnapshotCreate {
                    snapshot_type: "Full",
                    snapshot_path: &target.state_path,
                    mem_file_path: &target.memory_path,
                },
            )
            .await?;

        // Guest is paused, so the disk is quiescent.
        tokio::fs::copy(&process.disk_path, &target.disk_path)
            .await
            .map_err(copy_err)?;
        Ok(())
    }

    async fn restore(
        &self,
        source: &RestoreSource,
        spec: &LaunchSpec,
    ) -> HypervisorResult<FirecrackerProcess> {
        let process = self.spawn(spec).await?;

        // The snapshot re-opens the root drive at the path it was created
        // with, which for the same identity is this work directory.
        if source.disk_path != process.disk_path {
            tokio::fs::rename(&source.disk_path, &process.disk_path)
                .await
                .map_err(copy_err)?;
        }

        let mem_backend = match &source.memory {
            MemoryBackend::File(path) | MemoryBackend::OnDemand(path) => MemBackend {
                backend_type: "File",
                backend_path: path,
            },
            MemoryBackend::Uffd(_) => MemBackend {
                backend_type: "Uffd",
                backend_path: self.config.uffd_socket.as_deref().ok_or_else(|| {
                    HypervisorError::SpawnFailed {
                        reason: "demand-paged restore requires firecracker.uffd_socket".to_string(),
                    }
                })?,
            },
        };

        process
            .api
            .send(
                "PUT",
                "/snapshot/load",
                &SnapshotLoad {
                    snapshot_path: &source.state_path,
                    mem_backend,
                    enable_diff_snapshots: false,
                    resume_vm: false,
                    network_overrides: vec![NetworkOverride {
                        iface_id: IFACE,
                        host_dev_name: &spec.network.tap_name,
                    }],
                },
            )
            .await?;

        process
            .api
            .send(
                "PATCH",
                &format!("/drives/{}", ROOT_DRIVE),
                &DrivePatch {
                    drive_id: ROOT_DRIVE,
                    path_on_host: &process.disk_path,
                },
            )
            .await?;

        tracing::debug!(
            vm_id = %spec.vm_id,
            image = %spec.image,
            key = %source.key,
            lazy = source.memory.is_lazy(),
            "Firecracker snapshot loaded"
        );

        Ok(process)
    }
}

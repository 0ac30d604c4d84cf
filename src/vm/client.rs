//! Sandbox lifecycle client
//!
//! The [`Client`] owns everything a sandbox needs on the host: the command
//! runner, the hypervisor API transport, the network pools and the
//! per-sandbox locks. Create, snapshot, fork, clone and recovery live in
//! sibling modules as further `impl Client` blocks.
//!
//! # State machine
//!
//! ```text
//!              create                boot
//! NotCreated ─────────► Created ─────────────► Running ◄──┐
//!      ▲                   ▲                     │  ▲     │ resume
//!      │ destroy           │                pause│  │     │
//!      │ (from any state)  │                     ▼  │     │
//!      │                   │ boot            Paused ──────┘
//!      │               Shutdown ◄──────────────────┘
//!      └─────────────────────────  power-button (then forced)
//! ```
//!
//! Every transition re-reads `vm.info` first and fails fast with
//! [`RunnerError::InvalidState`] when the VM is in the wrong state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::config::{
    DeviceConfig, Lineage, RemoveDeviceConfig, ResizeConfig, ResizeDiskConfig, SandboxInfo,
    VmInfo, VmState,
};
use super::handle::ProcessTracker;
use super::hypervisor::{ChRemoteApi, HttpVmmApi, VmmApi};
use super::lifecycle::{self, STATE_TIMEOUT};
use super::request::VmmRequest;
use super::snapshot::SnapshotSink;
use crate::config::RunnerConfig;
use crate::error::{ResultExt, RunnerError, RunnerResult};
use crate::metrics::observe_operation;
use crate::network::{IpCache, IpPool, NetNamespace, NetNsPool, TapPool, TapPoolConfig};
use crate::runner::{shell_quote, CommandRunner, LocalRunner, SocksProxy, SpawnSpec, SshRunner};

const MIB: u64 = 1024 * 1024;
const HYPERVISOR_BINARY: &str = "cloud-hypervisor";
pub(crate) const PARENT_MARKER: &str = "parent";
pub(crate) const SOURCE_MARKER: &str = "source";

/// Lazily created per-sandbox locks
///
/// The outer std mutex only guards the map and is never held across an
/// await; the inner tokio mutex serializes operations on one sandbox.
#[derive(Default)]
pub(crate) struct SandboxLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SandboxLocks {
    pub(crate) async fn acquire(&self, sandbox_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(sandbox_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drops the lock of a destroyed sandbox unless someone is waiting on it
    pub(crate) fn forget(&self, sandbox_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(sandbox_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(sandbox_id);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Control plane for the sandboxes on one hypervisor host
pub struct Client {
    pub(crate) config: RunnerConfig,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) vmm: Arc<dyn VmmApi>,
    pub(crate) netns: Arc<NetNsPool>,
    pub(crate) taps: Arc<TapPool>,
    pub(crate) ips: Arc<IpPool>,
    pub(crate) ip_cache: Arc<IpCache>,
    pub(crate) processes: ProcessTracker,
    pub(crate) socks: Option<Arc<SocksProxy>>,
    pub(crate) snapshot_sink: Option<Arc<dyn SnapshotSink>>,
    pub(crate) locks: SandboxLocks,
}

impl Client {
    /// Builds a client for the host named in `config`
    ///
    /// An empty `ssh_host` drives the local host directly; otherwise
    /// commands go over SSH and API calls become `ch-remote` invocations.
    pub fn new(config: RunnerConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = if config.is_remote() {
            Arc::new(SshRunner::new(&config.ssh_host, &config.ssh_key_path))
        } else {
            Arc::new(LocalRunner::new())
        };
        let vmm: Arc<dyn VmmApi> = if config.is_remote() {
            Arc::new(ChRemoteApi::new(Arc::clone(&runner)))
        } else {
            Arc::new(HttpVmmApi::new())
        };
        let mut client = Self::with_parts(config, runner, vmm);
        if client.config.is_remote() {
            client.socks = Some(Arc::new(SocksProxy::new(
                &client.config.ssh_host,
                &client.config.ssh_key_path,
                client.config.socks_port,
            )));
        }
        client
    }

    /// Builds a client around explicit transports
    pub fn with_parts(
        config: RunnerConfig,
        runner: Arc<dyn CommandRunner>,
        vmm: Arc<dyn VmmApi>,
    ) -> Self {
        let netns = Arc::new(NetNsPool::new(
            Arc::clone(&runner),
            &config.sandboxes_path,
            &config.host_interface,
        ));
        let taps = Arc::new(TapPool::new(
            Arc::clone(&runner),
            TapPoolConfig {
                bridge: config.bridge_name.clone(),
                create_script: config.tap_create_script.clone(),
                delete_script: config.tap_delete_script.clone(),
                target_size: config.tap_pool_size,
                max_size: config.tap_pool_max,
            },
        ));
        let processes = ProcessTracker::new(Arc::clone(&runner), Arc::clone(&vmm));

        Self {
            config,
            runner,
            vmm,
            netns,
            taps,
            ips: Arc::new(IpPool::default()),
            ip_cache: Arc::new(IpCache::new()),
            processes,
            socks: None,
            snapshot_sink: None,
            locks: SandboxLocks::default(),
        }
    }

    /// Hands finished snapshot directories to `sink`
    pub fn with_snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshot_sink = Some(sink);
        self
    }

    /// Creates the working directories and rebuilds pool state from disk
    pub async fn initialize(&self) -> RunnerResult<()> {
        self.ensure_directories().await?;
        self.netns.initialize().await?;
        self.ips
            .initialize(self.runner.as_ref(), &self.config.sandboxes_path)
            .await?;
        self.taps.initialize(&self.config.sandboxes_path).await?;
        info!(
            remote = self.is_remote(),
            sandboxes = %self.config.sandboxes_path,
            "client initialized"
        );
        Ok(())
    }

    pub async fn ensure_directories(&self) -> RunnerResult<()> {
        for dir in [
            &self.config.sandboxes_path,
            &self.config.snapshots_path,
            &self.config.sockets_path,
        ] {
            self.runner
                .create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir))?;
        }
        Ok(())
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn is_remote(&self) -> bool {
        self.runner.is_remote()
    }

    pub fn netns_pool(&self) -> &Arc<NetNsPool> {
        &self.netns
    }

    pub fn tap_pool(&self) -> &Arc<TapPool> {
        &self.taps
    }

    pub fn ip_pool(&self) -> &Arc<IpPool> {
        &self.ips
    }

    pub fn ip_cache(&self) -> &Arc<IpCache> {
        &self.ip_cache
    }

    pub fn processes(&self) -> &ProcessTracker {
        &self.processes
    }

    pub(crate) async fn lock(&self, sandbox_id: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(sandbox_id).await
    }

    /// Number of live per-sandbox locks
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // API plumbing
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) async fn api(&self, sandbox_id: &str, request: VmmRequest) -> RunnerResult<String> {
        let socket = self.config.socket_path(sandbox_id);
        self.vmm.call(&socket, &request).await
    }

    pub async fn ping(&self, sandbox_id: &str) -> RunnerResult<()> {
        self.api(sandbox_id, VmmRequest::Ping).await.map(|_| ())
    }

    pub async fn get_info(&self, sandbox_id: &str) -> RunnerResult<VmInfo> {
        let socket = self.config.socket_path(sandbox_id);
        lifecycle::fetch_info(self.vmm.as_ref(), &socket)
            .await
            .with_context(|| format!("failed to get info for sandbox {}", sandbox_id))
    }

    /// Fetches fresh state and rejects the operation unless it is allowed
    pub(crate) async fn require_state(
        &self,
        sandbox_id: &str,
        operation: &'static str,
        allowed: &[VmState],
    ) -> RunnerResult<VmInfo> {
        let info = self.get_info(sandbox_id).await?;
        if !allowed.contains(&info.state) {
            return Err(RunnerError::InvalidState {
                sandbox_id: sandbox_id.to_string(),
                operation,
                state: info.state,
            });
        }
        Ok(info)
    }

    pub(crate) async fn wait_for_state(
        &self,
        sandbox_id: &str,
        target: VmState,
        timeout: Duration,
    ) -> RunnerResult<VmInfo> {
        let socket = self.config.socket_path(sandbox_id);
        lifecycle::wait_for_state(self.vmm.as_ref(), &socket, target, timeout).await
    }

    pub(crate) async fn socket_exists(&self, sandbox_id: &str) -> bool {
        self.runner
            .file_exists(&self.config.socket_path(sandbox_id))
            .await
            .unwrap_or(false)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Hypervisor process
    // ─────────────────────────────────────────────────────────────────────────

    /// Starts a hypervisor for `sandbox_id`, inside `namespace` if given,
    /// and waits for its API socket
    pub(crate) async fn start_hypervisor(
        &self,
        sandbox_id: &str,
        namespace: Option<&NetNamespace>,
        timeout: Duration,
    ) -> RunnerResult<()> {
        let socket = self.config.socket_path(sandbox_id);
        let log_path = self.config.log_path(sandbox_id);
        self.runner.remove_all(&socket).await?;

        let args = ["--api-socket", socket.as_str()];
        let spec = match namespace {
            Some(ns) => {
                self.netns
                    .spawn_in_namespace(&ns.sandbox_id, HYPERVISOR_BINARY, &args, &log_path)?
            }
            None => SpawnSpec {
                program: HYPERVISOR_BINARY.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                log_path,
            },
        };

        info!(sandbox_id, netns = ?namespace.map(|ns| &ns.name), %socket, "starting cloud-hypervisor");
        if let Some(child) = self
            .runner
            .spawn(&spec)
            .await
            .context("failed to start cloud-hypervisor")?
        {
            self.processes.track(sandbox_id, &socket, child);
        }

        if let Err(e) = lifecycle::wait_for_socket(self.runner.as_ref(), &socket, timeout).await {
            self.kill_hypervisor(sandbox_id).await;
            return Err(e);
        }
        self.processes.mark_running(sandbox_id);
        Ok(())
    }

    /// Kills the hypervisor of `sandbox_id`, tracked or not
    pub(crate) async fn kill_hypervisor(&self, sandbox_id: &str) {
        let socket = self.config.socket_path(sandbox_id);
        if self.processes.kill(sandbox_id) {
            debug!(sandbox_id, "killed tracked hypervisor process");
        }
        let script = format!(
            "pkill -f {} || true",
            shell_quote(&format!("{}.*{}", HYPERVISOR_BINARY, socket))
        );
        if let Err(e) = self.runner.run_script(&script).await {
            warn!(sandbox_id, error = %e, "failed to kill hypervisor process");
        }
    }

    /// Best-effort removal of everything a sandbox holds on the host
    ///
    /// Used after partial failures and by destroy. Errors are logged and
    /// otherwise ignored so the caller can always retry.
    pub(crate) async fn cleanup_sandbox(&self, sandbox_id: &str) {
        let socket = self.config.socket_path(sandbox_id);

        self.kill_hypervisor(sandbox_id).await;
        self.vmm.evict(&socket);
        self.release_network(sandbox_id).await;

        if let Err(e) = self
            .runner
            .remove_all(&self.config.sandbox_dir(sandbox_id))
            .await
        {
            warn!(sandbox_id, error = %e, "failed to remove sandbox directory");
        }
        if let Err(e) = self.runner.remove_all(&socket).await {
            warn!(sandbox_id, error = %e, "failed to remove API socket");
        }
        self.processes.forget(sandbox_id);
    }

    pub(crate) async fn release_network(&self, sandbox_id: &str) {
        if let Err(e) = self.netns.delete(sandbox_id).await {
            warn!(sandbox_id, error = %e, "failed to delete network namespace");
        }
        if let Err(e) = self.taps.release(sandbox_id).await {
            warn!(sandbox_id, error = %e, "failed to release TAP device");
        }
        self.ips.release(sandbox_id);
        self.ip_cache.delete(sandbox_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Boots a Created or Shutdown VM and waits for Running
    pub async fn boot(&self, sandbox_id: &str) -> RunnerResult<()> {
        let _guard = self.lock(sandbox_id).await;
        self.boot_locked(sandbox_id).await
    }

    pub(crate) async fn boot_locked(&self, sandbox_id: &str) -> RunnerResult<()> {
        let info = self
            .require_state(
                sandbox_id,
                "boot",
                &[VmState::Created, VmState::Shutdown, VmState::Running],
            )
            .await?;
        if info.state == VmState::Running {
            return Ok(());
        }

        self.api(sandbox_id, VmmRequest::Boot)
            .await
            .context("failed to boot VM")?;
        self.wait_for_state(sandbox_id, VmState::Running, STATE_TIMEOUT)
            .await?;
        info!(sandbox_id, "VM booted");
        Ok(())
    }

    /// Pauses a Running VM. Pausing a Paused VM is a no-op.
    pub async fn pause(&self, sandbox_id: &str) -> RunnerResult<()> {
        let _guard = self.lock(sandbox_id).await;
        let info = self
            .require_state(sandbox_id, "pause", &[VmState::Running, VmState::Paused])
            .await?;
        if info.state == VmState::Paused {
            return Ok(());
        }
        self.api(sandbox_id, VmmRequest::Pause)
            .await
            .context("failed to pause VM")?;
        info!(sandbox_id, "VM paused");
        Ok(())
    }

    /// Resumes a Paused VM. Resuming a Running VM is a no-op.
    pub async fn resume(&self, sandbox_id: &str) -> RunnerResult<()> {
        let _guard = self.lock(sandbox_id).await;
        let info = self
            .require_state(sandbox_id, "resume", &[VmState::Running, VmState::Paused])
            .await?;
        if info.state == VmState::Running {
            return Ok(());
        }
        self.api(sandbox_id, VmmRequest::Resume)
            .await
            .context("failed to resume VM")?;
        info!(sandbox_id, "VM resumed");
        Ok(())
    }

    /// Powers the VM off
    ///
    /// Sends the ACPI power button and waits for Shutdown. If the guest does
    /// not comply in time the VM is shut down forcibly, and if even that
    /// fails the hypervisor process is killed.
    pub async fn shutdown(&self, sandbox_id: &str) -> RunnerResult<()> {
        let _guard = self.lock(sandbox_id).await;
        self.shutdown_locked(sandbox_id).await
    }

    /// Alias of [`Client::shutdown`]
    pub async fn stop(&self, sandbox_id: &str) -> RunnerResult<()> {
        self.shutdown(sandbox_id).await
    }

    pub(crate) async fn shutdown_locked(&self, sandbox_id: &str) -> RunnerResult<()> {
        let info = self
            .require_state(
                sandbox_id,
                "shutdown",
                &[VmState::Running, VmState::Paused, VmState::Shutdown],
            )
            .await?;
        if info.state == VmState::Shutdown {
            return Ok(());
        }
        if info.state == VmState::Paused {
            self.api(sandbox_id, VmmRequest::Resume)
                .await
                .context("failed to resume VM before shutdown")?;
        }

        if let Err(e) = self.api(sandbox_id, VmmRequest::PowerButton).await {
            warn!(sandbox_id, error = %e, "power button failed");
        }
        let grace = self.config.graceful_shutdown_timeout;
        match self.wait_for_state(sandbox_id, VmState::Shutdown, grace).await {
            Ok(_) => {
                info!(sandbox_id, "VM shut down gracefully");
                return Ok(());
            }
            Err(e) => warn!(sandbox_id, error = %e, "graceful shutdown timed out, forcing"),
        }

        if let Err(e) = self.api(sandbox_id, VmmRequest::Shutdown).await {
            warn!(sandbox_id, error = %e, "forced shutdown failed, killing hypervisor");
            self.kill_hypervisor(sandbox_id).await;
        }
        Ok(())
    }

    /// Brings a sandbox to Running from whatever state it is in
    ///
    /// A missing API socket means the hypervisor is gone, so the sandbox
    /// is recovered from its directory first.
    pub async fn start(&self, sandbox_id: &str) -> RunnerResult<SandboxInfo> {
        let started = Instant::now();
        let _guard = self.lock(sandbox_id).await;
        let result = self.start_locked(sandbox_id).await;
        observe_operation("start", started, &result);
        result?;
        self.get_sandbox_info(sandbox_id).await
    }

    async fn start_locked(&self, sandbox_id: &str) -> RunnerResult<()> {
        if !self.socket_exists(sandbox_id).await {
            info!(sandbox_id, "API socket missing, recovering sandbox");
            return self.recover_sandbox_locked(sandbox_id).await;
        }

        let info = self.get_info(sandbox_id).await?;
        match info.state {
            VmState::Running => Ok(()),
            VmState::Created | VmState::Shutdown => self.boot_locked(sandbox_id).await,
            VmState::Paused => self
                .api(sandbox_id, VmmRequest::Resume)
                .await
                .map(|_| ())
                .context("failed to resume VM"),
            VmState::NotCreated => Err(RunnerError::InvalidState {
                sandbox_id: sandbox_id.to_string(),
                operation: "start",
                state: info.state,
            }),
        }
    }

    pub async fn reboot(&self, sandbox_id: &str) -> RunnerResult<()> {
        let _guard = self.lock(sandbox_id).await;
        self.require_state(sandbox_id, "reboot", &[VmState::Running])
            .await?;
        self.api(sandbox_id, VmmRequest::Reboot)
            .await
            .context("failed to reboot VM")?;
        info!(sandbox_id, "VM rebooted");
        Ok(())
    }

    /// Hot-resizes vCPUs and/or memory of a Running or Paused VM
    pub async fn resize(
        &self,
        sandbox_id: &str,
        vcpus: Option<u32>,
        memory_mb: Option<u64>,
    ) -> RunnerResult<()> {
        if vcpus.is_none() && memory_mb.is_none() {
            return Err(RunnerError::InvalidArgument(
                "resize needs vcpus or memory".to_string(),
            ));
        }
        let _guard = self.lock(sandbox_id).await;
        self.require_state(sandbox_id, "resize", &[VmState::Running, VmState::Paused])
            .await?;

        let request = ResizeConfig {
            desired_vcpus: vcpus,
            desired_ram: memory_mb.map(|mb| mb * MIB),
            desired_balloon: None,
        };
        self.api(sandbox_id, VmmRequest::Resize(request))
            .await
            .context("failed to resize VM")?;
        info!(sandbox_id, ?vcpus, ?memory_mb, "VM resized");
        Ok(())
    }

    /// Sets the balloon to `size_bytes`. Used by the memory controller.
    pub async fn resize_balloon(&self, sandbox_id: &str, size_bytes: u64) -> RunnerResult<()> {
        let _guard = self.lock(sandbox_id).await;
        self.require_state(
            sandbox_id,
            "resize balloon",
            &[VmState::Running, VmState::Paused],
        )
        .await?;
        let request = ResizeConfig {
            desired_balloon: Some(size_bytes),
            ..Default::default()
        };
        self.api(sandbox_id, VmmRequest::Resize(request))
            .await
            .context("failed to resize balloon")?;
        Ok(())
    }

    pub async fn resize_disk(&self, sandbox_id: &str, disk_id: &str, new_size: u64) -> RunnerResult<()> {
        let _guard = self.lock(sandbox_id).await;
        self.require_state(sandbox_id, "resize disk", &[VmState::Running, VmState::Paused])
            .await?;
        let request = ResizeDiskConfig {
            disk_id: disk_id.to_string(),
            new_size,
        };
        self.api(sandbox_id, VmmRequest::ResizeDisk(request))
            .await
            .context("failed to resize disk")?;
        info!(sandbox_id, disk_id, new_size, "disk resized");
        Ok(())
    }

    /// Hot-plugs a VFIO device and returns the hypervisor's response
    pub async fn add_device(&self, sandbox_id: &str, device: DeviceConfig) -> RunnerResult<String> {
        let _guard = self.lock(sandbox_id).await;
        self.require_state(sandbox_id, "add device", &[VmState::Running, VmState::Paused])
            .await?;
        let path = device.path.clone();
        let response = self
            .api(sandbox_id, VmmRequest::AddDevice(device))
            .await
            .with_context(|| format!("failed to add device {}", path))?;
        info!(sandbox_id, %path, "device added");
        Ok(response)
    }

    pub async fn remove_device(&self, sandbox_id: &str, device_id: &str) -> RunnerResult<()> {
        let _guard = self.lock(sandbox_id).await;
        self.require_state(sandbox_id, "remove device", &[VmState::Running, VmState::Paused])
            .await?;
        let request = RemoveDeviceConfig {
            id: device_id.to_string(),
        };
        self.api(sandbox_id, VmmRequest::RemoveDevice(request))
            .await
            .with_context(|| format!("failed to remove device {}", device_id))?;
        info!(sandbox_id, device_id, "device removed");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Destroy
    // ─────────────────────────────────────────────────────────────────────────

    /// Tears a sandbox down and releases every host resource it holds
    ///
    /// Idempotent: destroying a sandbox that does not exist succeeds.
    pub async fn destroy(&self, sandbox_id: &str) -> RunnerResult<()> {
        let started = Instant::now();
        let guard = self.lock(sandbox_id).await;
        let result = self.destroy_locked(sandbox_id).await;
        drop(guard);
        self.locks.forget(sandbox_id);
        observe_operation("destroy", started, &result);
        result
    }

    /// Same as [`Client::destroy`]; kept for callers that clean up after a
    /// sandbox is already gone.
    pub async fn remove_destroyed(&self, sandbox_id: &str) -> RunnerResult<()> {
        self.destroy(sandbox_id).await
    }

    async fn destroy_locked(&self, sandbox_id: &str) -> RunnerResult<()> {
        info!(sandbox_id, "destroying sandbox");

        if self.socket_exists(sandbox_id).await {
            for request in [VmmRequest::Shutdown, VmmRequest::Delete, VmmRequest::ShutdownVmm] {
                let endpoint = request.endpoint();
                if let Err(e) = self.api(sandbox_id, request).await {
                    debug!(sandbox_id, endpoint, error = %e, "ignoring API error during destroy");
                }
            }
        }

        self.cleanup_sandbox(sandbox_id).await;
        info!(sandbox_id, "sandbox destroyed");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Views
    // ─────────────────────────────────────────────────────────────────────────

    /// Caller-facing view of one sandbox
    pub async fn get_sandbox_info(&self, sandbox_id: &str) -> RunnerResult<SandboxInfo> {
        let vm = self.get_info(sandbox_id).await?;
        let saved = self.load_sandbox_config(sandbox_id).await.ok();

        let (vcpus, memory_mb, disk_path, gpu_devices) = match &vm.config {
            Some(config) => (
                config.cpus.as_ref().map(|c| c.boot_vcpus).unwrap_or_default(),
                config.memory.as_ref().map(|m| m.size / MIB).unwrap_or_default(),
                config
                    .disks
                    .first()
                    .map(|d| d.path.clone())
                    .unwrap_or_else(|| self.config.disk_path(sandbox_id)),
                config.devices.iter().map(|d| d.path.clone()).collect(),
            ),
            None => (0, 0, self.config.disk_path(sandbox_id), Vec::new()),
        };

        let ip_address = self
            .ip_cache
            .resolve(
                sandbox_id,
                &self.netns,
                &self.ips,
                self.runner.as_ref(),
                &self.config.sandboxes_path,
            )
            .await;
        let tap_device = self
            .taps
            .get(sandbox_id)
            .or_else(|| self.netns.get(sandbox_id).map(|ns| ns.tap_name));

        Ok(SandboxInfo {
            id: sandbox_id.to_string(),
            state: vm.state,
            vcpus,
            memory_mb,
            disk_path,
            snapshot_path: saved.as_ref().and_then(|s| s.snapshot.clone()),
            ip_address,
            tap_device,
            socket_path: self.config.socket_path(sandbox_id),
            created_at: saved.as_ref().map(|s| s.created_at).unwrap_or_else(Utc::now),
            metadata: saved.map(|s| s.metadata).unwrap_or_default(),
            gpu_devices,
            origin: self.lineage(sandbox_id).await,
        })
    }

    /// Every sandbox with a live hypervisor
    pub async fn list(&self) -> RunnerResult<Vec<SandboxInfo>> {
        let entries = self
            .runner
            .list_dir(&self.config.sandboxes_path)
            .await
            .context("failed to list sandboxes")?;

        let mut sandboxes = Vec::new();
        for sandbox_id in entries.iter().filter(|e| !e.starts_with('.')) {
            if !self.socket_exists(sandbox_id).await {
                continue;
            }
            match self.get_sandbox_info(sandbox_id).await {
                Ok(info) => sandboxes.push(info),
                Err(e) => debug!(sandbox_id = %sandbox_id, error = %e, "skipping unreachable sandbox"),
            }
        }
        Ok(sandboxes)
    }

    async fn lineage(&self, sandbox_id: &str) -> Option<Lineage> {
        if let Some(parent) = self.read_marker(sandbox_id, PARENT_MARKER).await {
            return Some(Lineage::Parent(parent));
        }
        self.read_marker(sandbox_id, SOURCE_MARKER)
            .await
            .map(Lineage::Source)
    }

    /// Trimmed contents of a small marker file, if present and non-empty
    pub(crate) async fn read_marker(&self, sandbox_id: &str, name: &str) -> Option<String> {
        let raw = self
            .runner
            .read_file(&self.config.sandbox_file(sandbox_id, name))
            .await
            .ok()?;
        let value = raw.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    pub(crate) async fn write_marker(&self, sandbox_id: &str, name: &str, value: &str) -> RunnerResult<()> {
        self.runner
            .write_file(&self.config.sandbox_file(sandbox_id, name), value.as_bytes())
            .await
            .with_context(|| format!("failed to write {} marker", name))
    }

    /// Drops cached API transports and stops the SOCKS tunnel
    pub async fn close(&self) {
        self.vmm.evict_all();
        if let Some(socks) = &self.socks {
            socks.close().await;
        }
        info!("client closed");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("remote", &self.is_remote())
            .field("sandboxes_path", &self.config.sandboxes_path)
            .field("processes", &self.processes)
            .finish()
    }
}

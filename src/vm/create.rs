//! Sandbox creation
//!
//! Two paths lead to a running sandbox:
//!
//! - **cold**: a copy-on-write overlay on the base image (or a disk-only
//!   snapshot), a cloud-init seed, `vm.create` + `vm.boot`
//! - **warm**: the snapshot carries memory state, so the overlay is attached
//!   to a restored VM instead of booting one

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use super::client::Client;
use super::cloud_init::{self, CloudInitConfig};
use super::config::{
    BalloonConfig, ConsoleConfig, CpusConfig, DeviceConfig, DiskConfig, MemoryConfig, NetConfig,
    PayloadConfig, RestoreConfig, RngConfig, SandboxInfo, VmConfig, VmState,
};
use super::lifecycle::{SOCKET_TIMEOUT, STATE_TIMEOUT};
use super::recovery::SandboxConfig;
use super::request::VmmRequest;
use super::snapshot::validate_snapshot_ref;
use crate::config::{NetworkMode, RunnerConfig};
use crate::error::{ResultExt, RunnerError, RunnerResult};
use crate::metrics::observe_operation;
use crate::network::ip_cache::IP_MARKER;
use crate::network::netns::{GUEST_PREFIX_LEN, NAMESPACE_TAP};
use crate::network::tap_pool::TAP_MARKER;
use crate::network::SandboxNetwork;
use crate::runner::shell_quote;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;
const MIN_MEMORY_MB: u64 = 1024;
const MEMORY_ALIGN_MB: u64 = 128;
pub const NET_DEVICE_ID: &str = "_net0";
const KERNEL_CMDLINE: &str = "console=ttyS0 root=LABEL=cloudimg-rootfs rw";
const WARM_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
const DAEMON_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DAEMON_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameters of a new sandbox. Unset sizes fall back to the runner defaults.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct CreateOptions {
    #[builder(setter(into))]
    pub sandbox_id: String,
    #[builder(default, setter(strip_option))]
    pub cpus: Option<u32>,
    #[builder(default, setter(strip_option))]
    pub memory_mb: Option<u64>,
    #[builder(default, setter(strip_option))]
    pub storage_gb: Option<u64>,
    /// Snapshot reference under the snapshots directory, e.g. `org/name`
    #[builder(default, setter(strip_option, into))]
    pub snapshot: Option<String>,
    #[builder(default, setter(strip_option, into))]
    pub organization_id: Option<String>,
    #[builder(default)]
    pub metadata: HashMap<String, String>,
    /// VFIO device paths passed through to the guest
    #[builder(default)]
    pub gpu_devices: Vec<String>,
    /// Appended to the kernel command line
    #[builder(default, setter(strip_option, into))]
    pub kernel_args: Option<String>,
}

/// Resolved VM shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub cpus: u32,
    pub memory_mb: u64,
    pub storage_gb: u64,
}

impl Resources {
    pub fn resolve(options: &CreateOptions, config: &RunnerConfig) -> Self {
        let cpus = options
            .cpus
            .filter(|c| *c > 0)
            .unwrap_or(config.default_cpus);
        let memory_mb = options
            .memory_mb
            .filter(|m| *m > 0)
            .unwrap_or(config.default_memory_mb)
            .max(MIN_MEMORY_MB);
        let storage_gb = options
            .storage_gb
            .filter(|s| *s > 0)
            .unwrap_or(config.default_storage_gb);

        Self {
            cpus,
            memory_mb: memory_mb.div_ceil(MEMORY_ALIGN_MB) * MEMORY_ALIGN_MB,
            storage_gb,
        }
    }
}

/// Everything [`build_vm_config`] needs to describe one VM
pub(crate) struct VmSpec<'a> {
    pub sandbox_id: &'a str,
    pub cpus: u32,
    pub memory_mb: u64,
    pub tap: &'a str,
    pub mac: &'a str,
    pub cloud_init_iso: Option<&'a str>,
    pub gpu_devices: &'a [String],
    pub kernel_args: Option<&'a str>,
}

/// Locally administered MAC derived from the sandbox id
pub fn mac_address(sandbox_id: &str) -> String {
    let digest = Sha256::digest(sandbox_id.as_bytes());
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2], digest[3], digest[4]
    )
}

/// Rejects ids that cannot name a directory
pub(crate) fn validate_sandbox_id(sandbox_id: &str) -> RunnerResult<()> {
    if sandbox_id.is_empty()
        || sandbox_id.contains('/')
        || sandbox_id.starts_with('.')
        || sandbox_id.chars().any(char::is_whitespace)
    {
        return Err(RunnerError::InvalidArgument(format!(
            "invalid sandbox id {:?}",
            sandbox_id
        )));
    }
    Ok(())
}

pub(crate) fn build_vm_config(config: &RunnerConfig, spec: &VmSpec<'_>) -> VmConfig {
    let mut cmdline = KERNEL_CMDLINE.to_string();
    if let Some(extra) = spec.kernel_args.filter(|a| !a.trim().is_empty()) {
        cmdline.push(' ');
        cmdline.push_str(extra.trim());
    }

    let payload = if config.kernel_path.is_empty() {
        PayloadConfig {
            firmware: Some(config.firmware_path.clone()),
            ..Default::default()
        }
    } else {
        PayloadConfig {
            kernel: Some(config.kernel_path.clone()),
            cmdline: Some(cmdline),
            initramfs: config.initramfs_path.clone(),
            firmware: None,
        }
    };

    let mut disks = vec![DiskConfig {
        path: config.disk_path(spec.sandbox_id),
        ..Default::default()
    }];
    if let Some(iso) = spec.cloud_init_iso {
        disks.push(DiskConfig {
            path: iso.to_string(),
            readonly: true,
            ..Default::default()
        });
    }

    let memory = spec.memory_mb * MIB;
    let devices: Vec<DeviceConfig> = spec
        .gpu_devices
        .iter()
        .enumerate()
        .map(|(i, path)| DeviceConfig {
            path: path.clone(),
            iommu: true,
            id: Some(format!("gpu{}", i)),
        })
        .collect();

    VmConfig {
        payload: Some(payload),
        disks,
        net: vec![NetConfig {
            tap: Some(spec.tap.to_string()),
            mac: Some(spec.mac.to_string()),
            id: Some(NET_DEVICE_ID.to_string()),
            ..Default::default()
        }],
        cpus: Some(CpusConfig {
            boot_vcpus: spec.cpus,
            max_vcpus: spec.cpus * 2,
        }),
        memory: Some(MemoryConfig {
            size: memory,
            hotplug_method: Some("VirtioMem".to_string()),
            hotplug_size: Some(memory),
            thp: true,
            ..Default::default()
        }),
        serial: Some(ConsoleConfig::mode("Tty")),
        console: Some(ConsoleConfig::mode("Off")),
        iommu: !devices.is_empty(),
        devices,
        rng: Some(RngConfig {
            src: "/dev/urandom".to_string(),
        }),
        balloon: Some(BalloonConfig {
            size: 0,
            deflate_on_oom: true,
            free_page_reporting: true,
        }),
    }
}

#[derive(Deserialize)]
struct ImageInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

impl Client {
    /// Creates and starts a sandbox
    ///
    /// Creating an id whose hypervisor is already up returns its info. An id
    /// with a disk but no hypervisor must be recovered instead. On failure
    /// everything allocated so far is released.
    pub async fn create(&self, options: CreateOptions) -> RunnerResult<SandboxInfo> {
        validate_sandbox_id(&options.sandbox_id)?;
        if let Some(snapshot) = &options.snapshot {
            validate_snapshot_ref(snapshot)?;
        }
        let started = Instant::now();
        let _guard = self.lock(&options.sandbox_id).await;
        let result = self.create_locked(&options).await;
        observe_operation("create", started, &result);
        result
    }

    async fn create_locked(&self, options: &CreateOptions) -> RunnerResult<SandboxInfo> {
        let sandbox_id = options.sandbox_id.as_str();

        if self.socket_exists(sandbox_id).await {
            info!(sandbox_id, "sandbox already running");
            return self.get_sandbox_info(sandbox_id).await;
        }
        if self
            .runner
            .file_exists(&self.config.disk_path(sandbox_id))
            .await?
        {
            return Err(RunnerError::NeedsRecovery(sandbox_id.to_string()));
        }

        let warm = match &options.snapshot {
            Some(snapshot) => self.is_warm_snapshot(snapshot).await,
            None => false,
        };
        info!(
            sandbox_id,
            snapshot = ?options.snapshot,
            warm,
            "creating sandbox"
        );

        let result = match (&options.snapshot, warm) {
            (Some(snapshot), true) => self.create_warm(options, snapshot).await,
            _ => self.create_cold(options).await,
        };
        if let Err(e) = result {
            warn!(sandbox_id, error = %e, "create failed, cleaning up");
            self.cleanup_sandbox(sandbox_id).await;
            return Err(e);
        }

        self.update_sandbox_state(sandbox_id, VmState::Running).await;
        info!(sandbox_id, "sandbox created");
        self.get_sandbox_info(sandbox_id).await
    }

    /// A snapshot with memory state can be restored instead of booted
    pub async fn is_warm_snapshot(&self, snapshot: &str) -> bool {
        let dir = self.config.snapshot_path(snapshot);
        for file in ["memory-ranges", "disk.qcow2"] {
            if !self
                .runner
                .file_exists(&format!("{}/{}", dir, file))
                .await
                .unwrap_or(false)
            {
                return false;
            }
        }
        true
    }

    async fn create_cold(&self, options: &CreateOptions) -> RunnerResult<()> {
        let sandbox_id = options.sandbox_id.as_str();
        let resources = Resources::resolve(options, &self.config);

        let base = match &options.snapshot {
            Some(snapshot) => format!("{}/disk.qcow2", self.config.snapshot_path(snapshot)),
            None => self.config.base_image_path.clone(),
        };
        self.create_disk(sandbox_id, &base, resources.storage_gb)
            .await?;

        let network = self.attach_network(sandbox_id).await?;
        self.record_ip(sandbox_id, &network.reachable_ip().to_string())
            .await?;

        let mac = mac_address(sandbox_id);
        let prefix_len = match &network {
            SandboxNetwork::Namespace(_) => GUEST_PREFIX_LEN,
            SandboxNetwork::Bridge { .. } => self.ips.prefix_len(),
        };
        let iso = cloud_init::build_iso(
            self.runner.as_ref(),
            &self.config.sandbox_dir(sandbox_id),
            &CloudInitConfig::new(sandbox_id, &mac, &network, prefix_len),
        )
        .await
        .context("failed to build cloud-init ISO")?;

        let vm_config = build_vm_config(
            &self.config,
            &VmSpec {
                sandbox_id,
                cpus: resources.cpus,
                memory_mb: resources.memory_mb,
                tap: network.tap_name(),
                mac: &mac,
                cloud_init_iso: Some(&iso),
                gpu_devices: &options.gpu_devices,
                kernel_args: options.kernel_args.as_deref(),
            },
        );
        self.runner
            .write_file(
                &self.config.config_path(sandbox_id),
                &serde_json::to_vec_pretty(&vm_config)?,
            )
            .await
            .context("failed to write config.json")?;

        let mut saved = self.new_sandbox_config(options, &resources);
        if let Some(ns) = network.namespace() {
            saved = saved.with_namespace(ns);
        }
        self.save_sandbox_config(&saved).await?;

        self.start_hypervisor(sandbox_id, network.namespace(), SOCKET_TIMEOUT)
            .await?;
        self.api(sandbox_id, VmmRequest::Create(Box::new(vm_config)))
            .await
            .context("failed to create VM")?;
        self.api(sandbox_id, VmmRequest::Boot)
            .await
            .context("failed to boot VM")?;
        self.wait_for_state(sandbox_id, VmState::Running, STATE_TIMEOUT)
            .await?;

        self.wait_for_daemon(sandbox_id, &network.reachable_ip().to_string())
            .await;
        Ok(())
    }

    async fn create_warm(&self, options: &CreateOptions, snapshot: &str) -> RunnerResult<()> {
        let sandbox_id = options.sandbox_id.as_str();
        let resources = Resources::resolve(options, &self.config);
        let snapshot_dir = self.config.snapshot_path(snapshot);
        let golden = format!("{}/disk.qcow2", snapshot_dir);
        let disk = self.config.disk_path(sandbox_id);

        let size_gb = resources
            .storage_gb
            .max(self.virtual_size_gb(&golden).await?);
        self.runner
            .create_dir_all(&self.config.sandbox_dir(sandbox_id))
            .await?;
        self.runner
            .run(
                "qemu-img",
                &[
                    "create",
                    "-f",
                    "qcow2",
                    "-F",
                    "qcow2",
                    "-b",
                    &golden,
                    &disk,
                    &format!("{}G", size_gb),
                ],
            )
            .await
            .context("failed to create disk overlay")?;

        let ns = self
            .netns
            .create(sandbox_id)
            .await
            .context("failed to create network namespace")?;
        self.record_ip(sandbox_id, &ns.external_ip.to_string())
            .await?;

        let staged = self
            .stage_restore_dir(sandbox_id, &snapshot_dir, Some(NAMESPACE_TAP))
            .await?;

        let mut saved = self.new_sandbox_config(options, &resources).with_namespace(&ns);
        saved.snapshot = Some(snapshot.to_string());
        self.save_sandbox_config(&saved).await?;

        self.start_hypervisor(sandbox_id, Some(&ns), WARM_SOCKET_TIMEOUT)
            .await?;
        self.api(
            sandbox_id,
            VmmRequest::Restore(RestoreConfig::from_dir(&staged, false)),
        )
        .await
        .context("failed to restore snapshot")?;
        self.resume_restored(sandbox_id).await?;

        if let Err(e) = self.runner.remove_all(&staged).await {
            warn!(sandbox_id, error = %e, "failed to remove staged snapshot");
        }
        self.save_vm_config(sandbox_id).await?;
        self.wait_for_daemon(sandbox_id, &ns.external_ip.to_string())
            .await;
        Ok(())
    }

    /// Creates the overlay disk in one round trip
    async fn create_disk(&self, sandbox_id: &str, base: &str, size_gb: u64) -> RunnerResult<()> {
        let disk = shell_quote(&self.config.disk_path(sandbox_id));
        let quoted_base = shell_quote(base);
        let script = format!(
            "if [ -f {disk} ]; then echo EXISTS; exit 0; fi; \
             if [ ! -f {base} ]; then echo BASE_NOT_FOUND; exit 1; fi; \
             mkdir -p {dir} && qemu-img create -f qcow2 -F qcow2 -b {base} {disk} {size}G && echo CREATED",
            disk = disk,
            base = quoted_base,
            dir = shell_quote(&self.config.sandbox_dir(sandbox_id)),
            size = size_gb,
        );

        match self.runner.run_script(&script).await {
            Ok(out) if out.contains("EXISTS") => {
                debug!(sandbox_id, "disk already exists");
                Ok(())
            }
            Ok(_) => {
                debug!(sandbox_id, size_gb, "disk created");
                Ok(())
            }
            Err(e) if e.to_string().contains("BASE_NOT_FOUND") => {
                Err(RunnerError::NotFound(format!("base image {}", base)))
            }
            Err(e) => Err(e).context("failed to create disk"),
        }
    }

    async fn virtual_size_gb(&self, image: &str) -> RunnerResult<u64> {
        let out = self
            .runner
            .run("qemu-img", &["info", "--output=json", image])
            .await
            .with_context(|| format!("failed to inspect {}", image))?;
        let info: ImageInfo = serde_json::from_str(&out)?;
        Ok(info.virtual_size.div_ceil(GIB))
    }

    async fn attach_network(&self, sandbox_id: &str) -> RunnerResult<SandboxNetwork> {
        match self.config.network_mode {
            NetworkMode::Namespace => self
                .netns
                .create(sandbox_id)
                .await
                .map(SandboxNetwork::Namespace)
                .context("failed to create network namespace"),
            NetworkMode::Bridge => {
                let tap = self
                    .taps
                    .acquire(sandbox_id)
                    .await
                    .context("failed to acquire TAP device")?;
                let ip = match self.ips.allocate(sandbox_id) {
                    Ok(ip) => ip,
                    Err(e) => {
                        if let Err(release) = self.taps.release(sandbox_id).await {
                            warn!(sandbox_id, error = %release, "failed to release TAP device");
                        }
                        return Err(e).context("failed to allocate IP");
                    }
                };
                self.write_marker(sandbox_id, TAP_MARKER, &tap).await?;
                Ok(SandboxNetwork::Bridge {
                    tap,
                    ip,
                    gateway: self.ips.gateway(),
                    netmask: self.ips.netmask(),
                })
            }
        }
    }

    /// Persists the reachable IP and caches it
    pub(crate) async fn record_ip(&self, sandbox_id: &str, ip: &str) -> RunnerResult<()> {
        self.write_marker(sandbox_id, IP_MARKER, ip).await?;
        self.ip_cache.set(sandbox_id, ip);
        Ok(())
    }

    fn new_sandbox_config(&self, options: &CreateOptions, resources: &Resources) -> SandboxConfig {
        SandboxConfig {
            sandbox_id: options.sandbox_id.clone(),
            cpus: resources.cpus,
            memory_mb: resources.memory_mb,
            storage_gb: resources.storage_gb,
            snapshot: options.snapshot.clone(),
            organization_id: options.organization_id.clone(),
            metadata: options.metadata.clone(),
            netns_id: None,
            external_ip: None,
            guest_ip: None,
            gpu_devices: options.gpu_devices.clone(),
            kernel_args: options.kernel_args.clone(),
            created_at: Utc::now(),
            last_state: Some(VmState::Created),
        }
    }

    /// Waits for the in-guest daemon to answer `/version`
    ///
    /// Only warns on timeout: the VM is up, the daemon may just be slow.
    async fn wait_for_daemon(&self, sandbox_id: &str, ip: &str) {
        let timeout = self.config.daemon_wait_timeout;
        if timeout.is_zero() {
            return;
        }

        let client = match &self.socks {
            Some(socks) => socks.http_client(DAEMON_REQUEST_TIMEOUT).await,
            None => reqwest::Client::builder()
                .timeout(DAEMON_REQUEST_TIMEOUT)
                .build()
                .map_err(RunnerError::from),
        };
        let client = match client {
            Ok(client) => client,
            Err(e) => {
                warn!(sandbox_id, error = %e, "cannot build daemon health client");
                return;
            }
        };

        let url = format!("http://{}:{}/version", ip, self.config.daemon_port);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(sandbox_id, "guest daemon ready");
                    return;
                }
                Ok(resp) => debug!(sandbox_id, status = %resp.status(), "guest daemon not ready"),
                Err(e) => debug!(sandbox_id, error = %e, "guest daemon unreachable"),
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(sandbox_id, ?timeout, "guest daemon did not become ready");
                return;
            }
            tokio::time::sleep(DAEMON_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_is_clamped_and_aligned() {
        let config = RunnerConfig::default();
        let resolve = |mb| {
            Resources::resolve(
                &CreateOptions::builder().sandbox_id("a").memory_mb(mb).build(),
                &config,
            )
            .memory_mb
        };
        assert_eq!(resolve(512), 1024);
        assert_eq!(resolve(1100), 1152);
        assert_eq!(resolve(4096), 4096);
        assert_eq!(resolve(0), 2048);
    }

    #[test]
    fn test_zero_sizes_use_defaults() {
        let config = RunnerConfig::builder().default_cpus(4).build();
        let options = CreateOptions::builder()
            .sandbox_id("a")
            .cpus(0)
            .storage_gb(0)
            .build();
        let resources = Resources::resolve(&options, &config);
        assert_eq!(resources.cpus, 4);
        assert_eq!(resources.storage_gb, 20);
    }

    #[test]
    fn test_mac_is_stable_and_local() {
        let mac = mac_address("sandbox-1");
        assert_eq!(mac, mac_address("sandbox-1"));
        assert_ne!(mac, mac_address("sandbox-2"));
        assert!(mac.starts_with("02:"));
        assert_eq!(mac.split(':').count(), 6);
    }

    #[test]
    fn test_sandbox_id_validation() {
        assert!(validate_sandbox_id("sb-1").is_ok());
        assert!(validate_sandbox_id("").is_err());
        assert!(validate_sandbox_id("../etc").is_err());
        assert!(validate_sandbox_id(".stats").is_err());
        assert!(validate_sandbox_id("a b").is_err());
    }

    #[test]
    fn test_vm_config_shape() {
        let config = RunnerConfig::builder().sandboxes_path("/sb").build();
        let gpus = vec!["/sys/bus/pci/devices/0000:41:00.0".to_string()];
        let vm = build_vm_config(
            &config,
            &VmSpec {
                sandbox_id: "a",
                cpus: 2,
                memory_mb: 2048,
                tap: "tap0",
                mac: "02:00:00:00:00:01",
                cloud_init_iso: Some("/sb/a/cloud-init.iso"),
                gpu_devices: &gpus,
                kernel_args: Some("quiet"),
            },
        );

        let payload = vm.payload.unwrap();
        assert_eq!(
            payload.cmdline.as_deref(),
            Some("console=ttyS0 root=LABEL=cloudimg-rootfs rw quiet")
        );
        assert_eq!(vm.disks[0].path, "/sb/a/disk.raw");
        assert!(vm.disks[1].readonly);
        assert_eq!(vm.cpus.unwrap().max_vcpus, 4);
        let memory = vm.memory.unwrap();
        assert_eq!(memory.size, 2 * GIB);
        assert_eq!(memory.hotplug_size, Some(2 * GIB));
        assert_eq!(vm.net[0].id.as_deref(), Some(NET_DEVICE_ID));
        assert_eq!(vm.devices[0].id.as_deref(), Some("gpu0"));
        assert!(vm.iommu);
        assert!(vm.balloon.unwrap().free_page_reporting);
    }

    #[test]
    fn test_firmware_payload_without_kernel() {
        let config = RunnerConfig::builder().kernel_path("").build();
        let vm = build_vm_config(
            &config,
            &VmSpec {
                sandbox_id: "a",
                cpus: 1,
                memory_mb: 1024,
                tap: "tap0",
                mac: "02:00:00:00:00:01",
                cloud_init_iso: None,
                gpu_devices: &[],
                kernel_args: None,
            },
        );
        let payload = vm.payload.unwrap();
        assert!(payload.kernel.is_none());
        assert!(payload.firmware.is_some());
        assert_eq!(vm.disks.len(), 1);
        assert!(!vm.iommu);
    }
}

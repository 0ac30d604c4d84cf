//! Runner configuration
//!
//! All settings have defaults suitable for a single Cloud Hypervisor host.
//! [`RunnerConfig::from_env`] overlays environment variables (and a `.env`
//! file, if present) on top of those defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::error::{RunnerError, RunnerResult};

/// Paths, defaults and host settings shared by every component
#[derive(Debug, Clone, TypedBuilder)]
pub struct RunnerConfig {
    #[builder(default = "/var/lib/cloud-hypervisor/sandboxes".into(), setter(into))]
    pub sandboxes_path: String,
    #[builder(default = "/var/lib/cloud-hypervisor/snapshots".into(), setter(into))]
    pub snapshots_path: String,
    #[builder(default = "/var/run/cloud-hypervisor".into(), setter(into))]
    pub sockets_path: String,
    #[builder(default = "/var/lib/cloud-hypervisor/kernels/vmlinux".into(), setter(into))]
    pub kernel_path: String,
    #[builder(default, setter(strip_option, into))]
    pub initramfs_path: Option<String>,
    #[builder(default = "/var/lib/cloud-hypervisor/firmware/hypervisor-fw".into(), setter(into))]
    pub firmware_path: String,
    #[builder(default = "/var/lib/cloud-hypervisor/images/ubuntu-24.04-server-cloudimg-amd64.img".into(), setter(into))]
    pub base_image_path: String,

    #[builder(default = 2)]
    pub default_cpus: u32,
    #[builder(default = 2048)]
    pub default_memory_mb: u64,
    #[builder(default = 20)]
    pub default_storage_gb: u64,

    /// Bridge used by pooled TAP devices
    #[builder(default = "br0".into(), setter(into))]
    pub bridge_name: String,
    #[builder(default = "/usr/local/bin/ch-create-tap".into(), setter(into))]
    pub tap_create_script: String,
    #[builder(default = "/usr/local/bin/ch-delete-tap".into(), setter(into))]
    pub tap_delete_script: String,
    #[builder(default = false)]
    pub tap_pool_enabled: bool,
    #[builder(default = 10)]
    pub tap_pool_size: usize,
    /// Upper bound on TAP devices owned by the pool, idle or assigned
    #[builder(default = 256)]
    pub tap_pool_max: usize,
    #[builder(default)]
    pub network_mode: NetworkMode,

    /// Empty means every command runs on this host.
    #[builder(default, setter(into))]
    pub ssh_host: String,
    #[builder(default = default_ssh_key(), setter(into))]
    pub ssh_key_path: String,
    #[builder(default = 10800)]
    pub socks_port: u16,

    /// Egress interface for namespace NAT
    #[builder(default = "eth0".into(), setter(into))]
    pub host_interface: String,
    /// Port of the in-guest daemon
    #[builder(default = 2280)]
    pub daemon_port: u16,
    /// How long create waits for the daemon to answer; zero skips the check.
    #[builder(default = Duration::from_secs(30))]
    pub daemon_wait_timeout: Duration,
    /// Power-button grace period before a forced shutdown
    #[builder(default = Duration::from_secs(30))]
    pub graceful_shutdown_timeout: Duration,

    #[builder(default, setter(strip_option))]
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_ssh_key() -> String {
    match std::env::var("HOME") {
        Ok(home) => format!("{}/.ssh/id_rsa", home),
        Err(_) => "/root/.ssh/id_rsa".to_string(),
    }
}

impl RunnerConfig {
    /// Builds a configuration from the environment
    ///
    /// A `.env` file in the working directory is loaded first; variables
    /// already set in the process environment take precedence.
    pub fn from_env() -> RunnerResult<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        override_string("CH_SANDBOXES_PATH", &mut config.sandboxes_path);
        override_string("CH_SNAPSHOTS_PATH", &mut config.snapshots_path);
        override_string("CH_SOCKETS_PATH", &mut config.sockets_path);
        override_string("CH_KERNEL_PATH", &mut config.kernel_path);
        override_string("CH_FIRMWARE_PATH", &mut config.firmware_path);
        override_string("CH_BASE_IMAGE_PATH", &mut config.base_image_path);
        override_string("CH_SSH_HOST", &mut config.ssh_host);
        override_string("CH_SSH_KEY_PATH", &mut config.ssh_key_path);
        override_string("CH_BRIDGE_NAME", &mut config.bridge_name);
        override_string("CH_TAP_CREATE_SCRIPT", &mut config.tap_create_script);
        override_string("CH_TAP_DELETE_SCRIPT", &mut config.tap_delete_script);
        override_string("CH_HOST_INTERFACE", &mut config.host_interface);

        if let Some(path) = env_var("CH_INITRAMFS_PATH") {
            config.initramfs_path = Some(path);
        }
        if let Some(cpus) = env_parse("CH_DEFAULT_CPUS")? {
            config.default_cpus = cpus;
        }
        if let Some(memory) = env_parse("CH_DEFAULT_MEMORY_MB")? {
            config.default_memory_mb = memory;
        }
        if let Some(enabled) = env_var("TAP_POOL_ENABLED") {
            config.tap_pool_enabled = matches!(enabled.as_str(), "true" | "1" | "yes");
        }
        if let Some(size) = env_parse("TAP_POOL_SIZE")? {
            config.tap_pool_size = size;
        }
        if let Some(max) = env_parse("TAP_POOL_MAX")? {
            config.tap_pool_max = max;
        }
        if let Some(mode) = env_parse("CH_NETWORK_MODE")? {
            config.network_mode = mode;
        }
        if let Some(addr) = env_parse("METRICS_ADDR")? {
            config.metrics_addr = Some(addr);
        }

        Ok(config)
    }

    /// True when commands are executed over SSH
    pub fn is_remote(&self) -> bool {
        !self.ssh_host.is_empty()
    }

    pub fn socket_path(&self, sandbox_id: &str) -> String {
        format!("{}/{}.sock", self.sockets_path, sandbox_id)
    }

    pub fn sandbox_dir(&self, sandbox_id: &str) -> String {
        format!("{}/{}", self.sandboxes_path, sandbox_id)
    }

    pub fn disk_path(&self, sandbox_id: &str) -> String {
        format!("{}/{}/disk.raw", self.sandboxes_path, sandbox_id)
    }

    pub fn config_path(&self, sandbox_id: &str) -> String {
        format!("{}/{}/config.json", self.sandboxes_path, sandbox_id)
    }

    pub fn snapshot_path(&self, reference: &str) -> String {
        format!("{}/{}", self.snapshots_path, reference)
    }

    pub fn log_path(&self, sandbox_id: &str) -> String {
        format!("{}/{}/cloud-hypervisor.log", self.sandboxes_path, sandbox_id)
    }

    /// A sandbox-scoped file such as `ip`, `netns` or `parent`
    pub fn sandbox_file(&self, sandbox_id: &str, name: &str) -> String {
        format!("{}/{}/{}", self.sandboxes_path, sandbox_id, name)
    }
}

/// How freshly created sandboxes are networked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// One network namespace per sandbox
    #[default]
    Namespace,
    /// A TAP on the host bridge and an address from the flat IP pool
    Bridge,
}

impl FromStr for NetworkMode {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "namespace" | "netns" => Ok(NetworkMode::Namespace),
            "bridge" => Ok(NetworkMode::Bridge),
            other => Err(RunnerError::InvalidArgument(format!(
                "unknown network mode {:?}",
                other
            ))),
        }
    }
}

/// Tuning for the balloon control loop
#[derive(Debug, Clone)]
pub struct MemoryControllerConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Guest memory is never squeezed below this.
    pub min_guest_memory_kib: u64,
    /// Fixed headroom kept above used memory
    pub buffer_floor_kib: u64,
    /// Headroom as a share of used memory; the larger of the two wins.
    pub buffer_ratio: f64,
    /// Balloon changes smaller than this share of max memory are skipped.
    pub tolerance: f64,
}

impl Default for MemoryControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            min_guest_memory_kib: 1024 * 1024,
            buffer_floor_kib: 1024 * 1024,
            buffer_ratio: 0.25,
            tolerance: 0.01,
        }
    }
}

/// Settings for the persistent memory stats store
#[derive(Debug, Clone)]
pub struct StatsStoreConfig {
    pub data_path: PathBuf,
    pub retention_days: i64,
    pub cleanup_interval: Duration,
    pub save_interval: Duration,
    pub write_buffer_size: usize,
}

impl Default for StatsStoreConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            data_path: PathBuf::from(home).join(".chvisor"),
            retention_days: 7,
            cleanup_interval: Duration::from_secs(3600),
            save_interval: Duration::from_secs(30),
            write_buffer_size: 1000,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn override_string(key: &str, target: &mut String) {
    if let Some(value) = env_var(key) {
        *target = value;
    }
}

fn env_parse<T: FromStr>(key: &str) -> RunnerResult<Option<T>> {
    match env_var(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| RunnerError::InvalidArgument(format!("{}={:?} is not valid", key, raw))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = RunnerConfig::default();
        assert_eq!(config.socket_path("abc"), "/var/run/cloud-hypervisor/abc.sock");
        assert_eq!(
            config.disk_path("abc"),
            "/var/lib/cloud-hypervisor/sandboxes/abc/disk.raw"
        );
        assert_eq!(
            config.sandbox_file("abc", "ip"),
            "/var/lib/cloud-hypervisor/sandboxes/abc/ip"
        );
        assert!(!config.is_remote());
    }

    #[test]
    fn test_builder_overrides() {
        let config = RunnerConfig::builder()
            .sandboxes_path("/tmp/sb")
            .ssh_host("root@10.0.0.5")
            .default_cpus(4)
            .build();
        assert_eq!(config.sandbox_dir("x"), "/tmp/sb/x");
        assert!(config.is_remote());
        assert_eq!(config.default_cpus, 4);
        assert_eq!(config.daemon_port, 2280);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        std::env::set_var("CHVISOR_TEST_BAD_NUMBER", "two");
        let result: RunnerResult<Option<u32>> = env_parse("CHVISOR_TEST_BAD_NUMBER");
        assert!(matches!(result, Err(RunnerError::InvalidArgument(_))));
    }

    #[test]
    fn test_network_mode_parsing() {
        assert_eq!("bridge".parse::<NetworkMode>().unwrap(), NetworkMode::Bridge);
        assert_eq!("NetNS".parse::<NetworkMode>().unwrap(), NetworkMode::Namespace);
        assert!("vlan".parse::<NetworkMode>().is_err());
    }

    #[test]
    fn test_memory_controller_defaults() {
        let config = MemoryControllerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.buffer_ratio, 0.25);
        assert_eq!(config.min_guest_memory_kib, 1024 * 1024);
    }
}

//! Cloud Hypervisor API payloads
//!
//! These structs serialize to the JSON bodies accepted by the hypervisor's
//! REST API. Only the fields this runner sets or reads are modelled; unknown
//! fields in responses are ignored.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State reported by `vm.info`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmState {
    Created,
    Running,
    Paused,
    Shutdown,
    NotCreated,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Created => "Created",
            VmState::Running => "Running",
            VmState::Paused => "Paused",
            VmState::Shutdown => "Shutdown",
            VmState::NotCreated => "NotCreated",
        };
        f.write_str(s)
    }
}

/// Full VM configuration passed to `vm.create`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<PayloadConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<NetConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<CpusConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<ConsoleConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsoleConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng: Option<RngConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balloon: Option<BalloonConfig>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub iommu: bool,
}

/// Kernel or firmware to boot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<String>,
}

/// Block device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub readonly: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub direct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Network device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpusConfig {
    pub boot_vcpus: u32,
    pub max_vcpus: u32,
}

/// Guest memory. Sizes are in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hotplug_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hotplug_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hotplugged_size: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shared: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thp: bool,
}

/// Serial port or virtio-console. `mode` is one of Off, Pty, Tty, File, Socket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl ConsoleConfig {
    pub fn mode(mode: &str) -> Self {
        Self {
            mode: mode.to_string(),
            file: None,
        }
    }
}

/// VFIO passthrough device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub iommu: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RngConfig {
    pub src: String,
}

/// virtio-balloon. `size` is the inflated amount in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalloonConfig {
    pub size: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deflate_on_oom: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub free_page_reporting: bool,
}

/// Response body of `vm.info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<VmConfig>,
    pub state: VmState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_actual_size: Option<u64>,
}

/// Body of `vm.snapshot`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// e.g. `file:///var/lib/cloud-hypervisor/snapshots/org/name`
    pub destination_url: String,
}

/// Body of `vm.restore`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreConfig {
    pub source_url: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub prefault: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net_fds: Vec<NetFd>,
}

impl RestoreConfig {
    pub fn from_dir(dir: &str, prefault: bool) -> Self {
        Self {
            source_url: format!("file://{}", dir),
            prefault,
            net_fds: Vec::new(),
        }
    }
}

/// Maps a network device id to indices in the SCM_RIGHTS array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetFd {
    pub id: String,
    pub fds: Vec<i32>,
}

/// Body of `vm.resize`. Memory and balloon sizes are in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResizeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_vcpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_ram: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_balloon: Option<u64>,
}

/// Body of `vm.resize-disk`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeDiskConfig {
    pub disk_id: String,
    pub new_size: u64,
}

/// Body of `vm.remove-device`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveDeviceConfig {
    pub id: String,
}

/// A sandbox as seen by callers of the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub id: String,
    pub state: VmState,
    pub vcpus: u32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
    pub disk_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tap_device: Option<String>,
    pub socket_path: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpu_devices: Vec<String>,
    /// Origin sandbox when created by fork (`parent`) or clone (`source`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Lineage>,
}

/// How a sandbox was derived from another one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "sandboxId", rename_all = "lowercase")]
pub enum Lineage {
    /// Copy-on-write fork
    Parent(String),
    /// Fully independent clone
    Source(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_info_parses_hypervisor_response() {
        let raw = r#"{
            "config": {
                "cpus": {"boot_vcpus": 2, "max_vcpus": 4},
                "memory": {"size": 2147483648, "hotplug_method": "VirtioMem"},
                "net": [{"id": "_net0", "tap": "tap0", "mac": "02:aa:bb:cc:dd:ee", "num_queues": 2}],
                "disks": [{"path": "/var/lib/cloud-hypervisor/sandboxes/a/disk.raw", "num_queues": 1}]
            },
            "state": "Paused",
            "memory_actual_size": 2147483648,
            "device_tree": {}
        }"#;

        let info: VmInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.state, VmState::Paused);
        let config = info.config.unwrap();
        assert_eq!(config.cpus.unwrap().boot_vcpus, 2);
        assert_eq!(config.net[0].id.as_deref(), Some("_net0"));
    }

    #[test]
    fn test_restore_config_omits_empty_fields() {
        let json = serde_json::to_string(&RestoreConfig::from_dir("/snap", false)).unwrap();
        assert_eq!(json, r#"{"source_url":"file:///snap"}"#);
    }

    #[test]
    fn test_sandbox_info_uses_camel_case() {
        let info = SandboxInfo {
            id: "a".into(),
            state: VmState::Running,
            vcpus: 2,
            memory_mb: 2048,
            disk_path: "/d".into(),
            snapshot_path: None,
            ip_address: Some("192.168.0.2".into()),
            tap_device: Some("tap0".into()),
            socket_path: "/s".into(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
            gpu_devices: Vec::new(),
            origin: Some(Lineage::Parent("b".into())),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["memoryMB"], 2048);
        assert_eq!(value["ipAddress"], "192.168.0.2");
        assert_eq!(value["origin"]["kind"], "parent");
    }
}

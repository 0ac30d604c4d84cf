//! Typed hypervisor API requests
//!
//! Each endpoint of the Cloud Hypervisor API is one [`VmmRequest`] variant
//! carrying its own payload. [`VmmRequest::route`] maps a variant to its
//! HTTP method and endpoint, [`VmmRequest::from_route`] is the reverse table,
//! and [`VmmRequest::ch_remote_args`] maps it to a `ch-remote` invocation for
//! hosts reached over SSH.

use hyper::Method;

use super::config::{
    DeviceConfig, RemoveDeviceConfig, ResizeConfig, ResizeDiskConfig, RestoreConfig,
    SnapshotConfig, VmConfig,
};
use crate::error::{RunnerError, RunnerResult};

#[derive(Debug, Clone, PartialEq)]
pub enum VmmRequest {
    Ping,
    Info,
    Create(Box<VmConfig>),
    Boot,
    Pause,
    Resume,
    Shutdown,
    Reboot,
    PowerButton,
    Delete,
    Resize(ResizeConfig),
    ResizeDisk(ResizeDiskConfig),
    Snapshot(SnapshotConfig),
    Restore(RestoreConfig),
    AddDevice(DeviceConfig),
    RemoveDevice(RemoveDeviceConfig),
    ShutdownVmm,
}

/// Every (method, endpoint) pair this runner issues
const ROUTES: &[(&str, &str)] = &[
    ("GET", "vmm.ping"),
    ("GET", "vm.info"),
    ("PUT", "vm.create"),
    ("PUT", "vm.boot"),
    ("PUT", "vm.pause"),
    ("PUT", "vm.resume"),
    ("PUT", "vm.shutdown"),
    ("PUT", "vm.reboot"),
    ("PUT", "vm.power-button"),
    ("PUT", "vm.delete"),
    ("PUT", "vm.resize"),
    ("PUT", "vm.resize-disk"),
    ("PUT", "vm.snapshot"),
    ("PUT", "vm.restore"),
    ("PUT", "vm.add-device"),
    ("PUT", "vm.remove-device"),
    ("PUT", "vmm.shutdown"),
];

impl VmmRequest {
    /// HTTP method and endpoint name
    pub fn route(&self) -> (Method, &'static str) {
        let endpoint = self.endpoint();
        let method = if matches!(self, VmmRequest::Ping | VmmRequest::Info) {
            Method::GET
        } else {
            Method::PUT
        };
        (method, endpoint)
    }

    pub fn endpoint(&self) -> &'static str {
        match self {
            VmmRequest::Ping => "vmm.ping",
            VmmRequest::Info => "vm.info",
            VmmRequest::Create(_) => "vm.create",
            VmmRequest::Boot => "vm.boot",
            VmmRequest::Pause => "vm.pause",
            VmmRequest::Resume => "vm.resume",
            VmmRequest::Shutdown => "vm.shutdown",
            VmmRequest::Reboot => "vm.reboot",
            VmmRequest::PowerButton => "vm.power-button",
            VmmRequest::Delete => "vm.delete",
            VmmRequest::Resize(_) => "vm.resize",
            VmmRequest::ResizeDisk(_) => "vm.resize-disk",
            VmmRequest::Snapshot(_) => "vm.snapshot",
            VmmRequest::Restore(_) => "vm.restore",
            VmmRequest::AddDevice(_) => "vm.add-device",
            VmmRequest::RemoveDevice(_) => "vm.remove-device",
            VmmRequest::ShutdownVmm => "vmm.shutdown",
        }
    }

    /// JSON body, if the endpoint takes one
    pub fn body(&self) -> RunnerResult<Option<String>> {
        let json = match self {
            VmmRequest::Create(config) => serde_json::to_string(config)?,
            VmmRequest::Resize(config) => serde_json::to_string(config)?,
            VmmRequest::ResizeDisk(config) => serde_json::to_string(config)?,
            VmmRequest::Snapshot(config) => serde_json::to_string(config)?,
            VmmRequest::Restore(config) => serde_json::to_string(config)?,
            VmmRequest::AddDevice(config) => serde_json::to_string(config)?,
            VmmRequest::RemoveDevice(config) => serde_json::to_string(config)?,
            _ => return Ok(None),
        };
        Ok(Some(json))
    }

    /// Rebuilds a request from its wire form
    pub fn from_route(method: &Method, endpoint: &str, body: Option<&[u8]>) -> RunnerResult<Self> {
        let known = ROUTES
            .iter()
            .any(|(m, e)| *e == endpoint && method.as_str() == *m);
        if !known {
            return Err(RunnerError::InvalidArgument(format!(
                "unknown hypervisor route {} {}",
                method, endpoint
            )));
        }

        fn payload<T: serde::de::DeserializeOwned>(
            endpoint: &str,
            body: Option<&[u8]>,
        ) -> RunnerResult<T> {
            let body = body.ok_or_else(|| {
                RunnerError::InvalidArgument(format!("{} requires a body", endpoint))
            })?;
            Ok(serde_json::from_slice(body)?)
        }

        let request = match endpoint {
            "vmm.ping" => VmmRequest::Ping,
            "vm.info" => VmmRequest::Info,
            "vm.create" => VmmRequest::Create(Box::new(payload(endpoint, body)?)),
            "vm.boot" => VmmRequest::Boot,
            "vm.pause" => VmmRequest::Pause,
            "vm.resume" => VmmRequest::Resume,
            "vm.shutdown" => VmmRequest::Shutdown,
            "vm.reboot" => VmmRequest::Reboot,
            "vm.power-button" => VmmRequest::PowerButton,
            "vm.delete" => VmmRequest::Delete,
            "vm.resize" => VmmRequest::Resize(payload(endpoint, body)?),
            "vm.resize-disk" => VmmRequest::ResizeDisk(payload(endpoint, body)?),
            "vm.snapshot" => VmmRequest::Snapshot(payload(endpoint, body)?),
            "vm.restore" => VmmRequest::Restore(payload(endpoint, body)?),
            "vm.add-device" => VmmRequest::AddDevice(payload(endpoint, body)?),
            "vm.remove-device" => VmmRequest::RemoveDevice(payload(endpoint, body)?),
            "vmm.shutdown" => VmmRequest::ShutdownVmm,
            other => {
                return Err(RunnerError::InvalidArgument(format!(
                    "unknown hypervisor endpoint {}",
                    other
                )))
            }
        };
        Ok(request)
    }

    /// Arguments to `ch-remote --api-socket {socket}`
    ///
    /// `vm.create` is not expressible as plain arguments; the remote API
    /// writes the config to a temporary file and passes that path.
    pub fn ch_remote_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        match self {
            VmmRequest::Ping => args.push("ping".into()),
            VmmRequest::Info => args.push("info".into()),
            VmmRequest::Create(_) => args.push("create".into()),
            VmmRequest::Boot => args.push("boot".into()),
            VmmRequest::Pause => args.push("pause".into()),
            VmmRequest::Resume => args.push("resume".into()),
            VmmRequest::Shutdown => args.push("shutdown".into()),
            VmmRequest::Reboot => args.push("reboot".into()),
            VmmRequest::PowerButton => args.push("power-button".into()),
            VmmRequest::Delete => args.push("delete".into()),
            VmmRequest::ShutdownVmm => args.push("shutdown-vmm".into()),
            VmmRequest::Snapshot(config) => {
                args.push("snapshot".into());
                args.push(config.destination_url.clone());
            }
            VmmRequest::Restore(config) => {
                args.push("restore".into());
                let mut spec = format!("source_url={}", config.source_url);
                if config.prefault {
                    spec.push_str(",prefault=on");
                }
                args.push(spec);
            }
            VmmRequest::Resize(config) => {
                args.push("resize".into());
                if let Some(cpus) = config.desired_vcpus {
                    args.push("--cpus".into());
                    args.push(cpus.to_string());
                }
                if let Some(ram) = config.desired_ram {
                    args.push("--memory".into());
                    args.push(format!("{}b", ram));
                }
                if let Some(balloon) = config.desired_balloon {
                    args.push("--balloon".into());
                    args.push(format!("{}b", balloon));
                }
            }
            VmmRequest::ResizeDisk(config) => {
                args.push("resize-disk".into());
                args.push("--disk".into());
                args.push(config.disk_id.clone());
                args.push("--size".into());
                args.push(config.new_size.to_string());
            }
            VmmRequest::AddDevice(config) => {
                args.push("add-device".into());
                let mut spec = format!("path={}", config.path);
                if config.iommu {
                    spec.push_str(",iommu=on");
                }
                if let Some(id) = &config.id {
                    spec.push_str(&format!(",id={}", id));
                }
                args.push(spec);
            }
            VmmRequest::RemoveDevice(config) => {
                args.push("remove-device".into());
                args.push(config.id.clone());
            }
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_table_is_reversible() {
        let requests = vec![
            VmmRequest::Ping,
            VmmRequest::Info,
            VmmRequest::Boot,
            VmmRequest::PowerButton,
            VmmRequest::ShutdownVmm,
            VmmRequest::Resize(ResizeConfig {
                desired_balloon: Some(1 << 30),
                ..Default::default()
            }),
            VmmRequest::Restore(RestoreConfig::from_dir("/snap", true)),
        ];

        for request in requests {
            let (method, endpoint) = request.route();
            let body = request.body().unwrap();
            let parsed =
                VmmRequest::from_route(&method, endpoint, body.as_deref().map(str::as_bytes))
                    .unwrap();
            assert_eq!(parsed, request);
        }
    }

    #[test]
    fn test_unknown_route_is_rejected() {
        assert!(VmmRequest::from_route(&Method::GET, "vm.boot", None).is_err());
        assert!(VmmRequest::from_route(&Method::PUT, "vm.nope", None).is_err());
        assert!(VmmRequest::from_route(&Method::PUT, "vm.resize", None).is_err());
    }

    #[test]
    fn test_ch_remote_mapping() {
        let resize = VmmRequest::Resize(ResizeConfig {
            desired_vcpus: Some(4),
            desired_ram: None,
            desired_balloon: Some(1024),
        });
        assert_eq!(resize.ch_remote_args(), ["resize", "--cpus", "4", "--balloon", "1024b"]);

        let restore = VmmRequest::Restore(RestoreConfig::from_dir("/s/fork-a", true));
        assert_eq!(
            restore.ch_remote_args(),
            ["restore", "source_url=file:///s/fork-a,prefault=on"]
        );

        let add = VmmRequest::AddDevice(DeviceConfig {
            path: "/sys/bus/pci/devices/0000:01:00.0".into(),
            iommu: true,
            id: Some("gpu0".into()),
        });
        assert_eq!(
            add.ch_remote_args(),
            ["add-device", "path=/sys/bus/pci/devices/0000:01:00.0,iommu=on,id=gpu0"]
        );
        assert_eq!(VmmRequest::ShutdownVmm.ch_remote_args(), ["shutdown-vmm"]);
    }
}

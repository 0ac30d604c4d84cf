//! NoCloud seed ISO for freshly created sandboxes
//!
//! The guest picks up its hostname and static network configuration from a
//! small ISO built with `cloud-localds`.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::error::{ResultExt, RunnerResult};
use crate::network::SandboxNetwork;
use crate::runner::CommandRunner;

pub const CLOUD_INIT_ISO: &str = "cloud-init.iso";
const DEFAULT_NAMESERVERS: [&str; 2] = ["8.8.8.8", "1.1.1.1"];

#[derive(Debug, Clone, PartialEq)]
pub struct CloudInitConfig {
    pub instance_id: String,
    pub hostname: String,
    pub mac: String,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
    pub nameservers: Vec<String>,
}

impl CloudInitConfig {
    /// Seed for `sandbox_id` on the given network attachment
    pub fn new(sandbox_id: &str, mac: &str, network: &SandboxNetwork, prefix_len: u8) -> Self {
        Self {
            instance_id: sandbox_id.to_string(),
            hostname: sandbox_id.chars().take(12).collect(),
            mac: mac.to_string(),
            ip: network.guest_ip(),
            gateway: network.gateway(),
            prefix_len,
            nameservers: DEFAULT_NAMESERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn user_data(&self) -> String {
        format!(
            "#cloud-config\nhostname: {}\nmanage_etc_hosts: true\nssh_pwauth: false\n",
            self.hostname
        )
    }

    pub fn meta_data(&self) -> String {
        format!(
            "instance-id: {}\nlocal-hostname: {}\n",
            self.instance_id, self.hostname
        )
    }

    /// Netplan v2 configuration matched on the NIC's MAC address
    pub fn network_config(&self) -> String {
        format!(
            r#"version: 2
ethernets:
  eth0:
    match:
      macaddress: "{mac}"
    set-name: eth0
    addresses:
      - {ip}/{prefix}
    routes:
      - to: default
        via: {gw}
    nameservers:
      addresses: [{dns}]
"#,
            mac = self.mac,
            ip = self.ip,
            prefix = self.prefix_len,
            gw = self.gateway,
            dns = self.nameservers.join(", "),
        )
    }
}

/// Writes the seed files under `{sandbox_dir}/cloud-init/` and builds the
/// ISO next to them. Returns the ISO path.
pub async fn build_iso(
    runner: &dyn CommandRunner,
    sandbox_dir: &str,
    config: &CloudInitConfig,
) -> RunnerResult<String> {
    let seed_dir = format!("{}/cloud-init", sandbox_dir);
    runner.create_dir_all(&seed_dir).await?;

    let user_data = format!("{}/user-data", seed_dir);
    let meta_data = format!("{}/meta-data", seed_dir);
    let network = format!("{}/network-config", seed_dir);
    runner
        .write_file(&user_data, config.user_data().as_bytes())
        .await?;
    runner
        .write_file(&meta_data, config.meta_data().as_bytes())
        .await?;
    runner
        .write_file(&network, config.network_config().as_bytes())
        .await?;

    let iso = format!("{}/{}", sandbox_dir, CLOUD_INIT_ISO);
    runner
        .run(
            "cloud-localds",
            &["--network-config", &network, &iso, &user_data, &meta_data],
        )
        .await
        .context("cloud-localds failed")?;

    debug!(iso = %iso, hostname = %config.hostname, "cloud-init ISO built");
    Ok(iso)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetNamespace;

    #[test]
    fn test_namespace_seed() {
        let network = SandboxNetwork::Namespace(NetNamespace::new("sandbox-0123456789abcdef", 3));
        let config = CloudInitConfig::new("sandbox-0123456789abcdef", "02:01:02:03:04:05", &network, 24);

        assert_eq!(config.hostname, "sandbox-0123");
        let net = config.network_config();
        assert!(net.contains("macaddress: \"02:01:02:03:04:05\""));
        assert!(net.contains("- 192.168.0.2/24"));
        assert!(net.contains("via: 192.168.0.1"));
        assert!(config.meta_data().starts_with("instance-id: sandbox-0123456789abcdef\n"));
    }
}

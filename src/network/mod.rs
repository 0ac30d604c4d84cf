//! Host networking for sandboxes
//!
//! - `netns` - one network namespace per sandbox (default)
//! - `tap_pool` - pre-created TAP devices on the host bridge
//! - `ip_pool` - flat IPv4 addresses for bridge networking
//! - `ip_cache` - sandbox id to reachable IP lookups

pub mod ip_cache;
pub mod ip_pool;
pub mod netns;
pub mod tap_pool;

use std::net::Ipv4Addr;

pub use ip_cache::IpCache;
pub use ip_pool::IpPool;
pub use netns::{NetNamespace, NetNsPool};
pub use tap_pool::{TapPool, TapPoolConfig};

/// The network attachment of one sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxNetwork {
    Namespace(NetNamespace),
    Bridge {
        tap: String,
        ip: Ipv4Addr,
        gateway: Ipv4Addr,
        netmask: Ipv4Addr,
    },
}

impl SandboxNetwork {
    /// TAP device the hypervisor attaches to
    pub fn tap_name(&self) -> &str {
        match self {
            SandboxNetwork::Namespace(ns) => &ns.tap_name,
            SandboxNetwork::Bridge { tap, .. } => tap,
        }
    }

    /// Address configured inside the guest
    pub fn guest_ip(&self) -> Ipv4Addr {
        match self {
            SandboxNetwork::Namespace(ns) => ns.guest_ip,
            SandboxNetwork::Bridge { ip, .. } => *ip,
        }
    }

    pub fn gateway(&self) -> Ipv4Addr {
        match self {
            SandboxNetwork::Namespace(ns) => ns.gateway_ip,
            SandboxNetwork::Bridge { gateway, .. } => *gateway,
        }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        match self {
            SandboxNetwork::Namespace(_) => netns::GUEST_NETMASK,
            SandboxNetwork::Bridge { netmask, .. } => *netmask,
        }
    }

    /// Address the host uses to reach the guest
    pub fn reachable_ip(&self) -> Ipv4Addr {
        match self {
            SandboxNetwork::Namespace(ns) => ns.external_ip,
            SandboxNetwork::Bridge { ip, .. } => *ip,
        }
    }

    pub fn namespace(&self) -> Option<&NetNamespace> {
        match self {
            SandboxNetwork::Namespace(ns) => Some(ns),
            SandboxNetwork::Bridge { .. } => None,
        }
    }
}

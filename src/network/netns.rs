//! Network namespace pool
//!
//! Every sandbox runs inside its own network namespace. The guest side looks
//! identical in every namespace; only the external /24 differs, and that is
//! what this pool hands out.
//!
//! ```text
//!  host                         namespace ns-{id}                 guest
//! ┌──────────────────┐  veth  ┌──────────────────────────┐  tap  ┌─────────────┐
//! │ veth{n}          │◄──────►│ veth{n}-ns   10.0.{n}.1  │◄─────►│ 192.168.0.2 │
//! │ 10.0.{n}.254     │        │ tap0         192.168.0.1 │       └─────────────┘
//! │ MASQUERADE → eth0│        │ MASQUERADE out, DNAT in  │
//! └──────────────────┘        └──────────────────────────┘
//! ```
//!
//! The external number is persisted in `{sandbox}/netns` so the pool can be
//! rebuilt after a restart without touching the namespaces themselves.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::{ResultExt, RunnerError, RunnerResult};
use crate::metrics::POOL_AVAILABLE;
use crate::runner::{shell_quote, CommandRunner, SpawnSpec};

pub const NETNS_PREFIX: &str = "ns-";
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 2);
pub const GUEST_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
pub const GUEST_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const GUEST_PREFIX_LEN: u8 = 24;
/// TAP name inside every namespace
pub const NAMESPACE_TAP: &str = "tap0";

const EXTERNAL_NET_START: u8 = 1;
const EXTERNAL_NET_END: u8 = 254;

/// Marker file holding the external number
pub const NETNS_MARKER: &str = "netns";

/// Addressing of one sandbox namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetNamespace {
    pub sandbox_id: String,
    pub name: String,
    pub veth_host: String,
    pub veth_ns: String,
    pub tap_name: String,
    pub guest_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub external_num: u8,
    /// Namespace end of the veth; DNATed to the guest
    pub external_ip: Ipv4Addr,
    /// Host end of the veth
    pub host_ip: Ipv4Addr,
}

impl NetNamespace {
    pub fn new(sandbox_id: &str, external_num: u8) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            name: namespace_name(sandbox_id),
            veth_host: format!("veth{}", external_num),
            veth_ns: format!("veth{}-ns", external_num),
            tap_name: NAMESPACE_TAP.to_string(),
            guest_ip: GUEST_IP,
            gateway_ip: GUEST_GATEWAY,
            external_num,
            external_ip: Ipv4Addr::new(10, 0, external_num, 1),
            host_ip: Ipv4Addr::new(10, 0, external_num, 254),
        }
    }

    pub fn external_subnet(&self) -> String {
        format!("10.0.{}.0/24", self.external_num)
    }

    fn setup_script(&self, host_interface: &str) -> String {
        let ns = &self.name;
        format!(
            r#"set -e
ip netns add {ns}
ip link add {vh} type veth peer name {vn}
ip link set {vn} netns {ns}
ip netns exec {ns} ip tuntap add dev {tap} mode tap
ip netns exec {ns} ip link set {tap} up
ip netns exec {ns} ip addr add {gw}/{plen} dev {tap}
ip netns exec {ns} ip link set lo up
ip netns exec {ns} ip link set {vn} up
ip netns exec {ns} ip addr add {ext}/24 dev {vn}
ip netns exec {ns} ip route add default via {host}
ip netns exec {ns} sysctl -w net.ipv4.ip_forward=1 > /dev/null
ip netns exec {ns} iptables -t nat -A POSTROUTING -o {vn} -j MASQUERADE
ip netns exec {ns} iptables -t nat -A PREROUTING -i {vn} -j DNAT --to-destination {guest}
ip link set {vh} up
ip addr add {host}/24 dev {vh}
iptables -t nat -C POSTROUTING -s {subnet} -o {hif} -j MASQUERADE 2>/dev/null || \
iptables -t nat -A POSTROUTING -s {subnet} -o {hif} -j MASQUERADE
sysctl -w net.ipv4.ip_forward=1 > /dev/null
echo OK
"#,
            ns = ns,
            vh = self.veth_host,
            vn = self.veth_ns,
            tap = self.tap_name,
            gw = self.gateway_ip,
            plen = GUEST_PREFIX_LEN,
            ext = self.external_ip,
            host = self.host_ip,
            guest = self.guest_ip,
            subnet = self.external_subnet(),
            hif = host_interface,
        )
    }

    fn teardown_script(&self, host_interface: &str) -> String {
        format!(
            r#"iptables -t nat -D POSTROUTING -s {subnet} -o {hif} -j MASQUERADE 2>/dev/null || true
ip link del {vh} 2>/dev/null || true
ip netns del {ns} 2>/dev/null || true
echo OK
"#,
            subnet = self.external_subnet(),
            hif = host_interface,
            vh = self.veth_host,
            ns = self.name,
        )
    }
}

/// Namespace name for a sandbox. Derived from the id alone so the
/// namespace can be found again after a restart.
pub fn namespace_name(sandbox_id: &str) -> String {
    format!("{}{}", NETNS_PREFIX, sandbox_id)
}

struct NetNsState {
    namespaces: HashMap<String, NetNamespace>,
    /// Ids whose namespace is being set up outside the lock
    pending: HashSet<String>,
    free: VecDeque<u8>,
}

impl NetNsState {
    fn take_number(&mut self, num: u8) -> bool {
        match self.free.iter().position(|n| *n == num) {
            Some(pos) => {
                self.free.remove(pos);
                true
            }
            None => false,
        }
    }
}

pub struct NetNsPool {
    runner: Arc<dyn CommandRunner>,
    sandboxes_path: String,
    host_interface: String,
    state: Mutex<NetNsState>,
}

impl NetNsPool {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        sandboxes_path: impl Into<String>,
        host_interface: impl Into<String>,
    ) -> Self {
        let pool = Self {
            runner,
            sandboxes_path: sandboxes_path.into(),
            host_interface: host_interface.into(),
            state: Mutex::new(NetNsState {
                namespaces: HashMap::new(),
                pending: HashSet::new(),
                free: (EXTERNAL_NET_START..=EXTERNAL_NET_END).collect(),
            }),
        };
        pool.publish_available();
        pool
    }

    /// Rebuilds allocations from the marker files in sandbox directories
    pub async fn initialize(&self) -> RunnerResult<()> {
        let sandboxes = self
            .runner
            .list_dir(&self.sandboxes_path)
            .await
            .context("failed to list sandboxes")?;

        let mut restored = 0;
        for sandbox_id in sandboxes.iter().filter(|s| !s.starts_with('.')) {
            let Some(num) = self.read_marker(sandbox_id).await else {
                continue;
            };
            if self.adopt(sandbox_id, num).is_ok() {
                restored += 1;
                debug!(sandbox_id, external_num = num, "restored namespace allocation");
            }
        }

        info!(restored, available = self.available(), "netns pool initialized");
        Ok(())
    }

    /// Creates a namespace for `sandbox_id`
    ///
    /// Fails if the sandbox already has one. The network setup runs outside
    /// the pool lock; on failure any partial state is torn down and the
    /// external number is returned to the pool.
    pub async fn create(&self, sandbox_id: &str) -> RunnerResult<NetNamespace> {
        let num = {
            let mut state = self.lock();
            if state.namespaces.contains_key(sandbox_id) || state.pending.contains(sandbox_id) {
                return Err(RunnerError::AlreadyExists(format!(
                    "network namespace for {}",
                    sandbox_id
                )));
            }
            let num = state
                .free
                .pop_front()
                .ok_or(RunnerError::PoolExhausted("netns"))?;
            state.pending.insert(sandbox_id.to_string());
            num
        };

        let ns = NetNamespace::new(sandbox_id, num);
        if let Err(e) = self.setup(&ns).await {
            let mut state = self.lock();
            state.pending.remove(sandbox_id);
            state.free.push_back(num);
            self.publish(&state);
            return Err(e).context("failed to create network namespace");
        }

        {
            let mut state = self.lock();
            state.pending.remove(sandbox_id);
            state.namespaces.insert(sandbox_id.to_string(), ns.clone());
            self.publish(&state);
        }

        let marker = self.marker_path(sandbox_id);
        if let Err(e) = self.runner.write_file(&marker, num.to_string().as_bytes()).await {
            warn!(sandbox_id, error = %e, "failed to persist netns marker");
        }

        info!(sandbox_id, netns = %ns.name, subnet = %ns.external_subnet(), "created network namespace");
        Ok(ns)
    }

    /// Removes the sandbox's namespace and frees its number. Missing
    /// namespaces are not an error.
    pub async fn delete(&self, sandbox_id: &str) -> RunnerResult<()> {
        let Some(ns) = self.lock().namespaces.remove(sandbox_id) else {
            return Ok(());
        };

        if let Err(e) = self.runner.run_script(&ns.teardown_script(&self.host_interface)).await {
            warn!(sandbox_id, netns = %ns.name, error = %e, "namespace teardown failed");
        }
        if let Err(e) = self.runner.remove_all(&self.marker_path(sandbox_id)).await {
            warn!(sandbox_id, error = %e, "failed to remove netns marker");
        }

        let mut state = self.lock();
        state.free.push_back(ns.external_num);
        self.publish(&state);

        info!(sandbox_id, netns = %ns.name, "deleted network namespace");
        Ok(())
    }

    /// Returns a usable namespace for a sandbox that may have lost its
    /// network, e.g. after a host reboot
    ///
    /// An existing OS namespace is reused. Known bookkeeping without an OS
    /// namespace is recreated with the same external number. Otherwise a
    /// fresh namespace is created.
    pub async fn ensure(&self, sandbox_id: &str) -> RunnerResult<NetNamespace> {
        let known = self.get(sandbox_id);
        let num = match &known {
            Some(ns) => Some(ns.external_num),
            None => self.read_marker(sandbox_id).await,
        };

        let Some(num) = num else {
            return self.create(sandbox_id).await;
        };

        let ns = match known {
            Some(ns) => ns,
            None => match self.adopt(sandbox_id, num) {
                Ok(ns) => ns,
                // The number went to another sandbox; start over.
                Err(_) => return self.create(sandbox_id).await,
            },
        };

        if self.namespace_exists(sandbox_id).await? {
            debug!(sandbox_id, netns = %ns.name, "reusing existing namespace");
            return Ok(ns);
        }

        info!(sandbox_id, netns = %ns.name, "recreating missing namespace");
        if let Err(e) = self.setup(&ns).await {
            let mut state = self.lock();
            state.namespaces.remove(sandbox_id);
            state.free.push_back(num);
            self.publish(&state);
            return Err(e).context("failed to recreate network namespace");
        }
        Ok(ns)
    }

    /// Records an existing namespace without touching the host
    pub fn adopt(&self, sandbox_id: &str, external_num: u8) -> RunnerResult<NetNamespace> {
        let mut state = self.lock();
        if let Some(ns) = state.namespaces.get(sandbox_id) {
            return Ok(ns.clone());
        }
        if !state.take_number(external_num) {
            return Err(RunnerError::AlreadyExists(format!(
                "external network {} is in use",
                external_num
            )));
        }
        let ns = NetNamespace::new(sandbox_id, external_num);
        state.namespaces.insert(sandbox_id.to_string(), ns.clone());
        self.publish(&state);
        Ok(ns)
    }

    pub fn get(&self, sandbox_id: &str) -> Option<NetNamespace> {
        self.lock().namespaces.get(sandbox_id).cloned()
    }

    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    /// True if the OS namespace for `sandbox_id` exists on the host
    pub async fn namespace_exists(&self, sandbox_id: &str) -> RunnerResult<bool> {
        let name = namespace_name(sandbox_id);
        let out = self.runner.run("ip", &["netns", "list"]).await?;
        Ok(out
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|n| n == name))
    }

    /// Runs a shell command inside the sandbox's namespace
    pub async fn exec_in_namespace(&self, sandbox_id: &str, command: &str) -> RunnerResult<String> {
        let ns = self
            .get(sandbox_id)
            .ok_or_else(|| RunnerError::NotFound(format!("namespace for sandbox {}", sandbox_id)))?;
        self.runner
            .run_script(&format!("ip netns exec {} {}", shell_quote(&ns.name), command))
            .await
    }

    /// Wraps a program so it starts inside the sandbox's namespace
    pub fn spawn_in_namespace(
        &self,
        sandbox_id: &str,
        program: &str,
        args: &[&str],
        log_path: &str,
    ) -> RunnerResult<SpawnSpec> {
        let ns = self
            .get(sandbox_id)
            .ok_or_else(|| RunnerError::NotFound(format!("namespace for sandbox {}", sandbox_id)))?;

        let mut full = vec![
            "netns".to_string(),
            "exec".to_string(),
            ns.name,
            program.to_string(),
        ];
        full.extend(args.iter().map(|a| a.to_string()));

        Ok(SpawnSpec {
            program: "ip".to_string(),
            args: full,
            log_path: log_path.to_string(),
        })
    }

    async fn setup(&self, ns: &NetNamespace) -> RunnerResult<()> {
        match self.runner.run_script(&ns.setup_script(&self.host_interface)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Err(cleanup) = self.runner.run_script(&ns.teardown_script(&self.host_interface)).await {
                    warn!(netns = %ns.name, error = %cleanup, "cleanup after failed setup failed");
                }
                Err(e)
            }
        }
    }

    async fn read_marker(&self, sandbox_id: &str) -> Option<u8> {
        let raw = self.runner.read_file(&self.marker_path(sandbox_id)).await.ok()?;
        raw.trim()
            .parse::<u8>()
            .ok()
            .filter(|n| (EXTERNAL_NET_START..=EXTERNAL_NET_END).contains(n))
    }

    fn marker_path(&self, sandbox_id: &str) -> String {
        format!("{}/{}/{}", self.sandboxes_path, sandbox_id, NETNS_MARKER)
    }

    fn publish(&self, state: &NetNsState) {
        POOL_AVAILABLE
            .with_label_values(&["netns"])
            .set(state.free.len() as f64);
    }

    fn publish_available(&self) {
        let state = self.lock();
        self.publish(&state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetNsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_addressing() {
        let ns = NetNamespace::new("sandbox-1", 7);
        assert_eq!(ns.name, "ns-sandbox-1");
        assert_eq!(ns.veth_host, "veth7");
        assert_eq!(ns.veth_ns, "veth7-ns");
        assert_eq!(ns.external_ip, Ipv4Addr::new(10, 0, 7, 1));
        assert_eq!(ns.host_ip, Ipv4Addr::new(10, 0, 7, 254));
        assert_eq!(ns.guest_ip, GUEST_IP);
        assert_eq!(ns.external_subnet(), "10.0.7.0/24");
    }

    #[test]
    fn test_interface_names_fit_kernel_limit() {
        let ns = NetNamespace::new("a-very-long-sandbox-identifier", 254);
        assert!(ns.veth_host.len() <= 15);
        assert!(ns.veth_ns.len() <= 15);
    }

    #[test]
    fn test_setup_script_wires_nat_and_dnat() {
        let ns = NetNamespace::new("abc", 3);
        let script = ns.setup_script("eth0");
        assert!(script.starts_with("set -e"));
        assert!(script.contains("ip netns add ns-abc"));
        assert!(script.contains("ip link add veth3 type veth peer name veth3-ns"));
        assert!(script.contains("ip netns exec ns-abc ip tuntap add dev tap0 mode tap"));
        assert!(script.contains("-j DNAT --to-destination 192.168.0.2"));
        assert!(script.contains("-s 10.0.3.0/24 -o eth0 -j MASQUERADE"));
    }

    #[test]
    fn test_teardown_script_is_best_effort() {
        let script = NetNamespace::new("abc", 3).teardown_script("eth1");
        assert!(script.contains("-o eth1"));
        assert!(script.lines().filter(|l| l.contains("||")).count() == 3);
    }
}

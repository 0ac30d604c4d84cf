//! Flat IPv4 pool for bridge networking
//!
//! Sandboxes that are not isolated in a namespace share the host bridge and
//! need distinct addresses. Addresses are handed out from a fixed range and
//! recycled on release.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::error::{RunnerError, RunnerResult};
use crate::metrics::POOL_AVAILABLE;
use crate::runner::CommandRunner;

pub const DEFAULT_RANGE_START: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 2);
pub const DEFAULT_RANGE_END: Ipv4Addr = Ipv4Addr::new(10, 10, 255, 254);
pub const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 1);
pub const DEFAULT_PREFIX_LEN: u8 = 16;

struct IpPoolState {
    allocated: HashMap<String, Ipv4Addr>,
    free: VecDeque<u32>,
}

pub struct IpPool {
    gateway: Ipv4Addr,
    prefix_len: u8,
    state: Mutex<IpPoolState>,
}

impl IpPool {
    /// A pool over the inclusive range `start..=end`
    pub fn new(start: Ipv4Addr, end: Ipv4Addr, gateway: Ipv4Addr, prefix_len: u8) -> Self {
        let gw = u32::from(gateway);
        let free = (u32::from(start)..=u32::from(end))
            .filter(|ip| *ip != gw)
            .collect::<VecDeque<_>>();

        let pool = Self {
            gateway,
            prefix_len,
            state: Mutex::new(IpPoolState {
                allocated: HashMap::new(),
                free,
            }),
        };
        pool.publish_available();
        pool
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Dotted netmask for the pool's prefix
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::from(self.prefix_len.min(32));
        let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
        Ipv4Addr::from(mask)
    }

    /// Allocates an address for `sandbox_id`. Allocating twice for the same
    /// id returns the same address.
    pub fn allocate(&self, sandbox_id: &str) -> RunnerResult<Ipv4Addr> {
        let mut state = self.lock();
        if let Some(ip) = state.allocated.get(sandbox_id) {
            return Ok(*ip);
        }

        let ip = state
            .free
            .pop_front()
            .map(Ipv4Addr::from)
            .ok_or(RunnerError::PoolExhausted("ip"))?;
        state.allocated.insert(sandbox_id.to_string(), ip);
        POOL_AVAILABLE.with_label_values(&["ip"]).set(state.free.len() as f64);

        debug!(sandbox_id, %ip, "allocated IP");
        Ok(ip)
    }

    /// Returns the sandbox's address to the pool
    pub fn release(&self, sandbox_id: &str) {
        let mut state = self.lock();
        if let Some(ip) = state.allocated.remove(sandbox_id) {
            state.free.push_back(u32::from(ip));
            POOL_AVAILABLE.with_label_values(&["ip"]).set(state.free.len() as f64);
            debug!(sandbox_id, %ip, "released IP");
        }
    }

    pub fn get(&self, sandbox_id: &str) -> Option<Ipv4Addr> {
        self.lock().allocated.get(sandbox_id).copied()
    }

    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    /// Marks `ip` as held by `sandbox_id`, e.g. when rebuilt from disk
    pub fn reserve(&self, sandbox_id: &str, ip: Ipv4Addr) -> RunnerResult<()> {
        let mut state = self.lock();
        let raw = u32::from(ip);
        let Some(pos) = state.free.iter().position(|candidate| *candidate == raw) else {
            return Err(RunnerError::AlreadyExists(format!("IP {} is not free", ip)));
        };
        state.free.remove(pos);
        state.allocated.insert(sandbox_id.to_string(), ip);
        POOL_AVAILABLE.with_label_values(&["ip"]).set(state.free.len() as f64);
        Ok(())
    }

    /// Rebuilds allocations from the `ip` files of sandboxes that do not use
    /// a network namespace.
    pub async fn initialize(
        &self,
        runner: &dyn CommandRunner,
        sandboxes_path: &str,
    ) -> RunnerResult<()> {
        let sandboxes = runner.list_dir(sandboxes_path).await?;
        let mut restored = 0;

        for sandbox_id in sandboxes.iter().filter(|s| !s.starts_with('.')) {
            let dir = format!("{}/{}", sandboxes_path, sandbox_id);
            if runner.file_exists(&format!("{}/netns", dir)).await? {
                continue;
            }
            let Ok(raw) = runner.read_file(&format!("{}/ip", dir)).await else {
                continue;
            };
            let Ok(ip) = raw.trim().parse::<Ipv4Addr>() else {
                continue;
            };
            if self.reserve(sandbox_id, ip).is_ok() {
                restored += 1;
            }
        }

        info!(restored, available = self.available(), "IP pool initialized");
        Ok(())
    }

    fn publish_available(&self) {
        POOL_AVAILABLE
            .with_label_values(&["ip"])
            .set(self.lock().free.len() as f64);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IpPoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for IpPool {
    fn default() -> Self {
        Self::new(
            DEFAULT_RANGE_START,
            DEFAULT_RANGE_END,
            DEFAULT_GATEWAY,
            DEFAULT_PREFIX_LEN,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn small_pool() -> IpPool {
        IpPool::new(
            Ipv4Addr::new(10, 10, 0, 1),
            Ipv4Addr::new(10, 10, 0, 4),
            Ipv4Addr::new(10, 10, 0, 1),
            24,
        )
    }

    #[test]
    fn test_allocate_skips_gateway_and_is_idempotent() {
        let pool = small_pool();
        assert_eq!(pool.available(), 3);

        let a = pool.allocate("a").unwrap();
        assert_eq!(a, Ipv4Addr::new(10, 10, 0, 2));
        assert_eq!(pool.allocate("a").unwrap(), a);
        assert_eq!(pool.get("a"), Some(a));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_exhaustion_and_release() {
        let pool = small_pool();
        for id in ["a", "b", "c"] {
            pool.allocate(id).unwrap();
        }
        assert!(pool.allocate("d").unwrap_err().is_exhausted());

        pool.release("b");
        assert_eq!(pool.allocate("d").unwrap(), Ipv4Addr::new(10, 10, 0, 3));
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let pool = Arc::new(IpPool::new(
            Ipv4Addr::new(10, 10, 1, 1),
            Ipv4Addr::new(10, 10, 1, 64),
            Ipv4Addr::new(10, 10, 0, 1),
            16,
        ));

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.allocate(&format!("sb-{i}")).unwrap())
            })
            .collect();
        let ips: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ips.len(), 64);
        assert!(pool.allocate("one-more").unwrap_err().is_exhausted());
    }

    #[test]
    fn test_netmask() {
        assert_eq!(IpPool::default().netmask(), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(small_pool().netmask(), Ipv4Addr::new(255, 255, 255, 0));
    }
}

//! Sandbox id → reachable IP
//!
//! Lookups go through the in-memory map first, then the namespace pool, the
//! flat IP pool and finally the `ip` file in the sandbox directory. Whatever
//! is found is cached.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::runner::CommandRunner;

use super::ip_pool::IpPool;
use super::netns::NetNsPool;

pub const IP_MARKER: &str = "ip";

#[derive(Debug, Default)]
pub struct IpCache {
    entries: RwLock<HashMap<String, String>>,
}

impl IpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sandbox_id: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(sandbox_id)
            .cloned()
    }

    pub fn set(&self, sandbox_id: &str, ip: impl Into<String>) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sandbox_id.to_string(), ip.into());
    }

    pub fn delete(&self, sandbox_id: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sandbox_id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds the IP the host uses to reach a sandbox
    pub async fn resolve(
        &self,
        sandbox_id: &str,
        netns: &NetNsPool,
        ip_pool: &IpPool,
        runner: &dyn CommandRunner,
        sandboxes_path: &str,
    ) -> Option<String> {
        if let Some(ip) = self.get(sandbox_id) {
            return Some(ip);
        }

        let found = if let Some(ns) = netns.get(sandbox_id) {
            Some(ns.external_ip.to_string())
        } else if let Some(ip) = ip_pool.get(sandbox_id) {
            Some(ip.to_string())
        } else {
            let path = format!("{}/{}/{}", sandboxes_path, sandbox_id, IP_MARKER);
            runner
                .read_file(&path)
                .await
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        }?;

        self.set(sandbox_id, found.clone());
        Some(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let cache = IpCache::new();
        assert!(cache.is_empty());

        cache.set("a", "10.0.1.1");
        assert_eq!(cache.get("a").as_deref(), Some("10.0.1.1"));
        assert_eq!(cache.len(), 1);

        cache.delete("a");
        assert_eq!(cache.get("a"), None);
    }
}

//! Per-VM memory samples
//!
//! Host-side numbers (max memory, balloon size) come from `vm.info`; the
//! guest's own view comes from the in-guest daemon, which is only reachable
//! from inside the sandbox's network namespace.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{RunnerError, RunnerResult};
use crate::network::netns::GUEST_IP;
use crate::vm::{Client, VmState};

const KIB: u64 = 1024;

/// One memory sample of a running VM. All sizes are in KiB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VMMemoryStats {
    pub sandbox_id: String,
    pub max_memory_kib: u64,
    pub balloon_size_kib: u64,
    pub mem_total_kib: u64,
    pub mem_free_kib: u64,
    pub mem_available_kib: u64,
    pub buffers_kib: u64,
    pub cached_kib: u64,
}

impl VMMemoryStats {
    pub fn used_memory_kib(&self) -> u64 {
        self.mem_total_kib.saturating_sub(self.mem_available_kib)
    }

    /// The guest reported at all. Without a report the balloon driver is
    /// presumed inactive and the VM is left alone.
    pub fn is_balloon_driver_active(&self) -> bool {
        self.mem_total_kib > 0
    }
}

/// Body of the daemon's `/memory-stats`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuestMemoryReport {
    #[serde(rename = "memTotalKiB")]
    pub mem_total_kib: u64,
    #[serde(rename = "memFreeKiB", default)]
    pub mem_free_kib: u64,
    #[serde(rename = "memAvailableKiB")]
    pub mem_available_kib: u64,
    #[serde(rename = "buffersKiB", default)]
    pub buffers_kib: u64,
    #[serde(rename = "cachedKiB", default)]
    pub cached_kib: u64,
}

impl Client {
    /// Samples memory of one Running VM
    ///
    /// A missing or broken guest report is not an error; the sample then
    /// carries only the host-side numbers.
    pub async fn collect_memory_stats(&self, sandbox_id: &str) -> RunnerResult<VMMemoryStats> {
        let info = self.get_info(sandbox_id).await?;
        if info.state != VmState::Running {
            return Err(RunnerError::InvalidState {
                sandbox_id: sandbox_id.to_string(),
                operation: "sample memory of",
                state: info.state,
            });
        }

        let config = info.config.unwrap_or_default();
        let mut stats = VMMemoryStats {
            sandbox_id: sandbox_id.to_string(),
            max_memory_kib: config.memory.map(|m| m.size / KIB).unwrap_or_default(),
            balloon_size_kib: config.balloon.map(|b| b.size / KIB).unwrap_or_default(),
            ..Default::default()
        };

        match self.guest_memory_report(sandbox_id).await {
            Ok(report) => {
                stats.mem_total_kib = report.mem_total_kib;
                stats.mem_free_kib = report.mem_free_kib;
                stats.mem_available_kib = report.mem_available_kib;
                stats.buffers_kib = report.buffers_kib;
                stats.cached_kib = report.cached_kib;
            }
            Err(e) => trace!(sandbox_id, error = %e, "no guest memory report"),
        }
        Ok(stats)
    }

    async fn guest_memory_report(&self, sandbox_id: &str) -> RunnerResult<GuestMemoryReport> {
        let port = self.config.daemon_port;
        let raw = if self.netns.get(sandbox_id).is_some() {
            let command = format!("curl -s -m 2 http://{}:{}/memory-stats", GUEST_IP, port);
            self.netns.exec_in_namespace(sandbox_id, &command).await?
        } else {
            let ip = self.ips.get(sandbox_id).ok_or_else(|| {
                RunnerError::NotFound(format!("address of sandbox {}", sandbox_id))
            })?;
            let url = format!("http://{}:{}/memory-stats", ip, port);
            self.runner.run("curl", &["-s", "-m", "2", &url]).await?
        };
        Ok(serde_json::from_str(raw.trim())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_memory() {
        let stats = VMMemoryStats {
            mem_total_kib: 8_000_000,
            mem_available_kib: 5_000_000,
            ..Default::default()
        };
        assert_eq!(stats.used_memory_kib(), 3_000_000);
        assert!(stats.is_balloon_driver_active());
        assert!(!VMMemoryStats::default().is_balloon_driver_active());
    }

    #[test]
    fn test_guest_report_parses() {
        let raw = r#"{"memTotalKiB": 4000000, "memFreeKiB": 1000000, "memAvailableKiB": 2500000, "buffersKiB": 1200, "cachedKiB": 900000}"#;
        let report: GuestMemoryReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.mem_total_kib, 4_000_000);
        assert_eq!(report.cached_kib, 900_000);
    }
}

//! Balloon-based memory reclamation
//!
//! Every interval the controller samples all Running sandboxes, then sizes
//! each balloon so the guest keeps its used memory plus a safety buffer:
//!
//! ```text
//! buffer  = max(buffer_floor, used * buffer_ratio)
//! target  = max(used + buffer, min_guest_memory)
//! balloon = max_memory - target        (0 when target >= max_memory)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stats::VMMemoryStats;
use super::stats_store::StatsStore;
use crate::config::MemoryControllerConfig;
use crate::error::RunnerResult;
use crate::metrics::{BALLOON_ADJUSTMENTS, BALLOON_SIZE_BYTES};
use crate::vm::{Client, VmState};

/// Balloon size in KiB that leaves the guest its target memory
pub fn calculate_target_balloon(config: &MemoryControllerConfig, stats: &VMMemoryStats) -> u64 {
    let used = stats.used_memory_kib();
    let buffer = config
        .buffer_floor_kib
        .max((used as f64 * config.buffer_ratio) as u64);
    let target_guest = (used + buffer).max(config.min_guest_memory_kib);

    stats.max_memory_kib.saturating_sub(target_guest)
}

/// Whether moving from `current` to `target` is worth a resize
pub fn exceeds_tolerance(config: &MemoryControllerConfig, max_memory_kib: u64, current: u64, target: u64) -> bool {
    let threshold = (max_memory_kib as f64 * config.tolerance) as u64;
    current.abs_diff(target) > threshold
}

/// Outcome of one controller cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub sampled: usize,
    pub adjusted: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct MemoryController {
    client: Arc<Client>,
    config: MemoryControllerConfig,
    store: Option<Arc<StatsStore>>,
    last_stats: Mutex<HashMap<String, VMMemoryStats>>,
}

impl MemoryController {
    pub fn new(
        client: Arc<Client>,
        config: MemoryControllerConfig,
        store: Option<Arc<StatsStore>>,
    ) -> Self {
        Self {
            client,
            config,
            store,
            last_stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MemoryControllerConfig {
        &self.config
    }

    /// Runs cycles every interval until `token` is cancelled
    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("memory controller disabled");
                return;
            }
            info!(interval = ?self.config.interval, "memory controller started");

            let mut interval = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "memory controller cycle failed");
                        }
                    }
                }
            }
            info!("memory controller stopped");
        })
    }

    /// One sample-and-adjust pass over every Running sandbox
    pub async fn run_once(&self) -> RunnerResult<CycleReport> {
        let running: Vec<String> = self
            .client
            .list()
            .await?
            .into_iter()
            .filter(|s| s.state == VmState::Running)
            .map(|s| s.id)
            .collect();

        let samples = join_all(running.iter().map(|id| self.client.collect_memory_stats(id))).await;

        let mut report = CycleReport::default();
        let mut collected = HashMap::new();
        for (id, sample) in running.iter().zip(samples) {
            match sample {
                Ok(stats) => {
                    collected.insert(id.clone(), stats);
                }
                Err(e) => {
                    debug!(sandbox_id = %id, error = %e, "failed to sample memory");
                    report.failed += 1;
                }
            }
        }
        report.sampled = collected.len();

        for stats in collected.values() {
            if !stats.is_balloon_driver_active() {
                report.skipped += 1;
                continue;
            }
            match self.adjust(stats).await {
                Ok(true) => report.adjusted += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(sandbox_id = %stats.sandbox_id, error = %e, "failed to resize balloon");
                    report.failed += 1;
                }
            }
        }

        if let Some(store) = &self.store {
            store.record_batch(&collected);
        }
        *self.last_stats.lock().unwrap_or_else(|e| e.into_inner()) = collected;

        debug!(?report, "memory controller cycle done");
        Ok(report)
    }

    async fn adjust(&self, stats: &VMMemoryStats) -> RunnerResult<bool> {
        let current = stats.balloon_size_kib;
        let target = calculate_target_balloon(&self.config, stats);
        if !exceeds_tolerance(&self.config, stats.max_memory_kib, current, target) {
            return Ok(false);
        }

        self.client
            .resize_balloon(&stats.sandbox_id, target * 1024)
            .await?;

        BALLOON_SIZE_BYTES
            .with_label_values(&[&stats.sandbox_id])
            .set((target * 1024) as f64);
        if target > current {
            BALLOON_ADJUSTMENTS.with_label_values(&["reclaim"]).inc();
            info!(
                sandbox_id = %stats.sandbox_id,
                reclaimed_mib = (target - current) / 1024,
                balloon_mib = target / 1024,
                "reclaimed guest memory"
            );
        } else {
            BALLOON_ADJUSTMENTS.with_label_values(&["return"]).inc();
            info!(
                sandbox_id = %stats.sandbox_id,
                returned_mib = (current - target) / 1024,
                balloon_mib = target / 1024,
                "returned memory to guest"
            );
        }
        Ok(true)
    }

    /// Samples of the last cycle, copied
    pub fn get_last_stats(&self) -> HashMap<String, VMMemoryStats> {
        self.last_stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for MemoryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryController")
            .field("config", &self.config)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024;

    fn stats(max_gib: u64, used_gib: u64) -> VMMemoryStats {
        VMMemoryStats {
            sandbox_id: "sb".into(),
            max_memory_kib: max_gib * GIB,
            mem_total_kib: max_gib * GIB,
            mem_available_kib: (max_gib - used_gib) * GIB,
            ..Default::default()
        }
    }

    fn config(min_gib: u64) -> MemoryControllerConfig {
        MemoryControllerConfig {
            min_guest_memory_kib: min_gib * GIB,
            ..Default::default()
        }
    }

    #[test]
    fn test_balloon_for_six_of_sixteen() {
        let config = config(4);
        let sample = stats(16, 6);

        let balloon = calculate_target_balloon(&config, &sample);
        let target_guest = sample.max_memory_kib - balloon;

        // buffer = max(1 GiB, 1.5 GiB)
        assert_eq!(target_guest, 7 * GIB + GIB / 2);
        assert_eq!(balloon, 8 * GIB + GIB / 2);
    }

    #[test]
    fn test_balloon_clamped_to_zero() {
        let config = config(4);
        let sample = stats(8, 7);
        assert_eq!(calculate_target_balloon(&config, &sample), 0);
    }

    #[test]
    fn test_guest_never_below_minimum() {
        let config = config(4);
        let sample = stats(16, 1);

        let balloon = calculate_target_balloon(&config, &sample);
        assert_eq!(balloon, 12 * GIB);
    }

    #[test]
    fn test_floor_buffer_wins_for_small_usage() {
        let config = config(1);
        let sample = stats(16, 2);

        // 25% of 2 GiB is below the 1 GiB floor
        assert_eq!(calculate_target_balloon(&config, &sample), 13 * GIB);
    }

    #[test]
    fn test_tolerance() {
        let config = MemoryControllerConfig::default();
        let max = 16 * GIB;
        assert!(!exceeds_tolerance(&config, max, 0, 100_000));
        assert!(exceeds_tolerance(&config, max, 0, 200_000));
        assert!(exceeds_tolerance(&config, max, 8 * GIB, 0));
    }
}

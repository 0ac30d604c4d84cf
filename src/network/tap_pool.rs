//! Pre-created TAP devices on the host bridge
//!
//! Creating a TAP device and enslaving it to the bridge takes a few hundred
//! milliseconds. The pool keeps idle devices ready so bridge-networked
//! sandboxes can attach immediately.
//!
//! ```text
//!  replenisher (every 5s, when idle < target/2)
//!        │ create chtap{n}
//!        ▼
//!  ┌───────────────────────┐  acquire(id)  ┌──────────────────┐
//!  │ idle: chtap3 chtap4 … │──────────────►│ assigned: id → N │
//!  └───────────────────────┘◄──────────────└──────────────────┘
//!        ▲                    release(id)       │ pool full
//!        └─────────────────────────────────────►└─► ip link del
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ResultExt, RunnerError, RunnerResult};
use crate::metrics::POOL_AVAILABLE;
use crate::runner::CommandRunner;

pub const TAP_PREFIX: &str = "chtap";
pub const TAP_MARKER: &str = "tap";
const REPLENISH_INTERVAL: Duration = Duration::from_secs(5);

/// Settings for [`TapPool`]
#[derive(Debug, Clone)]
pub struct TapPoolConfig {
    pub bridge: String,
    pub create_script: String,
    pub delete_script: String,
    /// Idle devices to keep ready
    pub target_size: usize,
    /// Idle plus assigned devices never exceed this.
    pub max_size: usize,
}

struct TapState {
    idle: VecDeque<String>,
    assigned: HashMap<String, String>,
    /// Devices being created outside the lock
    creating: usize,
    next_index: u32,
}

impl TapState {
    fn total(&self) -> usize {
        self.idle.len() + self.assigned.len() + self.creating
    }

    fn next_name(&mut self) -> String {
        let name = format!("{}{}", TAP_PREFIX, self.next_index);
        self.next_index += 1;
        name
    }
}

pub struct TapPool {
    runner: Arc<dyn CommandRunner>,
    config: TapPoolConfig,
    state: Mutex<TapState>,
}

impl TapPool {
    pub fn new(runner: Arc<dyn CommandRunner>, config: TapPoolConfig) -> Self {
        Self {
            runner,
            config,
            state: Mutex::new(TapState {
                idle: VecDeque::new(),
                assigned: HashMap::new(),
                creating: 0,
                next_index: 0,
            }),
        }
    }

    /// Rebuilds assignments from `tap` marker files and adopts idle
    /// `chtap*` devices left over from a previous run.
    pub async fn initialize(&self, sandboxes_path: &str) -> RunnerResult<()> {
        let sandboxes = self.runner.list_dir(sandboxes_path).await?;
        let mut assigned = HashMap::new();
        for sandbox_id in sandboxes.iter().filter(|s| !s.starts_with('.')) {
            let marker = format!("{}/{}/{}", sandboxes_path, sandbox_id, TAP_MARKER);
            if let Ok(name) = self.runner.read_file(&marker).await {
                let name = name.trim();
                if !name.is_empty() {
                    assigned.insert(sandbox_id.clone(), name.to_string());
                }
            }
        }

        let existing = self
            .runner
            .run("ip", &["-o", "link", "show"])
            .await
            .map(|out| parse_tap_names(&out))
            .unwrap_or_default();

        let mut state = self.lock();
        let max_index = existing
            .iter()
            .chain(assigned.values())
            .filter_map(|name| name.strip_prefix(TAP_PREFIX)?.parse::<u32>().ok())
            .max();
        if let Some(max) = max_index {
            state.next_index = state.next_index.max(max + 1);
        }
        for name in existing {
            if !assigned.values().any(|n| *n == name) && !state.idle.contains(&name) {
                state.idle.push_back(name);
            }
        }
        state.assigned.extend(assigned);
        self.publish(&state);

        info!(
            idle = state.idle.len(),
            assigned = state.assigned.len(),
            "TAP pool initialized"
        );
        Ok(())
    }

    /// Takes an idle device for `sandbox_id`, creating one if none is idle
    pub async fn acquire(&self, sandbox_id: &str) -> RunnerResult<String> {
        let name = {
            let mut state = self.lock();
            if let Some(name) = state.assigned.get(sandbox_id) {
                return Ok(name.clone());
            }
            if let Some(name) = state.idle.pop_front() {
                state.assigned.insert(sandbox_id.to_string(), name.clone());
                self.publish(&state);
                debug!(sandbox_id, tap = %name, "TAP taken from pool");
                return Ok(name);
            }
            if state.total() >= self.config.max_size {
                return Err(RunnerError::PoolExhausted("tap"));
            }
            state.creating += 1;
            state.next_name()
        };

        let created = self.create_tap(&name).await;
        let mut state = self.lock();
        state.creating -= 1;
        created?;
        state.assigned.insert(sandbox_id.to_string(), name.clone());
        debug!(sandbox_id, tap = %name, "TAP created on demand");
        Ok(name)
    }

    /// Returns the sandbox's device to the pool, or deletes it if the pool
    /// is already at its target size.
    pub async fn release(&self, sandbox_id: &str) -> RunnerResult<()> {
        let to_delete = {
            let mut state = self.lock();
            let Some(name) = state.assigned.remove(sandbox_id) else {
                return Ok(());
            };
            if state.idle.len() < self.config.target_size {
                state.idle.push_back(name);
                self.publish(&state);
                return Ok(());
            }
            name
        };

        self.delete_tap(&to_delete).await
    }

    pub fn get(&self, sandbox_id: &str) -> Option<String> {
        self.lock().assigned.get(sandbox_id).cloned()
    }

    /// Number of idle devices
    pub fn available(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn target_size(&self) -> usize {
        self.config.target_size
    }

    /// Creates devices until the idle count reaches the target
    pub async fn fill(&self) -> RunnerResult<usize> {
        let names: Vec<String> = {
            let mut state = self.lock();
            let wanted = self.config.target_size.saturating_sub(state.idle.len() + state.creating);
            let room = self.config.max_size.saturating_sub(state.total());
            let count = wanted.min(room);
            state.creating += count;
            (0..count).map(|_| state.next_name()).collect()
        };

        let mut created = 0;
        let mut first_error = None;
        for name in names {
            let result = self.create_tap(&name).await;
            let mut state = self.lock();
            state.creating -= 1;
            match result {
                Ok(()) => {
                    state.idle.push_back(name);
                    created += 1;
                }
                Err(e) => {
                    warn!(tap = %name, error = %e, "failed to create pooled TAP");
                    first_error.get_or_insert(e);
                }
            }
            self.publish(&state);
        }

        match first_error {
            Some(e) if created == 0 => Err(e),
            _ => Ok(created),
        }
    }

    /// Tops up the pool if it fell below half its target
    pub async fn replenish(&self) -> RunnerResult<usize> {
        let idle = self.available();
        if idle * 2 >= self.config.target_size {
            return Ok(0);
        }
        let created = self.fill().await?;
        debug!(created, "TAP pool replenished");
        Ok(created)
    }

    /// Fills the pool, then keeps it topped up until `token` is cancelled.
    /// Idle devices are deleted on shutdown.
    pub fn start(pool: Arc<TapPool>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = pool.fill().await {
                warn!(error = %e, "initial TAP pool fill failed");
            }

            let mut interval = tokio::time::interval(REPLENISH_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = pool.replenish().await {
                            warn!(error = %e, "TAP pool replenish failed");
                        }
                    }
                }
            }

            pool.shutdown().await;
        })
    }

    /// Deletes every idle device
    pub async fn shutdown(&self) {
        let idle: Vec<String> = {
            let mut state = self.lock();
            let drained = state.idle.drain(..).collect();
            self.publish(&state);
            drained
        };
        for name in idle {
            if let Err(e) = self.delete_tap(&name).await {
                warn!(tap = %name, error = %e, "failed to delete idle TAP");
            }
        }
        info!("TAP pool shut down");
    }

    async fn create_tap(&self, name: &str) -> RunnerResult<()> {
        if self.runner.file_exists(&self.config.create_script).await.unwrap_or(false) {
            self.runner
                .run(&self.config.create_script, &[name, &self.config.bridge])
                .await
                .with_context(|| format!("failed to create TAP {}", name))?;
        } else {
            let script = format!(
                "ip tuntap add dev {name} mode tap && ip link set {name} master {bridge} && ip link set {name} up",
                name = name,
                bridge = self.config.bridge,
            );
            self.runner
                .run_script(&script)
                .await
                .with_context(|| format!("failed to create TAP {}", name))?;
        }
        Ok(())
    }

    async fn delete_tap(&self, name: &str) -> RunnerResult<()> {
        let result = if self.runner.file_exists(&self.config.delete_script).await.unwrap_or(false) {
            self.runner.run(&self.config.delete_script, &[name]).await
        } else {
            self.runner.run("ip", &["link", "del", name]).await
        };
        result
            .map(|_| ())
            .with_context(|| format!("failed to delete TAP {}", name))
    }

    fn publish(&self, state: &TapState) {
        POOL_AVAILABLE
            .with_label_values(&["tap"])
            .set(state.idle.len() as f64);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TapState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Extracts pool device names from `ip -o link show` output
fn parse_tap_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split(": ").nth(1))
        .map(|name| name.split('@').next().unwrap_or(name).trim_end_matches(':'))
        .filter(|name| name.starts_with(TAP_PREFIX))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tap_names() {
        let out = "1: lo: <LOOPBACK,UP> mtu 65536\n\
                   5: chtap0: <BROADCAST,MULTICAST> mtu 1500 master br0\n\
                   6: veth3@if2: <BROADCAST> mtu 1500\n\
                   7: chtap12: <BROADCAST> mtu 1500\n";
        assert_eq!(parse_tap_names(out), vec!["chtap0", "chtap12"]);
    }

    #[test]
    fn test_names_are_sequential() {
        let mut state = TapState {
            idle: VecDeque::new(),
            assigned: HashMap::new(),
            creating: 0,
            next_index: 3,
        };
        assert_eq!(state.next_name(), "chtap3");
        assert_eq!(state.next_name(), "chtap4");
    }
}

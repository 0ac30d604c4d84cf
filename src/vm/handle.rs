//! Sandbox process tracking
//!
//! Each locally started hypervisor is tracked as a [`SandboxProcess`]:
//! Starting -> Running -> Stopping, or Failed when it exits on its own.
//!
//! A watcher task owns the child. It either kills it on request or notices an
//! unexpected exit, marks the handle failed, evicts the cached API client and
//! removes the stale socket so `start`/recovery can reconcile the sandbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::hypervisor::VmmApi;
use crate::runner::CommandRunner;

/// Status of a tracked hypervisor process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    /// Started; the API socket is not up yet
    Starting,
    Running,
    /// Kill requested
    Stopping,
    /// Exited without being asked to
    Failed(String),
}

/// A hypervisor process started by this runner
#[derive(Debug, Clone)]
pub struct SandboxProcess {
    pub sandbox_id: String,
    pub pid: Option<u32>,
    pub socket_path: String,
    pub status: ProcessStatus,
    pub started_at: Instant,
}

impl SandboxProcess {
    pub fn is_running(&self) -> bool {
        matches!(self.status, ProcessStatus::Running)
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

struct Tracked {
    process: SandboxProcess,
    kill: Option<oneshot::Sender<()>>,
    /// Watchers only touch the entry they were spawned for
    generation: u64,
}

/// Tracks the hypervisor processes this runner owns
pub struct ProcessTracker {
    runner: Arc<dyn CommandRunner>,
    vmm: Arc<dyn VmmApi>,
    processes: Arc<Mutex<HashMap<String, Tracked>>>,
    generations: AtomicU64,
}

impl ProcessTracker {
    pub fn new(runner: Arc<dyn CommandRunner>, vmm: Arc<dyn VmmApi>) -> Self {
        Self {
            runner,
            vmm,
            processes: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    /// Takes ownership of `child` and watches it until it exits
    pub fn track(&self, sandbox_id: &str, socket_path: &str, mut child: Child) {
        let (kill_tx, kill_rx) = oneshot::channel();
        let process = SandboxProcess {
            sandbox_id: sandbox_id.to_string(),
            pid: child.id(),
            socket_path: socket_path.to_string(),
            status: ProcessStatus::Starting,
            started_at: Instant::now(),
        };
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        debug!(sandbox_id, pid = ?process.pid, generation, "tracking hypervisor process");

        let previous = lock(&self.processes).insert(
            sandbox_id.to_string(),
            Tracked {
                process,
                kill: Some(kill_tx),
                generation,
            },
        );
        if let Some(mut previous) = previous {
            if let Some(kill) = previous.kill.take() {
                let _ = kill.send(());
            }
        }

        let processes = Arc::clone(&self.processes);
        let runner = Arc::clone(&self.runner);
        let vmm = Arc::clone(&self.vmm);
        let sandbox_id = sandbox_id.to_string();
        let socket_path = socket_path.to_string();

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("hypervisor exited with {}", status),
                        Err(e) => format!("failed to wait for hypervisor: {}", e),
                    };

                    let unexpected = {
                        let mut map = lock(&processes);
                        match map.get_mut(&sandbox_id).filter(|t| t.generation == generation) {
                            Some(tracked) if tracked.process.status != ProcessStatus::Stopping => {
                                tracked.process.status = ProcessStatus::Failed(reason.clone());
                                tracked.kill = None;
                                true
                            }
                            Some(_) => {
                                map.remove(&sandbox_id);
                                false
                            }
                            None => false,
                        }
                    };

                    if unexpected {
                        error!(sandbox_id = %sandbox_id, %reason, "hypervisor process exited unexpectedly");
                        vmm.evict(&socket_path);
                        if let Err(e) = runner.remove_all(&socket_path).await {
                            warn!(sandbox_id = %sandbox_id, error = %e, "failed to remove stale socket");
                        }
                    }
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        debug!(sandbox_id = %sandbox_id, error = %e, "kill failed, process already gone");
                    }
                    {
                        let mut map = lock(&processes);
                        if map.get(&sandbox_id).is_some_and(|t| t.generation == generation) {
                            map.remove(&sandbox_id);
                        }
                    }
                    info!(sandbox_id = %sandbox_id, "hypervisor process stopped");
                }
            }
        });
    }

    /// Marks the process as up once its API socket answers
    pub fn mark_running(&self, sandbox_id: &str) {
        if let Some(tracked) = lock(&self.processes).get_mut(sandbox_id) {
            if tracked.process.status == ProcessStatus::Starting {
                tracked.process.status = ProcessStatus::Running;
            }
        }
    }

    /// Asks the watcher to kill the process. Returns false if nothing was
    /// tracked or the process had already exited.
    pub fn kill(&self, sandbox_id: &str) -> bool {
        let mut map = lock(&self.processes);
        let Some(tracked) = map.get_mut(sandbox_id) else {
            return false;
        };
        match tracked.kill.take() {
            Some(kill) => {
                tracked.process.status = ProcessStatus::Stopping;
                kill.send(()).is_ok()
            }
            None => {
                map.remove(sandbox_id);
                false
            }
        }
    }

    /// Drops a failed handle once the sandbox has been reconciled
    pub fn forget(&self, sandbox_id: &str) {
        let mut map = lock(&self.processes);
        if map
            .get(sandbox_id)
            .is_some_and(|t| matches!(t.process.status, ProcessStatus::Failed(_)))
        {
            map.remove(sandbox_id);
        }
    }

    pub fn get(&self, sandbox_id: &str) -> Option<SandboxProcess> {
        lock(&self.processes)
            .get(sandbox_id)
            .map(|t| t.process.clone())
    }

    /// Ids whose hypervisor died without being asked to
    pub fn failed(&self) -> Vec<String> {
        lock(&self.processes)
            .values()
            .filter(|t| matches!(t.process.status, ProcessStatus::Failed(_)))
            .map(|t| t.process.sandbox_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.processes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ProcessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTracker")
            .field("tracked", &self.len())
            .finish()
    }
}

fn lock(map: &Mutex<HashMap<String, Tracked>>) -> std::sync::MutexGuard<'_, HashMap<String, Tracked>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::LocalRunner;
    use crate::vm::hypervisor::HttpVmmApi;

    fn tracker() -> ProcessTracker {
        ProcessTracker::new(Arc::new(LocalRunner::new()), Arc::new(HttpVmmApi::new()))
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_unexpected_exit_marks_failed() {
        let tracker = tracker();
        let child = tokio::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();

        tracker.track("sb-crash", "/tmp/chvisor-test-missing.sock", child);
        wait_until(|| !tracker.failed().is_empty()).await;

        let process = tracker.get("sb-crash").unwrap();
        assert!(matches!(process.status, ProcessStatus::Failed(_)));
        assert_eq!(tracker.failed(), vec!["sb-crash".to_string()]);

        tracker.forget("sb-crash");
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_kill_removes_tracking() {
        let tracker = tracker();
        let child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();

        tracker.track("sb-kill", "/tmp/chvisor-test-kill.sock", child);
        tracker.mark_running("sb-kill");
        assert!(tracker.get("sb-kill").unwrap().is_running());

        assert!(tracker.kill("sb-kill"));
        wait_until(|| tracker.is_empty()).await;
        assert!(tracker.get("sb-kill").is_none());
        assert!(tracker.failed().is_empty());
    }

    #[tokio::test]
    async fn test_stale_watcher_keeps_replacement() {
        let tracker = tracker();
        let old = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        tracker.track("sb-restart", "/tmp/chvisor-test-restart.sock", old);
        tracker.mark_running("sb-restart");
        assert!(tracker.kill("sb-restart"));

        let new = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let new_pid = new.id();
        tracker.track("sb-restart", "/tmp/chvisor-test-restart.sock", new);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let process = tracker.get("sb-restart").unwrap();
        assert_eq!(process.pid, new_pid);
        assert_eq!(process.status, ProcessStatus::Starting);

        assert!(tracker.kill("sb-restart"));
        wait_until(|| tracker.is_empty()).await;
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_replaced_entry_survives_old_exit() {
        let tracker = tracker();
        let old = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        tracker.track("sb-swap", "/tmp/chvisor-test-swap.sock", old);

        let new = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let new_pid = new.id();
        tracker.track("sb-swap", "/tmp/chvisor-test-swap.sock", new);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(tracker.get("sb-swap").unwrap().pid, new_pid);
        assert!(tracker.failed().is_empty());
        tracker.kill("sb-swap");
    }

    #[test]
    fn test_kill_untracked_is_noop() {
        assert!(!tracker().kill("nope"));
    }
}

//! Bounded waits on hypervisor readiness
//!
//! Both waits poll on a fixed interval until a deadline and return
//! [`RunnerError::Timeout`] on expiry. Callers decide whether that is fatal.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::config::{VmInfo, VmState};
use super::hypervisor::VmmApi;
use super::request::VmmRequest;
use crate::error::{RunnerError, RunnerResult};
use crate::runner::CommandRunner;

pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait for a fresh hypervisor to create its API socket
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait for boot, resume or shutdown to take effect
pub const STATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait for a restored VM to reach Running
pub const RESTORE_TIMEOUT: Duration = Duration::from_secs(60);

/// Calls `vm.info` and parses the response
pub async fn fetch_info(vmm: &dyn VmmApi, socket: &str) -> RunnerResult<VmInfo> {
    let body = vmm.call(socket, &VmmRequest::Info).await?;
    Ok(serde_json::from_str(&body)?)
}

/// Waits until the API socket file exists
///
/// # Arguments
/// * `socket` - Path of the hypervisor API socket
/// * `timeout` - Deadline for the socket to appear
pub async fn wait_for_socket(
    runner: &dyn CommandRunner,
    socket: &str,
    timeout: Duration,
) -> RunnerResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if runner.file_exists(socket).await.unwrap_or(false) {
            debug!(socket, "API socket ready");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RunnerError::timeout(format!("socket {}", socket), timeout));
        }
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
    }
}

/// Polls `vm.info` until the VM reports `target`
///
/// API errors while polling are tolerated; the hypervisor may still be
/// settling after a restore. The last error is reported on timeout.
pub async fn wait_for_state(
    vmm: &dyn VmmApi,
    socket: &str,
    target: VmState,
    timeout: Duration,
) -> RunnerResult<VmInfo> {
    let deadline = Instant::now() + timeout;
    let mut last = None;
    loop {
        match fetch_info(vmm, socket).await {
            Ok(info) if info.state == target => return Ok(info),
            Ok(info) => last = Some(info.state.to_string()),
            Err(e) => {
                trace!(socket, error = %e, "vm.info failed while waiting");
                last = Some(e.to_string());
            }
        }
        if Instant::now() >= deadline {
            let seen = last.unwrap_or_else(|| "nothing".to_string());
            return Err(RunnerError::timeout(
                format!("state {} on {} (last seen: {})", target, socket, seen),
                timeout,
            ));
        }
        tokio::time::sleep(STATE_POLL_INTERVAL).await;
    }
}

//! Copy-on-write fork of a running sandbox
//!
//! ```text
//!  source (paused)                           fork
//! ┌───────────────┐   vm.snapshot    ┌──────────────────────┐
//! │ disk.raw ◄────┼──── backing ─────┤ disk.raw (qcow2 CoW) │
//! │ memory ───────┼──► fork-{src}-*/ ─► vm.restore           │
//! └───────────────┘                  └──────────────────────┘
//! ```
//!
//! The source stays paused until the fork has restored, then goes back to
//! the state it was in. The fork's overlay keeps referencing the source
//! disk for its whole life.

use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::client::{Client, PARENT_MARKER};
use super::config::{RestoreConfig, SandboxInfo, VmInfo, VmState};
use super::create::{validate_sandbox_id, NET_DEVICE_ID};
use super::lifecycle::SOCKET_TIMEOUT;
use super::net_fds;
use super::recovery::SandboxConfig;
use super::request::VmmRequest;
use super::snapshot::patch_snapshot_config;
use crate::error::{ResultExt, RunnerError, RunnerResult};
use crate::metrics::observe_operation;
use crate::network::netns::NAMESPACE_TAP;
use crate::network::NetNamespace;

#[derive(Debug, Clone, TypedBuilder)]
pub struct ForkOptions {
    #[builder(setter(into))]
    pub source_sandbox_id: String,
    #[builder(setter(into))]
    pub new_sandbox_id: String,
    /// Fault in all guest memory during restore
    #[builder(default)]
    pub prefault: bool,
}

impl Client {
    /// Forks a Running or Paused sandbox into `new_sandbox_id`
    ///
    /// The source ends in the state it started in, whether or not the fork
    /// succeeds.
    pub async fn fork(&self, options: ForkOptions) -> RunnerResult<SandboxInfo> {
        let source = options.source_sandbox_id.as_str();
        let target = options.new_sandbox_id.as_str();
        validate_sandbox_id(source)?;
        validate_sandbox_id(target)?;
        if source == target {
            return Err(RunnerError::InvalidArgument(
                "fork source and target are the same sandbox".to_string(),
            ));
        }

        let started = Instant::now();
        let _source_guard = self.lock(source).await;
        let _target_guard = self.lock(target).await;
        let result = self.fork_locked(source, target, options.prefault).await;
        observe_operation("fork", started, &result);
        result
    }

    async fn fork_locked(&self, source: &str, target: &str, prefault: bool) -> RunnerResult<SandboxInfo> {
        self.ensure_target_free(target).await?;

        let info = self
            .require_state(source, "fork", &[VmState::Running, VmState::Paused])
            .await?;
        let was_running = info.state == VmState::Running;
        if was_running {
            self.api(source, VmmRequest::Pause)
                .await
                .context("failed to pause source for fork")?;
        }

        let snapshot_dir = self
            .config
            .snapshot_path(&format!("fork-{}-{}", source, Uuid::now_v7()));
        info!(source, target, snapshot = %snapshot_dir, "forking sandbox");

        let result = self
            .fork_into(source, target, &snapshot_dir, &info, prefault)
            .await;

        if was_running {
            if let Err(e) = self.api(source, VmmRequest::Resume).await {
                warn!(sandbox_id = source, error = %e, "failed to resume fork source");
            }
        }

        if let Err(e) = result {
            warn!(source, target, error = %e, "fork failed, cleaning up");
            self.cleanup_sandbox(target).await;
            if let Err(e) = self.runner.remove_all(&snapshot_dir).await {
                warn!(dir = %snapshot_dir, error = %e, "failed to remove fork snapshot");
            }
            return Err(e);
        }

        self.update_sandbox_state(target, VmState::Running).await;
        info!(source, target, "sandbox forked");
        self.get_sandbox_info(target).await
    }

    /// Rejects a target id that already has a socket or a directory
    pub(crate) async fn ensure_target_free(&self, target: &str) -> RunnerResult<()> {
        if self.socket_exists(target).await
            || self
                .runner
                .file_exists(&self.config.sandbox_dir(target))
                .await?
        {
            return Err(RunnerError::AlreadyExists(format!("sandbox {}", target)));
        }
        Ok(())
    }

    async fn fork_into(
        &self,
        source: &str,
        target: &str,
        snapshot_dir: &str,
        source_info: &VmInfo,
        prefault: bool,
    ) -> RunnerResult<()> {
        self.take_memory_snapshot(source, snapshot_dir).await?;

        let source_disk = source_info
            .config
            .as_ref()
            .and_then(|c| c.disks.first())
            .map(|d| d.path.clone())
            .unwrap_or_else(|| self.config.disk_path(source));
        let target_disk = self.config.disk_path(target);
        self.runner
            .create_dir_all(&self.config.sandbox_dir(target))
            .await?;
        self.runner
            .run(
                "qemu-img",
                &[
                    "create",
                    "-f",
                    "qcow2",
                    "-F",
                    "qcow2",
                    "-b",
                    &source_disk,
                    &target_disk,
                ],
            )
            .await
            .context("failed to create fork overlay")?;

        self.retarget_snapshot(snapshot_dir, &target_disk).await?;

        let ns = self
            .netns
            .create(target)
            .await
            .context("failed to create network namespace")?;
        self.record_ip(target, &ns.external_ip.to_string()).await?;

        self.start_hypervisor(target, Some(&ns), SOCKET_TIMEOUT)
            .await?;

        let net_id = source_info
            .config
            .as_ref()
            .and_then(|c| c.net.first())
            .and_then(|n| n.id.clone())
            .unwrap_or_else(|| NET_DEVICE_ID.to_string());
        self.restore_fork(target, &ns, &net_id, snapshot_dir, prefault)
            .await?;
        self.resume_restored(target).await?;

        self.discard_snapshot_memory(snapshot_dir).await;
        self.write_marker(target, PARENT_MARKER, source).await?;
        self.save_vm_config(target).await?;
        self.save_derived_config(source, target, &ns).await
    }

    /// Restores with the TAP handed over as a descriptor when the hypervisor
    /// runs locally, falling back to a plain restore
    async fn restore_fork(
        &self,
        target: &str,
        ns: &NetNamespace,
        net_id: &str,
        snapshot_dir: &str,
        prefault: bool,
    ) -> RunnerResult<()> {
        if !self.is_remote() {
            let socket = self.config.socket_path(target);
            match net_fds::restore_with_net_fds(
                &socket,
                &ns.name,
                NAMESPACE_TAP,
                net_id,
                snapshot_dir,
                prefault,
            )
            .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(sandbox_id = target, error = %e, "restore with TAP fd failed, falling back")
                }
            }
        }

        self.api(
            target,
            VmmRequest::Restore(RestoreConfig::from_dir(snapshot_dir, prefault)),
        )
        .await
        .context("failed to restore fork")?;
        Ok(())
    }

    /// Points the snapshot's config at the new disk and the namespace TAP
    pub(crate) async fn retarget_snapshot(&self, snapshot_dir: &str, disk: &str) -> RunnerResult<()> {
        let config_path = format!("{}/config.json", snapshot_dir);
        let raw = self
            .runner
            .read_file(&config_path)
            .await
            .context("failed to read snapshot config")?;
        let patched = patch_snapshot_config(&raw, disk, Some(NAMESPACE_TAP))?;
        self.runner
            .write_file(&config_path, patched.as_bytes())
            .await
            .context("failed to patch snapshot config")
    }

    /// Drops the memory files of a consumed snapshot; the config stays for
    /// diagnostics
    pub(crate) async fn discard_snapshot_memory(&self, snapshot_dir: &str) {
        let script = format!("rm -f {}/memory*", crate::runner::shell_quote(snapshot_dir));
        if let Err(e) = self.runner.run_script(&script).await {
            warn!(dir = snapshot_dir, error = %e, "failed to remove snapshot memory files");
        }
    }

    /// Persists a `sandbox.json` for `target` based on the source's
    pub(crate) async fn save_derived_config(
        &self,
        source: &str,
        target: &str,
        ns: &NetNamespace,
    ) -> RunnerResult<()> {
        let mut config = self
            .load_sandbox_config(source)
            .await
            .unwrap_or_else(|_| SandboxConfig::fallback(source, &self.config));
        config.sandbox_id = target.to_string();
        config.created_at = Utc::now();
        config.last_state = Some(VmState::Running);
        self.save_sandbox_config(&config.with_namespace(ns)).await
    }
}

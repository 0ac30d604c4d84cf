//! Full clone of a running sandbox
//!
//! Unlike a fork, a clone shares nothing with its source: the disk is copied
//! and flattened, and memory comes from a one-off snapshot.

use std::time::Instant;

use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::client::{Client, SOURCE_MARKER};
use super::config::{RestoreConfig, SandboxInfo, VmState};
use super::create::validate_sandbox_id;
use super::lifecycle::SOCKET_TIMEOUT;
use super::request::VmmRequest;
use crate::error::{ResultExt, RunnerError, RunnerResult};
use crate::metrics::observe_operation;

#[derive(Debug, Clone, TypedBuilder)]
pub struct CloneOptions {
    #[builder(setter(into))]
    pub source_sandbox_id: String,
    #[builder(setter(into))]
    pub new_sandbox_id: String,
    #[builder(default)]
    pub prefault: bool,
}

impl Client {
    /// Clones a Running or Paused sandbox into an independent one
    pub async fn clone_sandbox(&self, options: CloneOptions) -> RunnerResult<SandboxInfo> {
        let source = options.source_sandbox_id.as_str();
        let target = options.new_sandbox_id.as_str();
        validate_sandbox_id(source)?;
        validate_sandbox_id(target)?;
        if source == target {
            return Err(RunnerError::InvalidArgument(
                "clone source and target are the same sandbox".to_string(),
            ));
        }

        let started = Instant::now();
        let _source_guard = self.lock(source).await;
        let _target_guard = self.lock(target).await;
        let result = self.clone_locked(source, target, options.prefault).await;
        observe_operation("clone", started, &result);
        result
    }

    async fn clone_locked(&self, source: &str, target: &str, prefault: bool) -> RunnerResult<SandboxInfo> {
        self.ensure_target_free(target).await?;

        let source_disk = self.config.disk_path(source);
        if !self.runner.file_exists(&source_disk).await? {
            return Err(RunnerError::NotFound(format!("disk of sandbox {}", source)));
        }

        let info = self
            .require_state(source, "clone", &[VmState::Running, VmState::Paused])
            .await?;
        let was_running = info.state == VmState::Running;
        if was_running {
            self.api(source, VmmRequest::Pause)
                .await
                .context("failed to pause source for clone")?;
        }

        let snapshot_dir = self
            .config
            .snapshot_path(&format!("clone-{}-{}", source, Uuid::now_v7()));
        info!(source, target, snapshot = %snapshot_dir, "cloning sandbox");

        let result = self
            .clone_into(source, target, &snapshot_dir, prefault)
            .await;

        if was_running {
            if let Err(e) = self.api(source, VmmRequest::Resume).await {
                warn!(sandbox_id = source, error = %e, "failed to resume clone source");
            }
        }

        if let Err(e) = result {
            warn!(source, target, error = %e, "clone failed, cleaning up");
            self.cleanup_sandbox(target).await;
            if let Err(e) = self.runner.remove_all(&snapshot_dir).await {
                warn!(dir = %snapshot_dir, error = %e, "failed to remove clone snapshot");
            }
            return Err(e);
        }

        self.update_sandbox_state(target, VmState::Running).await;
        info!(source, target, "sandbox cloned");
        self.get_sandbox_info(target).await
    }

    async fn clone_into(
        &self,
        source: &str,
        target: &str,
        snapshot_dir: &str,
        prefault: bool,
    ) -> RunnerResult<()> {
        self.take_memory_snapshot(source, snapshot_dir).await?;

        let target_disk = self.config.disk_path(target);
        self.runner
            .create_dir_all(&self.config.sandbox_dir(target))
            .await?;
        self.flatten_disk(&self.config.disk_path(source), &target_disk)
            .await?;
        self.retarget_snapshot(snapshot_dir, &target_disk).await?;

        let ns = self
            .netns
            .create(target)
            .await
            .context("failed to create network namespace")?;
        self.record_ip(target, &ns.external_ip.to_string()).await?;

        self.start_hypervisor(target, Some(&ns), SOCKET_TIMEOUT)
            .await?;
        self.api(
            target,
            VmmRequest::Restore(RestoreConfig::from_dir(snapshot_dir, prefault)),
        )
        .await
        .context("failed to restore clone")?;
        self.resume_restored(target).await?;

        self.discard_snapshot_memory(snapshot_dir).await;
        self.write_marker(target, SOURCE_MARKER, source).await?;
        self.save_vm_config(target).await?;
        self.save_derived_config(source, target, &ns).await
    }
}

//! Snapshots and restore
//!
//! A snapshot directory holds the hypervisor's memory and device state
//! (`config.json`, `state.json`, `memory-ranges`) plus a flattened
//! `disk.qcow2` with no backing file, so it outlives the sandbox it was
//! taken from.
//!
//! The VM is paused while memory and disk are captured and is resumed on
//! every path afterwards, unless it was already paused.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use super::client::{Client, PARENT_MARKER, SOURCE_MARKER};
use super::config::{RestoreConfig, SandboxInfo, SnapshotConfig, VmState};
use super::create::validate_sandbox_id;
use super::lifecycle::{RESTORE_TIMEOUT, SOCKET_TIMEOUT};
use super::recovery::SandboxConfig;
use super::request::VmmRequest;
use crate::error::{ResultExt, RunnerError, RunnerResult};
use crate::metrics::observe_operation;
use crate::network::netns::NAMESPACE_TAP;

const RESTORE_STAGING_DIR: &str = "restore-snapshot";
/// Files of a hypervisor snapshot that are copied when staging a restore
const STATE_FILES: [&str; 2] = ["memory-ranges", "state.json"];

/// Receives finished snapshot directories, e.g. for upload to object storage
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn store(&self, snapshot: &SnapshotResult) -> RunnerResult<()>;
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct SnapshotOptions {
    #[builder(setter(into))]
    pub sandbox_id: String,
    /// Defaults to `{sandbox_id}-{unix seconds}`
    #[builder(default, setter(strip_option, into))]
    pub name: Option<String>,
    #[builder(default, setter(strip_option, into))]
    pub organization_id: Option<String>,
}

impl SnapshotOptions {
    fn resolved_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            format!("{}-{}", self.sandbox_id, now)
        })
    }

    /// `org/name`, or just `name` without an organization
    fn reference(&self, name: &str) -> String {
        match &self.organization_id {
            Some(org) => format!("{}/{}", org, name),
            None => name.to_string(),
        }
    }
}

/// A finished user-facing snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResult {
    pub name: String,
    /// Reference usable as `CreateOptions::snapshot`
    pub snapshot_ref: String,
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct RestoreOptions {
    /// Absolute, or relative to the snapshots directory
    #[builder(setter(into))]
    pub snapshot_path: String,
    #[builder(setter(into))]
    pub sandbox_id: String,
    #[builder(default)]
    pub prefault: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub name: String,
    pub path: String,
    pub disk_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_config: Option<serde_json::Value>,
}

/// Points a snapshot's VM config at a new disk and, optionally, a new TAP
///
/// Works on raw JSON so fields this runner does not model survive.
pub(crate) fn patch_snapshot_config(
    raw: &str,
    disk_path: &str,
    tap: Option<&str>,
) -> RunnerResult<String> {
    let mut config: serde_json::Value = serde_json::from_str(raw)?;

    let disk = config
        .get_mut("disks")
        .and_then(|d| d.get_mut(0))
        .and_then(|d| d.as_object_mut())
        .ok_or_else(|| RunnerError::InvalidArgument("snapshot config has no disks".to_string()))?;
    disk.insert("path".to_string(), disk_path.into());

    if let Some(tap) = tap {
        if let Some(net) = config
            .get_mut("net")
            .and_then(|n| n.get_mut(0))
            .and_then(|n| n.as_object_mut())
        {
            net.insert("tap".to_string(), tap.into());
        }
    }

    Ok(serde_json::to_string(&config)?)
}

/// Rejects references (`name` or `org/name`) that would leave the snapshots
/// directory
pub(crate) fn validate_snapshot_ref(reference: &str) -> RunnerResult<()> {
    if reference.is_empty() || reference.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(RunnerError::InvalidArgument(format!(
            "invalid snapshot reference {:?}",
            reference
        )));
    }
    Ok(())
}

fn validate_name(kind: &str, name: &str) -> RunnerResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(RunnerError::InvalidArgument(format!(
            "invalid {} {:?}",
            kind, name
        )));
    }
    Ok(())
}

impl Client {
    // ─────────────────────────────────────────────────────────────────────────
    // Taking snapshots
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshots a Running or Paused VM into `{snapshots}/{org}/{name}`
    ///
    /// Returns the snapshot directory.
    pub async fn create_snapshot_from_vm(&self, options: &SnapshotOptions) -> RunnerResult<String> {
        let name = options.resolved_name();
        validate_name("snapshot name", &name)?;
        if let Some(org) = &options.organization_id {
            validate_name("organization id", org)?;
        }

        let started = Instant::now();
        let _guard = self.lock(&options.sandbox_id).await;
        let dir = self.config.snapshot_path(&options.reference(&name));
        let result = self
            .snapshot_locked(&options.sandbox_id, &dir)
            .await
            .map(|_| dir);
        observe_operation("snapshot", started, &result);
        result
    }

    /// User-facing snapshot: also reports the disk size and hands the
    /// directory to the configured sink
    pub async fn create_snapshot(&self, options: SnapshotOptions) -> RunnerResult<SnapshotResult> {
        let name = options.resolved_name();
        let options = SnapshotOptions {
            name: Some(name.clone()),
            ..options
        };
        let path = self.create_snapshot_from_vm(&options).await?;

        let size_bytes = match self.file_size(&format!("{}/disk.qcow2", path)).await {
            Ok(size) => size,
            Err(_) => self
                .file_size(&format!("{}/disk.raw", path))
                .await
                .unwrap_or_default(),
        };
        let result = SnapshotResult {
            snapshot_ref: options.reference(&name),
            name,
            path,
            size_bytes,
        };

        if let Some(sink) = &self.snapshot_sink {
            sink.store(&result)
                .await
                .context("failed to hand snapshot to sink")?;
        }
        info!(sandbox_id = %options.sandbox_id, snapshot = %result.snapshot_ref, size_bytes, "snapshot created");
        Ok(result)
    }

    /// Pauses (if needed), snapshots memory and disk into `dir`, resumes
    pub(crate) async fn snapshot_locked(&self, sandbox_id: &str, dir: &str) -> RunnerResult<()> {
        let info = self
            .require_state(sandbox_id, "snapshot", &[VmState::Running, VmState::Paused])
            .await?;
        let was_running = info.state == VmState::Running;
        if was_running {
            self.api(sandbox_id, VmmRequest::Pause)
                .await
                .context("failed to pause VM for snapshot")?;
        }

        let result = self.write_snapshot(sandbox_id, dir).await;

        if was_running {
            if let Err(e) = self.api(sandbox_id, VmmRequest::Resume).await {
                warn!(sandbox_id, error = %e, "failed to resume VM after snapshot");
            }
        }
        if result.is_err() {
            if let Err(e) = self.runner.remove_all(dir).await {
                warn!(dir, error = %e, "failed to remove partial snapshot");
            }
        }
        result
    }

    async fn write_snapshot(&self, sandbox_id: &str, dir: &str) -> RunnerResult<()> {
        self.take_memory_snapshot(sandbox_id, dir).await?;
        self.flatten_disk(
            &self.config.disk_path(sandbox_id),
            &format!("{}/disk.qcow2", dir),
        )
        .await
    }

    /// Creates `dir` and asks the hypervisor for a memory + device snapshot
    pub(crate) async fn take_memory_snapshot(&self, sandbox_id: &str, dir: &str) -> RunnerResult<()> {
        self.runner.create_dir_all(dir).await?;
        let request = SnapshotConfig {
            destination_url: format!("file://{}", dir),
        };
        self.api(sandbox_id, VmmRequest::Snapshot(request))
            .await
            .context("failed to snapshot VM")?;
        debug!(sandbox_id, dir, "memory snapshot written");
        Ok(())
    }

    /// Copies `source` and converts the copy into a standalone qcow2 at
    /// `target`, dropping any backing-file chain
    ///
    /// Copying first avoids converting an image the hypervisor holds open.
    pub(crate) async fn flatten_disk(&self, source: &str, target: &str) -> RunnerResult<()> {
        let tmp = format!("{}.tmp", target);
        self.runner
            .run("cp", &[source, &tmp])
            .await
            .context("failed to copy disk")?;
        let converted = self
            .runner
            .run("qemu-img", &["convert", "-O", "qcow2", &tmp, target])
            .await
            .context("failed to flatten disk");
        if let Err(e) = self.runner.remove_all(&tmp).await {
            warn!(path = %tmp, error = %e, "failed to remove temporary disk copy");
        }
        converted.map(|_| ())
    }

    /// Size of a file in bytes, via `stat` so it works over SSH
    async fn file_size(&self, path: &str) -> RunnerResult<u64> {
        let out = self.runner.run("stat", &["-c", "%s", path]).await?;
        out.trim()
            .parse()
            .map_err(|_| RunnerError::InvalidArgument(format!("unexpected stat output {:?}", out.trim())))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Restore
    // ─────────────────────────────────────────────────────────────────────────

    /// Starts a new sandbox from a snapshot directory
    ///
    /// The snapshot's disk is copied, so the sandbox it was taken from is
    /// never touched.
    pub async fn restore(&self, options: RestoreOptions) -> RunnerResult<SandboxInfo> {
        validate_sandbox_id(&options.sandbox_id)?;
        let started = Instant::now();
        let _guard = self.lock(&options.sandbox_id).await;
        let result = self.restore_locked(&options).await;
        observe_operation("restore", started, &result);
        result
    }

    async fn restore_locked(&self, options: &RestoreOptions) -> RunnerResult<SandboxInfo> {
        let sandbox_id = options.sandbox_id.as_str();
        if self.socket_exists(sandbox_id).await
            || self
                .runner
                .file_exists(&self.config.sandbox_dir(sandbox_id))
                .await?
        {
            return Err(RunnerError::AlreadyExists(format!("sandbox {}", sandbox_id)));
        }

        let snapshot_dir = if options.snapshot_path.starts_with('/') {
            options.snapshot_path.clone()
        } else {
            validate_snapshot_ref(&options.snapshot_path)?;
            self.config.snapshot_path(&options.snapshot_path)
        };
        if !self.runner.file_exists(&snapshot_dir).await? {
            return Err(RunnerError::NotFound(format!("snapshot {}", snapshot_dir)));
        }

        info!(sandbox_id, snapshot = %snapshot_dir, "restoring sandbox from snapshot");
        if let Err(e) = self
            .restore_from_dir(sandbox_id, &snapshot_dir, options.prefault)
            .await
        {
            warn!(sandbox_id, error = %e, "restore failed, cleaning up");
            self.cleanup_sandbox(sandbox_id).await;
            return Err(e);
        }

        self.update_sandbox_state(sandbox_id, VmState::Running).await;
        self.get_sandbox_info(sandbox_id).await
    }

    async fn restore_from_dir(&self, sandbox_id: &str, snapshot_dir: &str, prefault: bool) -> RunnerResult<()> {
        self.runner
            .create_dir_all(&self.config.sandbox_dir(sandbox_id))
            .await?;

        let qcow = format!("{}/disk.qcow2", snapshot_dir);
        let source_disk = if self.runner.file_exists(&qcow).await? {
            qcow
        } else {
            format!("{}/disk.raw", snapshot_dir)
        };
        self.runner
            .run("cp", &[&source_disk, &self.config.disk_path(sandbox_id)])
            .await
            .context("failed to copy snapshot disk")?;

        let ns = self
            .netns
            .create(sandbox_id)
            .await
            .context("failed to create network namespace")?;
        self.record_ip(sandbox_id, &ns.external_ip.to_string())
            .await?;

        let staged = self
            .stage_restore_dir(sandbox_id, snapshot_dir, Some(NAMESPACE_TAP))
            .await?;

        let mut saved = SandboxConfig::fallback(sandbox_id, &self.config).with_namespace(&ns);
        saved.snapshot = Some(snapshot_dir.to_string());
        self.save_sandbox_config(&saved).await?;

        self.start_hypervisor(sandbox_id, Some(&ns), SOCKET_TIMEOUT)
            .await?;
        self.api(
            sandbox_id,
            VmmRequest::Restore(RestoreConfig::from_dir(&staged, prefault)),
        )
        .await
        .context("failed to restore snapshot")?;
        self.resume_restored(sandbox_id).await?;

        if let Err(e) = self.runner.remove_all(&staged).await {
            warn!(sandbox_id, error = %e, "failed to remove staged snapshot");
        }
        self.save_vm_config(sandbox_id).await
    }

    /// Copies a snapshot's state into `{sandbox}/restore-snapshot` with its
    /// config pointed at the sandbox's own disk
    pub(crate) async fn stage_restore_dir(
        &self,
        sandbox_id: &str,
        snapshot_dir: &str,
        tap: Option<&str>,
    ) -> RunnerResult<String> {
        let staged = self.config.sandbox_file(sandbox_id, RESTORE_STAGING_DIR);
        self.runner.create_dir_all(&staged).await?;

        for file in STATE_FILES {
            let source = format!("{}/{}", snapshot_dir, file);
            let target = format!("{}/{}", staged, file);
            self.runner
                .run("cp", &[&source, &target])
                .await
                .with_context(|| format!("failed to stage {}", file))?;
        }

        let raw = self
            .runner
            .read_file(&format!("{}/config.json", snapshot_dir))
            .await
            .context("failed to read snapshot config")?;
        let patched = patch_snapshot_config(&raw, &self.config.disk_path(sandbox_id), tap)?;
        self.runner
            .write_file(&format!("{}/config.json", staged), patched.as_bytes())
            .await?;
        Ok(staged)
    }

    /// Resumes a freshly restored VM and waits for it to run
    pub(crate) async fn resume_restored(&self, sandbox_id: &str) -> RunnerResult<()> {
        let info = self.get_info(sandbox_id).await?;
        if info.state == VmState::Paused {
            self.api(sandbox_id, VmmRequest::Resume)
                .await
                .context("failed to resume restored VM")?;
        }
        self.wait_for_state(sandbox_id, VmState::Running, RESTORE_TIMEOUT)
            .await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshot catalogue
    // ─────────────────────────────────────────────────────────────────────────

    /// Removes a snapshot by reference (`name` or `org/name`)
    pub async fn delete_snapshot(&self, reference: &str) -> RunnerResult<()> {
        validate_snapshot_ref(reference)?;
        self.runner
            .remove_all(&self.config.snapshot_path(reference))
            .await
            .with_context(|| format!("failed to delete snapshot {}", reference))?;
        info!(snapshot = reference, "snapshot deleted");
        Ok(())
    }

    /// Entries of the snapshots directory
    pub async fn list_snapshots(&self) -> RunnerResult<Vec<String>> {
        let mut names = self
            .runner
            .list_dir(&self.config.snapshots_path)
            .await
            .context("failed to list snapshots")?;
        names.retain(|n| !n.starts_with('.'));
        names.sort();
        Ok(names)
    }

    pub async fn get_snapshot_info(&self, reference: &str) -> RunnerResult<SnapshotInfo> {
        validate_snapshot_ref(reference)?;
        let path = self.config.snapshot_path(reference);
        if !self.runner.file_exists(&path).await? {
            return Err(RunnerError::NotFound(format!("snapshot {}", reference)));
        }

        let disk_size_bytes = self
            .file_size(&format!("{}/disk.qcow2", path))
            .await
            .unwrap_or_default();
        let vm_config = match self.runner.read_file(&format!("{}/config.json", path)).await {
            Ok(raw) => serde_json::from_str(&raw).ok(),
            Err(_) => None,
        };

        Ok(SnapshotInfo {
            name: reference.rsplit('/').next().unwrap_or(reference).to_string(),
            path,
            disk_size_bytes,
            vm_config,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lineage
    // ─────────────────────────────────────────────────────────────────────────

    /// Sandbox this one was forked from
    pub async fn get_parent_sandbox_id(&self, sandbox_id: &str) -> Option<String> {
        self.read_marker(sandbox_id, PARENT_MARKER).await
    }

    pub async fn is_fork(&self, sandbox_id: &str) -> bool {
        self.get_parent_sandbox_id(sandbox_id).await.is_some()
    }

    /// Sandbox this one was cloned from
    pub async fn get_source_sandbox_id(&self, sandbox_id: &str) -> Option<String> {
        self.read_marker(sandbox_id, SOURCE_MARKER).await
    }

    pub async fn is_clone(&self, sandbox_id: &str) -> bool {
        self.get_source_sandbox_id(sandbox_id).await.is_some()
    }
}

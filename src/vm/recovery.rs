//! Orphan recovery
//!
//! A sandbox is an orphan when its directory (and disk) exist on the host but
//! no hypervisor API socket does, typically after a host or runner restart.
//! Recovery restarts the hypervisor and either restores a memory checkpoint
//! or cold-boots from the persisted configuration.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn, Instrument, Level};

use super::client::Client;
use super::config::{RestoreConfig, VmConfig, VmState};
use super::create::{build_vm_config, mac_address, VmSpec};
use super::lifecycle::{RESTORE_TIMEOUT, SOCKET_TIMEOUT, STATE_TIMEOUT};
use super::request::VmmRequest;
use crate::error::{ResultExt, RunnerError, RunnerResult};
use crate::metrics::{observe_operation, RECOVERY_OUTCOMES};
use crate::network::ip_cache::IP_MARKER;
use crate::network::netns::NAMESPACE_TAP;
use crate::network::NetNamespace;

pub const SANDBOX_CONFIG_FILE: &str = "sandbox.json";
pub const CHECKPOINT_DIR: &str = "checkpoint";
const CHECKPOINT_MEMORY: &str = "memory-ranges";

/// Persisted creation parameters of a sandbox, kept in `sandbox.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub sandbox_id: String,
    pub cpus: u32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
    #[serde(rename = "storageGB")]
    pub storage_gb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netns_id: Option<u8>,
    #[serde(default, rename = "externalIP", skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,
    #[serde(default, rename = "guestIP", skip_serializing_if = "Option::is_none")]
    pub guest_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpu_devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_args: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state: Option<VmState>,
}

impl SandboxConfig {
    /// Defaults for a sandbox that predates `sandbox.json`
    pub fn fallback(sandbox_id: &str, config: &crate::config::RunnerConfig) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            cpus: config.default_cpus,
            memory_mb: config.default_memory_mb,
            storage_gb: config.default_storage_gb,
            snapshot: None,
            organization_id: None,
            metadata: HashMap::new(),
            netns_id: None,
            external_ip: None,
            guest_ip: None,
            gpu_devices: Vec::new(),
            kernel_args: None,
            created_at: Utc::now(),
            last_state: None,
        }
    }

    /// Records the namespace addressing of the sandbox
    pub fn with_namespace(mut self, ns: &NetNamespace) -> Self {
        self.netns_id = Some(ns.external_num);
        self.external_ip = Some(ns.external_ip.to_string());
        self.guest_ip = Some(ns.guest_ip.to_string());
        self
    }
}

/// Outcome of a recovery pass over all orphans
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub recovered: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone, Copy)]
enum RecoveryMethod {
    Restore,
    ColdBoot,
}

impl RecoveryMethod {
    fn as_str(self) -> &'static str {
        match self {
            RecoveryMethod::Restore => "restore",
            RecoveryMethod::ColdBoot => "cold_boot",
        }
    }
}

impl Client {
    // ─────────────────────────────────────────────────────────────────────────
    // sandbox.json
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn save_sandbox_config(&self, config: &SandboxConfig) -> RunnerResult<()> {
        let path = self
            .config
            .sandbox_file(&config.sandbox_id, SANDBOX_CONFIG_FILE);
        let raw = serde_json::to_vec_pretty(config)?;
        self.runner
            .write_file(&path, &raw)
            .await
            .context("failed to save sandbox config")
    }

    pub async fn load_sandbox_config(&self, sandbox_id: &str) -> RunnerResult<SandboxConfig> {
        let path = self.config.sandbox_file(sandbox_id, SANDBOX_CONFIG_FILE);
        let raw = self.runner.read_file(&path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Records the last known VM state. Failures are only logged.
    pub async fn update_sandbox_state(&self, sandbox_id: &str, state: VmState) {
        let mut config = match self.load_sandbox_config(sandbox_id).await {
            Ok(config) => config,
            Err(e) => {
                debug!(sandbox_id, error = %e, "no sandbox config to update");
                return;
            }
        };
        config.last_state = Some(state);
        if let Err(e) = self.save_sandbox_config(&config).await {
            warn!(sandbox_id, error = %e, "failed to update sandbox state");
        }
    }

    /// Writes the hypervisor's view of the VM to `config.json`
    pub(crate) async fn save_vm_config(&self, sandbox_id: &str) -> RunnerResult<()> {
        let info = self.get_info(sandbox_id).await?;
        let Some(config) = info.config else {
            return Ok(());
        };
        let raw = serde_json::to_vec_pretty(&config)?;
        self.runner
            .write_file(&self.config.config_path(sandbox_id), &raw)
            .await
            .context("failed to save VM config")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Orphan detection
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn is_socket_missing(&self, sandbox_id: &str) -> bool {
        !self.socket_exists(sandbox_id).await
    }

    /// True when the sandbox has a disk but no running hypervisor
    pub async fn can_recover(&self, sandbox_id: &str) -> bool {
        let has_disk = self
            .runner
            .file_exists(&self.config.disk_path(sandbox_id))
            .await
            .unwrap_or(false);
        has_disk && self.is_socket_missing(sandbox_id).await
    }

    async fn find_orphans(&self) -> RunnerResult<Vec<String>> {
        let entries = self
            .runner
            .list_dir(&self.config.sandboxes_path)
            .await
            .context("failed to list sandboxes")?;

        let mut orphans = Vec::new();
        for sandbox_id in entries.into_iter().filter(|e| !e.starts_with('.')) {
            if self.can_recover(&sandbox_id).await {
                orphans.push(sandbox_id);
            }
        }
        Ok(orphans)
    }

    /// Recovers every orphaned sandbox on the host
    ///
    /// One failing sandbox does not stop the others; failures are collected
    /// in the report.
    pub async fn recover_orphaned_sandboxes(&self) -> RunnerResult<RecoveryReport> {
        let orphans = self.find_orphans().await?;
        let mut report = RecoveryReport::default();
        if orphans.is_empty() {
            debug!("no orphaned sandboxes");
            return Ok(report);
        }

        info!(count = orphans.len(), "recovering orphaned sandboxes");
        for sandbox_id in orphans {
            let span = crate::sandbox_span!(Level::INFO, "recover", sandbox_id);
            match self.recover_sandbox(&sandbox_id).instrument(span).await {
                Ok(()) => report.recovered.push(sandbox_id),
                Err(e) => {
                    error!(sandbox_id = %sandbox_id, error = %e, "failed to recover sandbox");
                    report.failed.push((sandbox_id, e.to_string()));
                }
            }
        }

        info!(
            recovered = report.recovered.len(),
            failed = report.failed.len(),
            "orphan recovery finished"
        );
        Ok(report)
    }

    pub async fn recover_sandbox(&self, sandbox_id: &str) -> RunnerResult<()> {
        let _guard = self.lock(sandbox_id).await;
        self.recover_sandbox_locked(sandbox_id).await
    }

    pub(crate) async fn recover_sandbox_locked(&self, sandbox_id: &str) -> RunnerResult<()> {
        let started = Instant::now();
        let result = self.recover_inner(sandbox_id).await;
        observe_operation("recover", started, &result);

        match result {
            Ok(method) => {
                RECOVERY_OUTCOMES
                    .with_label_values(&[method.as_str(), "ok"])
                    .inc();
                self.processes.forget(sandbox_id);
                self.update_sandbox_state(sandbox_id, VmState::Running).await;
                info!(sandbox_id, method = method.as_str(), "sandbox recovered");
                Ok(())
            }
            Err(e) => {
                RECOVERY_OUTCOMES
                    .with_label_values(&["any", "error"])
                    .inc();
                // Leave the disk alone so a later attempt can retry.
                self.kill_hypervisor(sandbox_id).await;
                self.vmm.evict(&self.config.socket_path(sandbox_id));
                if let Err(cleanup) = self
                    .runner
                    .remove_all(&self.config.socket_path(sandbox_id))
                    .await
                {
                    warn!(sandbox_id, error = %cleanup, "failed to remove socket");
                }
                Err(e)
            }
        }
    }

    async fn recover_inner(&self, sandbox_id: &str) -> RunnerResult<RecoveryMethod> {
        let disk = self.config.disk_path(sandbox_id);
        if !self.runner.file_exists(&disk).await? {
            return Err(RunnerError::NotFound(format!("disk of sandbox {}", sandbox_id)));
        }

        let saved = match self.load_sandbox_config(sandbox_id).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!(sandbox_id, error = %e, "no usable sandbox config, using defaults");
                SandboxConfig::fallback(sandbox_id, &self.config)
            }
        };

        // Bridge-mode sandboxes got their TAP back from the pool at startup.
        let bridge_tap = self.taps.get(sandbox_id);
        let namespace = match bridge_tap {
            Some(_) => None,
            None => Some(
                self.netns
                    .ensure(sandbox_id)
                    .await
                    .context("failed to restore network namespace")?,
            ),
        };
        let reachable_ip = match &namespace {
            Some(ns) => Some(ns.external_ip.to_string()),
            None => self.ips.get(sandbox_id).map(|ip| ip.to_string()),
        };

        self.start_hypervisor(sandbox_id, namespace.as_ref(), SOCKET_TIMEOUT)
            .await?;

        let checkpoint = format!(
            "{}/{}",
            self.config.sandbox_dir(sandbox_id),
            CHECKPOINT_DIR
        );
        let has_checkpoint = self
            .runner
            .file_exists(&format!("{}/{}", checkpoint, CHECKPOINT_MEMORY))
            .await
            .unwrap_or(false);

        let method = if has_checkpoint {
            match self.restore_checkpoint(sandbox_id, &checkpoint).await {
                Ok(()) => RecoveryMethod::Restore,
                Err(e) => {
                    warn!(sandbox_id, error = %e, "checkpoint restore failed, cold booting");
                    RECOVERY_OUTCOMES
                        .with_label_values(&["restore", "error"])
                        .inc();
                    if let Err(e) = self.runner.remove_all(&checkpoint).await {
                        warn!(sandbox_id, error = %e, "failed to remove checkpoint");
                    }
                    self.kill_hypervisor(sandbox_id).await;
                    self.vmm.evict(&self.config.socket_path(sandbox_id));
                    self.start_hypervisor(sandbox_id, namespace.as_ref(), SOCKET_TIMEOUT)
                        .await?;
                    self.cold_boot(sandbox_id, &saved, bridge_tap.as_deref())
                        .await?;
                    RecoveryMethod::ColdBoot
                }
            }
        } else {
            self.cold_boot(sandbox_id, &saved, bridge_tap.as_deref())
                .await?;
            RecoveryMethod::ColdBoot
        };

        if let Some(ip) = reachable_ip {
            self.ip_cache.set(sandbox_id, ip);
        }
        Ok(method)
    }

    async fn restore_checkpoint(&self, sandbox_id: &str, checkpoint: &str) -> RunnerResult<()> {
        info!(sandbox_id, "restoring sandbox from checkpoint");
        self.api(
            sandbox_id,
            VmmRequest::Restore(RestoreConfig::from_dir(checkpoint, true)),
        )
        .await
        .context("failed to restore checkpoint")?;

        let info = self.get_info(sandbox_id).await?;
        if info.state == VmState::Paused {
            self.api(sandbox_id, VmmRequest::Resume)
                .await
                .context("failed to resume restored VM")?;
        }
        self.wait_for_state(sandbox_id, VmState::Running, STATE_TIMEOUT)
            .await?;

        if let Err(e) = self.runner.remove_all(checkpoint).await {
            warn!(sandbox_id, error = %e, "failed to delete checkpoint");
        }
        Ok(())
    }

    async fn cold_boot(
        &self,
        sandbox_id: &str,
        saved: &SandboxConfig,
        bridge_tap: Option<&str>,
    ) -> RunnerResult<()> {
        info!(sandbox_id, "cold booting sandbox");
        let vm_config = match self.load_vm_config(sandbox_id).await {
            Some(config) => config,
            None => {
                let iso = format!("{}/cloud-init.iso", self.config.sandbox_dir(sandbox_id));
                let cloud_init = self.runner.file_exists(&iso).await.unwrap_or(false);
                build_vm_config(
                    &self.config,
                    &VmSpec {
                        sandbox_id,
                        cpus: saved.cpus,
                        memory_mb: saved.memory_mb,
                        tap: bridge_tap.unwrap_or(NAMESPACE_TAP),
                        mac: &mac_address(sandbox_id),
                        cloud_init_iso: cloud_init.then_some(iso.as_str()),
                        gpu_devices: &saved.gpu_devices,
                        kernel_args: saved.kernel_args.as_deref(),
                    },
                )
            }
        };

        self.api(sandbox_id, VmmRequest::Create(Box::new(vm_config)))
            .await
            .context("failed to create VM")?;
        self.api(sandbox_id, VmmRequest::Boot)
            .await
            .context("failed to boot VM")?;
        self.wait_for_state(sandbox_id, VmState::Running, RESTORE_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn load_vm_config(&self, sandbox_id: &str) -> Option<VmConfig> {
        let raw = self
            .runner
            .read_file(&self.config.config_path(sandbox_id))
            .await
            .ok()?;
        match serde_json::from_str(&raw) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(sandbox_id, error = %e, "ignoring unreadable config.json");
                None
            }
        }
    }

    /// Reachable IP persisted in the sandbox directory, if any
    pub async fn persisted_ip(&self, sandbox_id: &str) -> Option<String> {
        self.read_marker(sandbox_id, IP_MARKER).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;

    #[test]
    fn test_sandbox_config_json_shape() {
        let mut config = SandboxConfig::fallback("sb-1", &RunnerConfig::default())
            .with_namespace(&NetNamespace::new("sb-1", 7));
        config.last_state = Some(VmState::Running);

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["sandboxId"], "sb-1");
        assert_eq!(value["memoryMB"], 2048);
        assert_eq!(value["storageGB"], 20);
        assert_eq!(value["netnsId"], 7);
        assert_eq!(value["externalIP"], "10.0.7.1");
        assert_eq!(value["guestIP"], "192.168.0.2");
        assert_eq!(value["lastState"], "Running");
        assert!(value.get("snapshot").is_none());

        let parsed: SandboxConfig = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_sandbox_config_tolerates_missing_optionals() {
        let raw = r#"{
            "sandboxId": "old",
            "cpus": 1,
            "memoryMB": 1024,
            "storageGB": 10,
            "createdAt": "2024-05-01T10:00:00Z"
        }"#;
        let config: SandboxConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.cpus, 1);
        assert!(config.metadata.is_empty());
        assert_eq!(config.last_state, None);
    }
}

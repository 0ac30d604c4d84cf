//! Integration tests for the sandbox lifecycle
//!
//! These run the real client against the in-memory host from `common`, so
//! every command and API call the client issues is observable.

mod common;

use std::sync::Arc;

use chvisor::config::{NetworkMode, RunnerConfig};
use chvisor::error::RunnerError;
use chvisor::vm::{CreateOptions, VmState};
use common::{fake_client, fake_client_with, sandbox_dir, socket, test_config, BASE_IMAGE, SANDBOXES, SOCKETS};

fn options(id: &str) -> CreateOptions {
    CreateOptions::builder().sandbox_id(id).build()
}

/// Create brings a sandbox to Running with its files and network in place
#[test_log::test(tokio::test)]
async fn test_create_boots_sandbox() {
    let (client, host) = fake_client().await;

    let info = client.create(options("sb-1")).await.unwrap();

    assert_eq!(info.state, VmState::Running);
    assert_eq!(info.vcpus, 2);
    assert_eq!(info.memory_mb, 2048);
    assert_eq!(info.socket_path, socket("sb-1"));
    assert_eq!(info.tap_device.as_deref(), Some("tap0"));
    assert!(info.ip_address.is_some());

    let dir = sandbox_dir("sb-1");
    for file in ["disk.raw", "config.json", "sandbox.json", "ip", "netns", "cloud-init.iso"] {
        assert!(host.has(&format!("{}/{}", dir, file)), "missing {}", file);
    }
    assert_eq!(
        host.api_calls(&socket("sb-1"))
            .into_iter()
            .filter(|e| *e == "vm.create" || *e == "vm.boot")
            .collect::<Vec<_>>(),
        vec!["vm.create", "vm.boot"]
    );
    assert!(host.ran("ip netns exec ns-sb-1 cloud-hypervisor --api-socket"));
}

/// Create followed by destroy leaves nothing behind
#[test_log::test(tokio::test)]
async fn test_create_then_destroy_leaves_nothing() {
    let (client, host) = fake_client().await;
    let netns_before = client.netns_pool().available();

    client.create(options("sb-gone")).await.unwrap();
    assert_eq!(client.netns_pool().available(), netns_before - 1);

    client.destroy("sb-gone").await.unwrap();

    assert!(!host.has(&socket("sb-gone")));
    assert!(host.paths_under(&sandbox_dir("sb-gone")).is_empty());
    assert!(client.netns_pool().get("sb-gone").is_none());
    assert_eq!(client.netns_pool().available(), netns_before);
    assert!(client.ip_cache().get("sb-gone").is_none());
    assert_eq!(client.lock_count(), 0);
}

/// Destroying a sandbox that never existed succeeds
#[test_log::test(tokio::test)]
async fn test_destroy_is_idempotent() {
    let (client, _host) = fake_client().await;

    client.destroy("never-created").await.unwrap();
    client.remove_destroyed("never-created").await.unwrap();
}

/// Pause then resume returns to Running, and repeating either is harmless
#[test_log::test(tokio::test)]
async fn test_pause_resume_round_trip() {
    let (client, _host) = fake_client().await;
    client.create(options("sb-pause")).await.unwrap();

    client.pause("sb-pause").await.unwrap();
    client.pause("sb-pause").await.unwrap();
    assert_eq!(client.get_info("sb-pause").await.unwrap().state, VmState::Paused);

    client.resume("sb-pause").await.unwrap();
    client.resume("sb-pause").await.unwrap();
    assert_eq!(client.get_info("sb-pause").await.unwrap().state, VmState::Running);
}

/// Resize of a VM that is shut down is rejected without calling the API
#[test_log::test(tokio::test)]
async fn test_resize_rejected_when_shut_down() {
    let (client, host) = fake_client().await;
    client.create(options("sb-off")).await.unwrap();
    client.shutdown("sb-off").await.unwrap();

    let err = client.resize("sb-off", Some(4), None).await.unwrap_err();

    assert!(err.is_invalid_state(), "unexpected error: {}", err);
    assert!(!host.api_calls(&socket("sb-off")).contains(&"vm.resize"));
}

/// Shutdown falls back to a forced shutdown when the guest ignores ACPI
#[test_log::test(tokio::test)]
async fn test_shutdown_forces_after_grace_period() {
    let (client, host) = fake_client().await;
    client.create(options("sb-stubborn")).await.unwrap();
    host.fail_on("vm.power-button");

    client.stop("sb-stubborn").await.unwrap();

    let calls = host.api_calls(&socket("sb-stubborn"));
    assert!(calls.contains(&"vm.power-button"));
    assert!(calls.contains(&"vm.shutdown"));
    assert_eq!(client.get_info("sb-stubborn").await.unwrap().state, VmState::Shutdown);
}

/// Start boots a shut-down VM and resumes a paused one
#[test_log::test(tokio::test)]
async fn test_start_from_any_state() {
    let (client, _host) = fake_client().await;
    client.create(options("sb-start")).await.unwrap();

    client.shutdown("sb-start").await.unwrap();
    assert_eq!(client.start("sb-start").await.unwrap().state, VmState::Running);

    client.pause("sb-start").await.unwrap();
    assert_eq!(client.start("sb-start").await.unwrap().state, VmState::Running);
}

/// A disk without a hypervisor must be recovered, not re-created
#[test_log::test(tokio::test)]
async fn test_create_over_orphan_needs_recovery() {
    let (client, host) = fake_client().await;
    host.add_file(&format!("{}/disk.raw", sandbox_dir("sb-orphan")), "disk");

    let err = client.create(options("sb-orphan")).await.unwrap_err();

    assert!(matches!(err, RunnerError::NeedsRecovery(_)), "unexpected error: {}", err);
    assert!(host.has(&format!("{}/disk.raw", sandbox_dir("sb-orphan"))));
}

/// Creating an id that is already running returns its info
#[test_log::test(tokio::test)]
async fn test_create_existing_returns_info() {
    let (client, host) = fake_client().await;
    client.create(options("sb-twice")).await.unwrap();
    let creates_before = host.api_calls(&socket("sb-twice")).len();

    let info = client.create(options("sb-twice")).await.unwrap();

    assert_eq!(info.state, VmState::Running);
    assert!(!host.api_calls(&socket("sb-twice"))[creates_before..].contains(&"vm.create"));
}

/// A failed create releases everything it allocated
#[test_log::test(tokio::test)]
async fn test_failed_create_cleans_up() {
    let (client, host) = fake_client().await;
    let available = client.netns_pool().available();
    host.fail_on("vm.boot");

    let err = client.create(options("sb-fail")).await.unwrap_err();

    assert!(err.to_string().contains("failed to boot VM"), "unexpected error: {}", err);
    assert!(host.paths_under(&sandbox_dir("sb-fail")).is_empty());
    assert!(!host.has(&socket("sb-fail")));
    assert_eq!(client.netns_pool().available(), available);
    assert!(client.ip_cache().get("sb-fail").is_none());
}

/// A missing base image is reported as not found, naming the raw path
#[test_log::test(tokio::test)]
async fn test_missing_base_image() {
    let config = RunnerConfig::builder()
        .sandboxes_path(SANDBOXES)
        .sockets_path(SOCKETS)
        .base_image_path("/fake/images/missing base.img")
        .daemon_wait_timeout(std::time::Duration::ZERO)
        .build();
    let (client, _host) = fake_client_with(config).await;

    let err = client.create(options("sb-nobase")).await.unwrap_err();

    assert!(matches!(err, RunnerError::NotFound(_)), "unexpected error: {}", err);
    let message = err.to_string();
    assert!(message.contains("/fake/images/missing base.img"), "message: {}", message);
    assert!(!message.contains('\''), "message: {}", message);
}

/// Memory is clamped to 1 GiB and rounded to 128 MiB
#[test_log::test(tokio::test)]
async fn test_create_normalizes_memory() {
    let (client, _host) = fake_client().await;

    let small = CreateOptions::builder()
        .sandbox_id("sb-small")
        .memory_mb(300)
        .build();
    assert_eq!(client.create(small).await.unwrap().memory_mb, 1024);

    let odd = CreateOptions::builder()
        .sandbox_id("sb-odd")
        .memory_mb(2000)
        .cpus(4)
        .build();
    let info = client.create(odd).await.unwrap();
    assert_eq!(info.memory_mb, 2048);
    assert_eq!(info.vcpus, 4);
}

/// Invalid ids never reach the host
#[test_log::test(tokio::test)]
async fn test_invalid_sandbox_id() {
    let (client, host) = fake_client().await;
    let before = host.commands().len();

    let err = client.create(options("../etc")).await.unwrap_err();

    assert!(matches!(err, RunnerError::InvalidArgument(_)));
    assert_eq!(host.commands().len(), before);
}

/// Bridge networking hands out a pooled TAP and a flat IP
#[test_log::test(tokio::test)]
async fn test_bridge_mode_create_and_destroy() {
    let config = RunnerConfig::builder()
        .sandboxes_path(SANDBOXES)
        .sockets_path(SOCKETS)
        .base_image_path(BASE_IMAGE)
        .network_mode(NetworkMode::Bridge)
        .daemon_wait_timeout(std::time::Duration::ZERO)
        .build();
    let (client, host) = fake_client_with(config).await;

    let info = client.create(options("sb-br")).await.unwrap();

    let tap = info.tap_device.clone().unwrap();
    assert!(tap.starts_with("chtap"));
    assert_eq!(info.ip_address.as_deref(), Some("10.10.0.2"));
    assert_eq!(host.contents(&format!("{}/tap", sandbox_dir("sb-br"))), Some(tap.clone()));
    assert!(client.netns_pool().get("sb-br").is_none());

    client.destroy("sb-br").await.unwrap();
    assert!(client.tap_pool().get("sb-br").is_none());
    assert!(client.ip_pool().get("sb-br").is_none());
}

/// Operations on different sandboxes run side by side
#[test_log::test(tokio::test)]
async fn test_concurrent_creates() {
    let (client, _host) = fake_client().await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.create(options(&format!("sb-par-{}", i))).await })
        })
        .collect();
    let mut ips = Vec::new();
    for handle in handles {
        ips.push(handle.await.unwrap().unwrap().ip_address.unwrap());
    }
    ips.sort();
    ips.dedup();
    assert_eq!(ips.len(), 8);

    let listed = client.list().await.unwrap();
    assert_eq!(listed.len(), 8);
}

/// Hot-plugged devices and disk resizes go to the API
#[test_log::test(tokio::test)]
async fn test_device_and_disk_operations() {
    let (client, host) = fake_client().await;
    client.create(options("sb-dev")).await.unwrap();

    let device = chvisor::vm::DeviceConfig {
        path: "/sys/bus/pci/devices/0000:01:00.0".to_string(),
        iommu: true,
        id: Some("gpu9".to_string()),
    };
    let response = client.add_device("sb-dev", device).await.unwrap();
    assert!(response.contains("gpu9"));

    client.remove_device("sb-dev", "gpu9").await.unwrap();
    client.resize_disk("sb-dev", "disk0", 40 << 30).await.unwrap();
    client.reboot("sb-dev").await.unwrap();

    let calls = host.api_calls(&socket("sb-dev"));
    for endpoint in ["vm.add-device", "vm.remove-device", "vm.resize-disk", "vm.reboot"] {
        assert!(calls.contains(&endpoint), "missing {}", endpoint);
    }
}

/// A default config points at the standard host paths
#[test]
fn test_config_defaults_are_host_paths() {
    let config = test_config();
    assert_eq!(config.disk_path("x"), format!("{}/x/disk.raw", SANDBOXES));
    assert!(!config.is_remote());
}

//! Integration tests for fork and clone
//!
//! The invariant under test throughout: the source sandbox ends in the state
//! it started in, whatever happens to the new one.

mod common;

use chvisor::vm::{CloneOptions, CreateOptions, ForkOptions, Lineage, VmState};
use common::{fake_client, sandbox_dir, socket, SNAPSHOTS};

async fn running(client: &chvisor::Client, id: &str) {
    client
        .create(CreateOptions::builder().sandbox_id(id).build())
        .await
        .unwrap();
}

fn fork_options(source: &str, target: &str) -> ForkOptions {
    ForkOptions::builder()
        .source_sandbox_id(source)
        .new_sandbox_id(target)
        .build()
}

/// Forking a running sandbox leaves the source running and the fork running
#[test_log::test(tokio::test)]
async fn test_fork_running_source() {
    let (client, host) = fake_client().await;
    running(&client, "src").await;

    let info = client.fork(fork_options("src", "child")).await.unwrap();

    assert_eq!(info.state, VmState::Running);
    assert_eq!(info.origin, Some(Lineage::Parent("src".to_string())));
    assert_eq!(info.disk_path, format!("{}/disk.raw", sandbox_dir("child")));

    let source_calls = host.api_calls(&socket("src"));
    assert!(source_calls.ends_with(&["vm.pause", "vm.snapshot", "vm.resume"]), "calls: {:?}", source_calls);
    assert_eq!(client.get_info("src").await.unwrap().state, VmState::Running);

    assert!(client.is_fork("child").await);
    assert_eq!(client.get_parent_sandbox_id("child").await.as_deref(), Some("src"));
    assert!(!client.is_fork("src").await);
}

/// The fork's disk is an overlay on the source disk
#[test_log::test(tokio::test)]
async fn test_fork_disk_is_overlay() {
    let (client, host) = fake_client().await;
    running(&client, "src").await;

    client.fork(fork_options("src", "child")).await.unwrap();

    let source_disk = format!("{}/disk.raw", sandbox_dir("src"));
    let fork_disk = format!("{}/disk.raw", sandbox_dir("child"));
    assert!(host.ran(&format!("qemu-img create -f qcow2 -F qcow2 -b {} {}", source_disk, fork_disk)));
    assert_eq!(host.contents(&fork_disk), Some(format!("qcow2 backing={}", source_disk)));
    assert!(host.has(&format!("{}/sandbox.json", sandbox_dir("child"))));
}

/// Memory files of the fork snapshot are discarded once restored
#[test_log::test(tokio::test)]
async fn test_fork_discards_snapshot_memory() {
    let (client, host) = fake_client().await;
    running(&client, "src").await;

    client.fork(fork_options("src", "child")).await.unwrap();

    let leftovers = host.paths_under(SNAPSHOTS);
    assert!(leftovers.iter().any(|p| p.ends_with("/config.json")));
    assert!(!leftovers.iter().any(|p| p.contains("/memory")), "left: {:?}", leftovers);
}

/// A paused source stays paused after the fork
#[test_log::test(tokio::test)]
async fn test_fork_paused_source_stays_paused() {
    let (client, host) = fake_client().await;
    running(&client, "src").await;
    client.pause("src").await.unwrap();

    client.fork(fork_options("src", "child")).await.unwrap();

    assert_eq!(client.get_info("src").await.unwrap().state, VmState::Paused);
    assert!(!host.api_calls(&socket("src")).contains(&"vm.resume"));
}

/// A failed fork resumes the source and leaves no trace of the target
#[test_log::test(tokio::test)]
async fn test_failed_fork_restores_source() {
    let (client, host) = fake_client().await;
    running(&client, "src").await;
    let netns_available = client.netns_pool().available();
    host.fail_on("vm.restore");

    let err = client.fork(fork_options("src", "child")).await.unwrap_err();

    assert!(err.to_string().contains("failed to restore fork"), "unexpected error: {}", err);
    assert_eq!(client.get_info("src").await.unwrap().state, VmState::Running);
    assert!(host.paths_under(&sandbox_dir("child")).is_empty());
    assert!(!host.has(&socket("child")));
    assert!(!host.paths_under(SNAPSHOTS).iter().any(|p| p.contains("fork-src-")));
    assert_eq!(client.netns_pool().available(), netns_available);
}

/// A shut down source cannot be forked
#[test_log::test(tokio::test)]
async fn test_fork_requires_live_source() {
    let (client, _host) = fake_client().await;
    running(&client, "src").await;
    client.shutdown("src").await.unwrap();

    let err = client.fork(fork_options("src", "child")).await.unwrap_err();

    assert!(err.is_invalid_state(), "unexpected error: {}", err);
}

/// Forking onto an existing sandbox is refused before the source is touched
#[test_log::test(tokio::test)]
async fn test_fork_target_must_be_free() {
    let (client, host) = fake_client().await;
    running(&client, "src").await;
    running(&client, "taken").await;
    let calls_before = host.api_calls(&socket("src")).len();

    let err = client.fork(fork_options("src", "taken")).await.unwrap_err();

    assert!(matches!(err, chvisor::RunnerError::AlreadyExists(_)), "unexpected error: {}", err);
    assert_eq!(host.api_calls(&socket("src")).len(), calls_before);

    let err = client.fork(fork_options("src", "src")).await.unwrap_err();
    assert!(matches!(err, chvisor::RunnerError::InvalidArgument(_)));
}

/// A clone gets its own flattened disk and records its source
#[test_log::test(tokio::test)]
async fn test_clone_is_independent() {
    let (client, host) = fake_client().await;
    running(&client, "src").await;

    let options = CloneOptions::builder()
        .source_sandbox_id("src")
        .new_sandbox_id("copy")
        .build();
    let info = client.clone_sandbox(options).await.unwrap();

    assert_eq!(info.state, VmState::Running);
    assert_eq!(info.origin, Some(Lineage::Source("src".to_string())));
    assert!(client.is_clone("copy").await);
    assert!(!client.is_fork("copy").await);

    let clone_disk = format!("{}/disk.raw", sandbox_dir("copy"));
    assert!(host.ran(&format!("qemu-img convert -O qcow2 {}.tmp {}", clone_disk, clone_disk)));
    assert_eq!(host.contents(&clone_disk).as_deref(), Some("qcow2 standalone"));
    assert!(!host.has(&format!("{}.tmp", clone_disk)));
    assert_eq!(client.get_info("src").await.unwrap().state, VmState::Running);
}

/// A clone of a missing sandbox reports not found
#[test_log::test(tokio::test)]
async fn test_clone_missing_source() {
    let (client, _host) = fake_client().await;

    let options = CloneOptions::builder()
        .source_sandbox_id("ghost")
        .new_sandbox_id("copy")
        .build();
    let err = client.clone_sandbox(options).await.unwrap_err();

    assert!(matches!(err, chvisor::RunnerError::NotFound(_)), "unexpected error: {}", err);
}

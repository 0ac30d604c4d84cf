//! Cloud Hypervisor sandbox management
//!
//! This module provides everything needed to run sandboxes on one host:
//! - VM configuration and API payloads (`config`, `request`)
//! - The hypervisor API transports (`hypervisor`)
//! - Process tracking and readiness waits (`handle`, `lifecycle`)
//! - The [`Client`] with create, snapshot, fork, clone and recovery

pub mod client;
pub mod clone;
pub mod cloud_init;
pub mod config;
pub mod create;
pub mod fork;
pub mod handle;
pub mod hypervisor;
pub mod lifecycle;
pub mod net_fds;
pub mod recovery;
pub mod request;
pub mod snapshot;

pub use client::Client;
pub use clone::CloneOptions;
pub use config::*;
pub use create::{CreateOptions, Resources};
pub use fork::ForkOptions;
pub use handle::{ProcessStatus, ProcessTracker, SandboxProcess};
pub use hypervisor::{ChRemoteApi, HttpVmmApi, VmmApi};
pub use recovery::{RecoveryReport, SandboxConfig};
pub use request::VmmRequest;
pub use snapshot::{RestoreOptions, SnapshotInfo, SnapshotOptions, SnapshotResult, SnapshotSink};

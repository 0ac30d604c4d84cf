//! chvisor - Cloud Hypervisor sandbox runner
//!
//! This library manages the full lifecycle of Cloud Hypervisor microVM
//! sandboxes on a single host, locally or over SSH.
//!
//! # Modules
//!
//! - `vm` - sandbox lifecycle, snapshots, fork, clone and orphan recovery
//! - `network` - per-sandbox network namespaces, TAP and IP pools
//! - `runner` - local and SSH command execution
//! - `memory` - balloon controller and memory stats history
//! - `metrics` - Prometheus metrics for observability
//! - `config` - environment-driven configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use chvisor::{Client, CreateOptions, RunnerConfig};
//!
//! let client = Client::new(RunnerConfig::from_env()?);
//! client.initialize().await?;
//!
//! let options = CreateOptions::builder().sandbox_id("sb-1").build();
//! let sandbox = client.create(options).await?;
//! ```

pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod network;
pub mod runner;
pub mod tracing;
pub mod vm;

// Re-export commonly used types at crate root for convenience
pub use config::{MemoryControllerConfig, NetworkMode, RunnerConfig, StatsStoreConfig};
pub use error::{RunnerError, RunnerResult};
pub use memory::{MemoryController, StatsStore, VMMemoryStats};
pub use runner::{CommandRunner, LocalRunner, SshRunner};
pub use vm::{
    Client, CloneOptions, CreateOptions, ForkOptions, RestoreOptions, SandboxInfo,
    SnapshotOptions, VmState,
};

//! Command execution on the hypervisor host
//!
//! Every component that touches the host (disk images, namespaces, TAP
//! devices, hypervisor processes) goes through a [`CommandRunner`] instead of
//! calling the OS directly. The same orchestration code therefore drives a
//! local host or a remote one reached over SSH.
//!
//! ```text
//! Client ──► CommandRunner ──┬── LocalRunner ──► tokio::process / tokio::fs
//!                            └── SshRunner   ──► ssh -i key host 'cmd'
//! ```

mod local;
mod socks;
mod ssh;

use async_trait::async_trait;
use tokio::process::Child;

use crate::error::RunnerResult;

pub use local::LocalRunner;
pub use socks::SocksProxy;
pub use ssh::{shell_quote, SshRunner};

/// A long-running process to start in the background
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    /// stdout and stderr are appended here
    pub log_path: String,
}

impl SpawnSpec {
    /// The full command line, quoted for a POSIX shell
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Executes commands and file operations on the hypervisor host
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a program and returns its stdout. A non-zero exit is an error
    /// carrying the combined output.
    async fn run(&self, program: &str, args: &[&str]) -> RunnerResult<String>;

    /// Runs a script with `sh -c`.
    async fn run_script(&self, script: &str) -> RunnerResult<String>;

    async fn file_exists(&self, path: &str) -> RunnerResult<bool>;

    async fn read_file(&self, path: &str) -> RunnerResult<String>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> RunnerResult<()>;

    async fn create_dir_all(&self, path: &str) -> RunnerResult<()>;

    /// Removes a file or directory tree. Missing paths are not an error.
    async fn remove_all(&self, path: &str) -> RunnerResult<()>;

    /// Names of the entries in a directory. A missing directory is empty.
    async fn list_dir(&self, path: &str) -> RunnerResult<Vec<String>>;

    /// Starts a detached background process. Local runners return the child
    /// so its exit can be watched; remote runners cannot and return `None`.
    async fn spawn(&self, spec: &SpawnSpec) -> RunnerResult<Option<Child>>;

    fn is_remote(&self) -> bool;
}

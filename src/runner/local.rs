//! Runs commands on this host.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use super::{CommandRunner, SpawnSpec};
use crate::error::{ResultExt, RunnerError, RunnerResult};

#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

impl LocalRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, program: &str, args: &[&str]) -> RunnerResult<String> {
        debug!(program, ?args, "running command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to execute {}", program))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunnerError::command(
                format!("{} {}", program, args.join(" ")),
                format!("{}{}", stdout, stderr).trim().to_string(),
            ));
        }

        Ok(stdout)
    }

    async fn run_script(&self, script: &str) -> RunnerResult<String> {
        self.run("sh", &["-c", script]).await
    }

    async fn file_exists(&self, path: &str) -> RunnerResult<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn read_file(&self, path: &str) -> RunnerResult<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> RunnerResult<()> {
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("failed to write {}", path))
    }

    async fn create_dir_all(&self, path: &str) -> RunnerResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("failed to create directory {}", path))
    }

    async fn remove_all(&self, path: &str) -> RunnerResult<()> {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };

        match result {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(e).with_context(|| format!("failed to remove {}", path))
            }
            _ => Ok(()),
        }
    }

    async fn list_dir(&self, path: &str) -> RunnerResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn spawn(&self, spec: &SpawnSpec) -> RunnerResult<Option<Child>> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .with_context(|| format!("failed to open log {}", spec.log_path))?;
        let log_err = log.try_clone()?;

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .with_context(|| format!("failed to start {}", spec.program))?;

        debug!(program = %spec.program, pid = ?child.id(), "spawned background process");
        Ok(Some(child))
    }

    fn is_remote(&self) -> bool {
        false
    }
}

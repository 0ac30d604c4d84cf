//! Runs commands on a remote hypervisor host over SSH.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use super::{CommandRunner, SpawnSpec};
use crate::error::{ResultExt, RunnerError, RunnerResult};

/// Characters that force an argument to be quoted on the remote shell
const SHELL_SPECIAL: &[char] = &[
    ' ', '\t', '\n', '$', '`', '"', '\'', '\\', '!', '*', '?', '[', ']', '{', '}', '(', ')', ';',
    '&', '|', '<', '>',
];

/// Quotes `arg` for a POSIX shell if it contains anything special.
pub fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if !arg.contains(SHELL_SPECIAL) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[derive(Debug, Clone)]
pub struct SshRunner {
    host: String,
    key_path: String,
}

impl SshRunner {
    pub fn new(host: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            key_path: key_path.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn ssh(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.key_path)
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg(&self.host)
            .arg(remote_command);
        cmd
    }

    async fn exec(&self, remote_command: &str) -> RunnerResult<String> {
        debug!(host = %self.host, command = remote_command, "running remote command");

        let output = self
            .ssh(remote_command)
            .stdin(Stdio::null())
            .output()
            .await
            .context("failed to execute ssh")?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunnerError::command(
                remote_command,
                format!("{}{}", stdout, stderr).trim().to_string(),
            ));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, program: &str, args: &[&str]) -> RunnerResult<String> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");
        self.exec(&line).await
    }

    async fn run_script(&self, script: &str) -> RunnerResult<String> {
        self.exec(&format!("sh -c {}", shell_quote(script))).await
    }

    async fn file_exists(&self, path: &str) -> RunnerResult<bool> {
        let out = self
            .exec(&format!("test -e {} && echo exists || true", shell_quote(path)))
            .await?;
        Ok(out.trim() == "exists")
    }

    async fn read_file(&self, path: &str) -> RunnerResult<String> {
        self.run("cat", &[path]).await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> RunnerResult<()> {
        let mut child = self
            .ssh(&format!("cat > {}", shell_quote(path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to execute ssh")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RunnerError::command(
                format!("cat > {}", path),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> RunnerResult<()> {
        self.run("mkdir", &["-p", path]).await.map(|_| ())
    }

    async fn remove_all(&self, path: &str) -> RunnerResult<()> {
        self.run("rm", &["-rf", path]).await.map(|_| ())
    }

    async fn list_dir(&self, path: &str) -> RunnerResult<Vec<String>> {
        let out = self
            .exec(&format!("ls -1 {} 2>/dev/null || true", shell_quote(path)))
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn spawn(&self, spec: &SpawnSpec) -> RunnerResult<Option<Child>> {
        // The remote shell must return immediately, so every stream is redirected.
        let script = format!(
            "nohup {} > {} 2>&1 < /dev/null &",
            spec.command_line(),
            shell_quote(&spec.log_path)
        );
        self.run_script(&script).await?;
        Ok(None)
    }

    fn is_remote(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_arguments_are_not_quoted() {
        assert_eq!(shell_quote("vm.info"), "vm.info");
        assert_eq!(shell_quote("/var/run/cloud-hypervisor/a.sock"), "/var/run/cloud-hypervisor/a.sock");
    }

    #[test]
    fn test_special_arguments_are_quoted() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_spawn_command_line() {
        let spec = SpawnSpec {
            program: "ip".into(),
            args: vec!["netns".into(), "exec".into(), "ns-abc".into(), "cloud-hypervisor".into()],
            log_path: "/tmp/log".into(),
        };
        assert_eq!(spec.command_line(), "ip netns exec ns-abc cloud-hypervisor");
    }
}

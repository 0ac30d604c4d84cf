//! SOCKS5 tunnel to the remote hypervisor host
//!
//! Guest networks are only routable from the hypervisor host. In remote mode
//! HTTP traffic to guests goes through a single `ssh -D` tunnel that is
//! started on first use and shared by every sandbox. If the tunnel process
//! exits, the next call starts a new one.

use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{ResultExt, RunnerError, RunnerResult};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READY_POLL_ATTEMPTS: u32 = 50;

pub struct SocksProxy {
    host: String,
    key_path: String,
    port: u16,
    tunnel: Mutex<Option<Child>>,
}

impl SocksProxy {
    pub fn new(host: impl Into<String>, key_path: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            key_path: key_path.into(),
            port,
            tunnel: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `socks5h://` URL of the local end of the tunnel
    pub fn proxy_url(&self) -> String {
        format!("socks5h://127.0.0.1:{}", self.port)
    }

    /// Starts the tunnel if it is not already up
    pub async fn ensure_started(&self) -> RunnerResult<()> {
        let mut tunnel = self.tunnel.lock().await;

        if let Some(child) = tunnel.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => {
                    warn!(%status, "SOCKS tunnel exited, restarting");
                    *tunnel = None;
                }
                Err(e) => {
                    warn!(error = %e, "failed to poll SOCKS tunnel, restarting");
                    *tunnel = None;
                }
            }
        }

        // Another tunnel on this port (e.g. from a previous run) is reused.
        if self.is_listening().await {
            return Ok(());
        }

        let bind = format!("127.0.0.1:{}", self.port);
        let mut child = Command::new("ssh")
            .args([
                "-i",
                self.key_path.as_str(),
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "BatchMode=yes",
                "-o",
                "ServerAliveInterval=30",
                "-o",
                "ServerAliveCountMax=3",
                "-o",
                "ExitOnForwardFailure=yes",
                "-N",
                "-D",
                bind.as_str(),
                self.host.as_str(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to start SOCKS tunnel")?;

        for _ in 0..READY_POLL_ATTEMPTS {
            if self.is_listening().await {
                info!(host = %self.host, port = self.port, "SOCKS tunnel ready");
                *tunnel = Some(child);
                return Ok(());
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(RunnerError::command(
                    format!("ssh -N -D {} {}", bind, self.host),
                    format!("tunnel exited with {}", status),
                ));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        let _ = child.kill().await;
        Err(RunnerError::timeout(
            "SOCKS tunnel",
            READY_POLL_INTERVAL * READY_POLL_ATTEMPTS,
        ))
    }

    /// An HTTP client whose traffic goes through the tunnel
    pub async fn http_client(&self, timeout: Duration) -> RunnerResult<reqwest::Client> {
        self.ensure_started().await?;
        let proxy = reqwest::Proxy::all(self.proxy_url())?;
        Ok(reqwest::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .build()?)
    }

    /// Stops the tunnel if this proxy started it
    pub async fn close(&self) {
        if let Some(mut child) = self.tunnel.lock().await.take() {
            let _ = child.kill().await;
        }
    }

    async fn is_listening(&self) -> bool {
        TcpStream::connect(("127.0.0.1", self.port)).await.is_ok()
    }
}

impl std::fmt::Debug for SocksProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocksProxy")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

//! Cloud Hypervisor API transports
//!
//! Local hosts talk HTTP/1 to the API socket directly. Remote hosts have no
//! reachable socket, so requests become `ch-remote` invocations run over the
//! [`CommandRunner`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use tracing::{debug, trace};

use super::request::VmmRequest;
use crate::error::{ResultExt, RunnerError, RunnerResult};
use crate::runner::{shell_quote, CommandRunner};

/// Upper bound for a single API call
pub const API_TIMEOUT: Duration = Duration::from_secs(60);

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// A channel to the hypervisor API of one sandbox
#[async_trait]
pub trait VmmApi: Send + Sync {
    /// Sends `request` to the hypervisor listening on `socket` and returns
    /// the response body (empty for most endpoints).
    async fn call(&self, socket: &str, request: &VmmRequest) -> RunnerResult<String>;

    /// Drops any cached transport for `socket`.
    fn evict(&self, socket: &str);

    /// Drops every cached transport.
    fn evict_all(&self);
}

/// HTTP over the local Unix socket
#[derive(Default)]
pub struct HttpVmmApi {
    clients: Mutex<HashMap<String, HyperClient>>,
}

impl HttpVmmApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, socket: &str) -> HyperClient {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients
            .entry(socket.to_string())
            .or_insert_with(|| {
                Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector)
            })
            .clone()
    }

    async fn send(&self, socket: &str, request: &VmmRequest) -> RunnerResult<String> {
        let (method, endpoint) = request.route();
        let path = format!("/api/v1/{}", endpoint);
        let uri: hyper::Uri = hyperlocal::Uri::new(socket, &path).into();

        let mut builder = hyper::Request::builder().method(method).uri(uri);
        let body = match request.body()? {
            Some(json) => {
                builder = builder.header("Content-Type", "application/json");
                Bytes::from(json)
            }
            None => Bytes::new(),
        };
        let req = builder.body(Full::new(body))?;

        let res = self.client(socket).request(req).await?;
        let status = res.status();
        let bytes = res.into_body().collect().await?.to_bytes();
        let text = String::from_utf8_lossy(&bytes).into_owned();

        if !status.is_success() {
            return Err(RunnerError::Api {
                endpoint,
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl VmmApi for HttpVmmApi {
    async fn call(&self, socket: &str, request: &VmmRequest) -> RunnerResult<String> {
        let endpoint = request.endpoint();
        trace!(socket, endpoint, "hypervisor API request");

        tokio::time::timeout(API_TIMEOUT, self.send(socket, request))
            .await
            .map_err(|_| RunnerError::timeout(format!("{} on {}", endpoint, socket), API_TIMEOUT))?
    }

    fn evict(&self, socket: &str) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if clients.remove(socket).is_some() {
            debug!(socket, "evicted API client");
        }
    }

    fn evict_all(&self) {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// `ch-remote` executed on the remote host
pub struct ChRemoteApi {
    runner: Arc<dyn CommandRunner>,
}

impl ChRemoteApi {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn create(&self, socket: &str, request: &VmmRequest) -> RunnerResult<String> {
        let json = request.body()?.unwrap_or_default();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let file = format!("/tmp/ch-config-{}.json", nanos);

        self.runner
            .write_file(&file, json.as_bytes())
            .await
            .context("failed to upload VM config")?;

        let script = format!(
            "ch-remote --api-socket {sock} create {file} && rm -f {file}",
            sock = shell_quote(socket),
            file = shell_quote(&file),
        );
        match self.runner.run_script(&script).await {
            Ok(out) => Ok(out),
            Err(e) => {
                let _ = self.runner.remove_all(&file).await;
                Err(e)
            }
        }
    }

    async fn send(&self, socket: &str, request: &VmmRequest) -> RunnerResult<String> {
        if let VmmRequest::Create(_) = request {
            return self.create(socket, request).await;
        }

        let remote_args = request.ch_remote_args();
        let mut args: Vec<&str> = vec!["--api-socket", socket];
        args.extend(remote_args.iter().map(String::as_str));
        self.runner.run("ch-remote", &args).await
    }
}

#[async_trait]
impl VmmApi for ChRemoteApi {
    async fn call(&self, socket: &str, request: &VmmRequest) -> RunnerResult<String> {
        let endpoint = request.endpoint();
        trace!(socket, endpoint, "ch-remote request");

        tokio::time::timeout(API_TIMEOUT, self.send(socket, request))
            .await
            .map_err(|_| RunnerError::timeout(format!("{} on {}", endpoint, socket), API_TIMEOUT))?
            .with_context(|| format!("{} failed", endpoint))
    }

    fn evict(&self, _socket: &str) {}

    fn evict_all(&self) {}
}

//! Shared fakes for integration tests
//!
//! [`FakeHost`] stands in for both the command runner and the hypervisor
//! API. Files live in memory, every command is recorded, and each API socket
//! gets its own small VM state machine.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chvisor::config::RunnerConfig;
use chvisor::error::{RunnerError, RunnerResult};
use chvisor::runner::{CommandRunner, SpawnSpec};
use chvisor::vm::{Client, VmConfig, VmInfo, VmState, VmmApi, VmmRequest};
use tokio::process::Child;

pub const SANDBOXES: &str = "/fake/sandboxes";
pub const SNAPSHOTS: &str = "/fake/snapshots";
pub const SOCKETS: &str = "/fake/sockets";
pub const BASE_IMAGE: &str = "/fake/images/base.img";

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub state: VmState,
    pub config: Option<VmConfig>,
}

impl Default for FakeVm {
    fn default() -> Self {
        Self {
            state: VmState::NotCreated,
            config: None,
        }
    }
}

#[derive(Default)]
struct HostState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    commands: Vec<String>,
    api_calls: Vec<(String, &'static str)>,
    vms: HashMap<String, FakeVm>,
    failures: HashSet<String>,
    guest_memory: HashMap<String, String>,
}

/// In-memory host: filesystem, command log and per-socket VMs
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    /// Makes every command, script or API endpoint containing `pattern` fail
    pub fn fail_on(&self, pattern: &str) {
        self.lock().failures.insert(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn add_file(&self, path: &str, contents: &str) {
        self.lock()
            .files
            .insert(path.to_string(), contents.as_bytes().to_vec());
    }

    pub fn has(&self, path: &str) -> bool {
        exists(&self.lock(), path)
    }

    pub fn contents(&self, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(path)
            .map(|c| String::from_utf8_lossy(c).into_owned())
    }

    /// Every path at or below `prefix`
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        let state = self.lock();
        let under = format!("{}/", prefix.trim_end_matches('/'));
        state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter(|p| p.as_str() == prefix || p.starts_with(&under))
            .cloned()
            .collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.lock().commands.iter().any(|c| c.contains(needle))
    }

    /// API endpoints called on `socket`, in order
    pub fn api_calls(&self, socket: &str) -> Vec<&'static str> {
        self.lock()
            .api_calls
            .iter()
            .filter(|(s, _)| s == socket)
            .map(|(_, e)| *e)
            .collect()
    }

    pub fn vm(&self, socket: &str) -> Option<FakeVm> {
        self.lock().vms.get(socket).cloned()
    }

    pub fn set_vm_state(&self, socket: &str, state: VmState) {
        if let Some(vm) = self.lock().vms.get_mut(socket) {
            vm.state = state;
        }
    }

    /// Simulates the hypervisor of a sandbox dying with the host
    pub fn crash(&self, socket: &str) {
        let mut state = self.lock();
        state.vms.remove(socket);
        state.files.remove(socket);
    }

    /// Body the guest daemon returns for `/memory-stats`
    pub fn set_guest_memory(&self, sandbox_id: &str, body: &str) {
        self.lock()
            .guest_memory
            .insert(sandbox_id.to_string(), body.to_string());
    }

    fn check_failure(&self, what: &str) -> RunnerResult<()> {
        let state = self.lock();
        match state.failures.iter().find(|f| what.contains(f.as_str())) {
            Some(pattern) => Err(RunnerError::command(what, format!("injected failure: {}", pattern))),
            None => Ok(()),
        }
    }

    fn record(&self, command: String) {
        self.lock().commands.push(command);
    }

    fn copy(&self, source: &str, target: &str) -> RunnerResult<()> {
        let mut state = self.lock();
        let contents = state
            .files
            .get(source)
            .cloned()
            .ok_or_else(|| RunnerError::command(format!("cp {} {}", source, target), "No such file or directory"))?;
        state.files.insert(target.to_string(), contents);
        Ok(())
    }

    fn run_qemu_img(&self, args: &[&str]) -> RunnerResult<String> {
        match args.first().copied() {
            Some("info") => Ok(r#"{"virtual-size": 21474836480, "format": "qcow2"}"#.to_string()),
            Some("create") => {
                let b = args.iter().position(|a| *a == "-b").unwrap_or(0);
                let (base, target) = (args[b + 1], args[b + 2]);
                self.add_file(target, &format!("qcow2 backing={}", base));
                Ok(String::new())
            }
            Some("convert") => {
                let (source, target) = (args[args.len() - 2], args[args.len() - 1]);
                if !self.has(source) {
                    return Err(RunnerError::command("qemu-img convert", "source missing"));
                }
                self.add_file(target, "qcow2 standalone");
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }

    fn run_disk_script(&self, script: &str) -> RunnerResult<String> {
        let tokens: Vec<&str> = script.split_whitespace().map(unquote).collect();
        let disk = tokens[3];
        let base_at = tokens
            .windows(2)
            .position(|w| w == ["!", "-f"])
            .map(|i| i + 2)
            .unwrap_or(0);
        let base = tokens[base_at];

        if self.has(disk) {
            return Ok("EXISTS\n".to_string());
        }
        if !self.has(base) {
            return Err(RunnerError::command(script, "BASE_NOT_FOUND"));
        }
        self.add_file(disk, &format!("qcow2 backing={}", base));
        Ok("CREATED\n".to_string())
    }

    fn guest_memory_for(&self, script: &str) -> RunnerResult<String> {
        let namespace = script.split_whitespace().nth(3).map(unquote).unwrap_or_default();
        let sandbox_id = namespace.trim_start_matches("ns-");
        self.lock()
            .guest_memory
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| RunnerError::command(script, "connection refused"))
    }

    fn vm_call(&self, socket: &str, request: &VmmRequest) -> RunnerResult<String> {
        let endpoint = request.endpoint();
        let mut state = self.lock();
        if !state.files.contains_key(socket) {
            return Err(RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("no hypervisor on {}", socket),
            )));
        }

        let vm = state.vms.entry(socket.to_string()).or_default();
        let current = vm.state;
        let reject = || RunnerError::Api {
            endpoint,
            status: 500,
            body: format!("cannot {} in state {}", endpoint, current),
        };

        match request {
            VmmRequest::Ping => return Ok(r#"{"version":"fake"}"#.to_string()),
            VmmRequest::Info => {
                if current == VmState::NotCreated {
                    return Err(reject());
                }
                let info = VmInfo {
                    config: vm.config.clone(),
                    state: current,
                    memory_actual_size: None,
                };
                return Ok(serde_json::to_string(&info)?);
            }
            VmmRequest::Create(config) => {
                if current != VmState::NotCreated {
                    return Err(reject());
                }
                vm.state = VmState::Created;
                vm.config = Some((**config).clone());
            }
            VmmRequest::Boot => match current {
                VmState::Created | VmState::Shutdown => vm.state = VmState::Running,
                _ => return Err(reject()),
            },
            VmmRequest::Pause => match current {
                VmState::Running => vm.state = VmState::Paused,
                _ => return Err(reject()),
            },
            VmmRequest::Resume => match current {
                VmState::Paused => vm.state = VmState::Running,
                _ => return Err(reject()),
            },
            VmmRequest::PowerButton | VmmRequest::Shutdown => match current {
                VmState::Running | VmState::Paused => vm.state = VmState::Shutdown,
                _ => return Err(reject()),
            },
            VmmRequest::Reboot => {}
            VmmRequest::Delete => {
                vm.state = VmState::NotCreated;
                vm.config = None;
            }
            VmmRequest::Resize(resize) => {
                if let (Some(balloon), Some(config)) = (resize.desired_balloon, vm.config.as_mut()) {
                    if let Some(b) = config.balloon.as_mut() {
                        b.size = balloon;
                    }
                }
            }
            VmmRequest::ResizeDisk(_) | VmmRequest::RemoveDevice(_) => {}
            VmmRequest::AddDevice(device) => {
                let id = device.id.clone().unwrap_or_else(|| "dev0".to_string());
                return Ok(format!(r#"{{"id":"{}","bdf":"0000:00:06.0"}}"#, id));
            }
            VmmRequest::Snapshot(snapshot) => {
                if current != VmState::Paused {
                    return Err(reject());
                }
                let dir = snapshot.destination_url.trim_start_matches("file://").to_string();
                let config = serde_json::to_vec(&vm.config.clone().unwrap_or_default())?;
                state.files.insert(format!("{}/config.json", dir), config);
                state.files.insert(format!("{}/state.json", dir), b"{}".to_vec());
                state.files.insert(format!("{}/memory-ranges", dir), b"memory".to_vec());
            }
            VmmRequest::Restore(restore) => {
                if current != VmState::NotCreated {
                    return Err(reject());
                }
                let dir = restore.source_url.trim_start_matches("file://").to_string();
                let raw = state
                    .files
                    .get(&format!("{}/config.json", dir))
                    .cloned()
                    .ok_or_else(|| RunnerError::Api {
                        endpoint,
                        status: 500,
                        body: format!("no snapshot in {}", dir),
                    })?;
                let config: VmConfig = serde_json::from_slice(&raw)?;
                let vm = state.vms.entry(socket.to_string()).or_default();
                vm.state = VmState::Paused;
                vm.config = Some(config);
            }
            VmmRequest::ShutdownVmm => {
                state.vms.remove(socket);
            }
        }
        Ok(String::new())
    }
}

fn exists(state: &HostState, path: &str) -> bool {
    let under = format!("{}/", path.trim_end_matches('/'));
    state.files.contains_key(path)
        || state.dirs.contains(path)
        || state.files.keys().any(|p| p.starts_with(&under))
        || state.dirs.iter().any(|p| p.starts_with(&under))
}

fn unquote(token: &str) -> &str {
    token.trim_matches('\'').trim_end_matches(';')
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, program: &str, args: &[&str]) -> RunnerResult<String> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.record(line.clone());
        self.check_failure(&line)?;

        match program {
            "cp" => self.copy(args[0], args[1]).map(|_| String::new()),
            "qemu-img" => self.run_qemu_img(args),
            "cloud-localds" => {
                self.add_file(args[2], "iso9660");
                Ok(String::new())
            }
            "stat" => {
                let path = args[args.len() - 1];
                self.lock()
                    .files
                    .get(path)
                    .map(|c| format!("{}\n", c.len()))
                    .ok_or_else(|| RunnerError::command(line.clone(), "No such file or directory"))
            }
            _ => Ok(String::new()),
        }
    }

    async fn run_script(&self, script: &str) -> RunnerResult<String> {
        self.record(script.to_string());
        self.check_failure(script)?;

        if script.contains("BASE_NOT_FOUND") {
            return self.run_disk_script(script);
        }
        if script.starts_with("ip netns exec") && script.contains("/memory-stats") {
            return self.guest_memory_for(script);
        }
        if let Some(rest) = script.strip_prefix("rm -f ") {
            if let Some(dir) = rest.strip_suffix("/memory*") {
                let prefix = format!("{}/memory", unquote(dir));
                self.lock().files.retain(|p, _| !p.starts_with(&prefix));
            }
        }
        Ok(String::new())
    }

    async fn file_exists(&self, path: &str) -> RunnerResult<bool> {
        Ok(self.has(path))
    }

    async fn read_file(&self, path: &str) -> RunnerResult<String> {
        self.contents(path).ok_or_else(|| {
            RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path),
            ))
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> RunnerResult<()> {
        self.check_failure(&format!("write {}", path))?;
        self.lock().files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> RunnerResult<()> {
        self.lock().dirs.insert(path.trim_end_matches('/').to_string());
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> RunnerResult<()> {
        self.check_failure(&format!("rm {}", path))?;
        let under = format!("{}/", path.trim_end_matches('/'));
        let mut state = self.lock();
        state.files.retain(|p, _| p != path && !p.starts_with(&under));
        state.dirs.retain(|p| p != path && !p.starts_with(&under));
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> RunnerResult<Vec<String>> {
        let under = format!("{}/", path.trim_end_matches('/'));
        let state = self.lock();
        let names: BTreeSet<String> = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter_map(|p| p.strip_prefix(&under))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn spawn(&self, spec: &SpawnSpec) -> RunnerResult<Option<Child>> {
        let line = spec.command_line();
        self.record(line.clone());
        self.check_failure(&line)?;

        if let Some(at) = spec.args.iter().position(|a| a == "--api-socket") {
            if let Some(socket) = spec.args.get(at + 1) {
                let mut state = self.lock();
                state.files.insert(socket.clone(), Vec::new());
                state.vms.insert(socket.clone(), FakeVm::default());
            }
        }
        Ok(None)
    }

    fn is_remote(&self) -> bool {
        false
    }
}

#[async_trait]
impl VmmApi for FakeHost {
    async fn call(&self, socket: &str, request: &VmmRequest) -> RunnerResult<String> {
        let endpoint = request.endpoint();
        self.lock().api_calls.push((socket.to_string(), endpoint));
        if self.lock().failures.contains(endpoint) {
            return Err(RunnerError::Api {
                endpoint,
                status: 500,
                body: "injected failure".to_string(),
            });
        }
        self.vm_call(socket, request)
    }

    fn evict(&self, _socket: &str) {}

    fn evict_all(&self) {}
}

pub fn test_config() -> RunnerConfig {
    RunnerConfig::builder()
        .sandboxes_path(SANDBOXES)
        .snapshots_path(SNAPSHOTS)
        .sockets_path(SOCKETS)
        .base_image_path(BASE_IMAGE)
        .daemon_wait_timeout(Duration::ZERO)
        .graceful_shutdown_timeout(Duration::from_millis(300))
        .build()
}

/// A client wired to a fresh [`FakeHost`] with the base image in place
pub async fn fake_client() -> (Arc<Client>, Arc<FakeHost>) {
    fake_client_with(test_config()).await
}

pub async fn fake_client_with(config: RunnerConfig) -> (Arc<Client>, Arc<FakeHost>) {
    let host = FakeHost::new();
    host.add_file(BASE_IMAGE, "base image");
    let client = Client::with_parts(config, host.clone(), host.clone());
    client.initialize().await.unwrap();
    (Arc::new(client), host)
}

pub fn socket(sandbox_id: &str) -> String {
    format!("{}/{}.sock", SOCKETS, sandbox_id)
}

pub fn sandbox_dir(sandbox_id: &str) -> String {
    format!("{}/{}", SANDBOXES, sandbox_id)
}

//! Mock backend for tests.
//!
//! Interprets a small set of shell commands (`echo`, `true`, `false`,
//! `sleep`, `exit`) so end-to-end tests can express realistic jobs without
//! a container daemon. Scripted responses, failure injection, and call
//! tracking cover everything else.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BackendError, ContainerBackend, CreateOptions, ExecOutput, ResourceSnapshot};

/// A scripted exec response.
#[derive(Debug, Clone)]
pub struct MockExec {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl MockExec {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct MockContainer {
    image: String,
    env: HashMap<String, String>,
    network: Option<String>,
    running: bool,
    removed: bool,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    networks: HashMap<String, Vec<String>>,
    /// Scripted responses keyed by command substring, consumed in order.
    scripted: Vec<(String, MockExec)>,
    /// Glob pattern -> matching in-container paths.
    matches: HashMap<String, Vec<String>>,
    /// Artifact file contents by container path.
    files: HashMap<String, Vec<u8>>,
    exec_log: Vec<(String, String)>,
    pulled: Vec<String>,
}

/// Deterministic in-memory container backend.
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    next_id: AtomicU64,
    /// Pulls left to fail transiently before succeeding.
    pull_failures: AtomicUsize,
    /// When set, `create` always fails with this message.
    create_failure: Mutex<Option<String>>,
    stats: Mutex<ResourceSnapshot>,
    digest: Mutex<Option<String>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            next_id: AtomicU64::new(1),
            pull_failures: AtomicUsize::new(0),
            create_failure: Mutex::new(None),
            stats: Mutex::new(ResourceSnapshot {
                cpu_seconds: 0.2,
                memory_peak_mb: 64.0,
                net_rx_bytes: 1024,
                net_tx_bytes: 512,
                disk_bytes: 4096,
            }),
            digest: Mutex::new(Some(
                "sha256:0000000000000000000000000000000000000000000000000000000000000000".into(),
            )),
        }
    }

    /// Queue a scripted response for the next command containing `needle`.
    pub fn script_exec(&self, needle: impl Into<String>, response: MockExec) {
        self.state.lock().scripted.push((needle.into(), response));
    }

    /// Register glob matches and the file bytes `copy_from` will produce.
    pub fn add_artifact(&self, pattern: &str, container_path: &str, contents: &[u8]) {
        let mut state = self.state.lock();
        state
            .matches
            .entry(pattern.to_string())
            .or_default()
            .push(container_path.to_string());
        state.files.insert(container_path.to_string(), contents.to_vec());
    }

    /// Fail the next `n` pulls transiently.
    pub fn fail_pulls(&self, n: usize) {
        self.pull_failures.store(n, Ordering::SeqCst);
    }

    /// Make every `create` fail fatally.
    pub fn fail_create(&self, message: impl Into<String>) {
        *self.create_failure.lock() = Some(message.into());
    }

    pub fn set_stats(&self, snapshot: ResourceSnapshot) {
        *self.stats.lock() = snapshot;
    }

    pub fn set_digest(&self, digest: Option<String>) {
        *self.digest.lock() = digest;
    }

    /// Commands exec'd so far, as `(container_id, command)` pairs.
    pub fn exec_log(&self) -> Vec<(String, String)> {
        self.state.lock().exec_log.clone()
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.state.lock().pulled.clone()
    }

    /// Containers that were never removed (leak detection assertions).
    pub fn live_containers(&self) -> Vec<String> {
        self.state
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| !c.removed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.keys().cloned().collect()
    }

    pub fn container_env(&self, container_id: &str) -> Option<HashMap<String, String>> {
        self.state.lock().containers.get(container_id).map(|c| c.env.clone())
    }

    pub fn container_network(&self, container_id: &str) -> Option<Option<String>> {
        self.state
            .lock()
            .containers
            .get(container_id)
            .map(|c| c.network.clone())
    }

    /// Built-in interpretation for the common shell commands tests use.
    async fn interpret(command: &str) -> ExecOutput {
        let trimmed = command.trim();
        if let Some(rest) = trimmed.strip_prefix("echo ") {
            return ExecOutput {
                exit_code: 0,
                stdout: format!("{}\n", rest.trim_matches('"').trim_matches('\'')),
                stderr: String::new(),
            };
        }
        if let Some(rest) = trimmed.strip_prefix("sleep ") {
            let secs: f64 = rest.trim().parse().unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            return ExecOutput::default();
        }
        if let Some(rest) = trimmed.strip_prefix("exit ") {
            let code: i64 = rest.trim().parse().unwrap_or(1);
            return ExecOutput {
                exit_code: code,
                ..ExecOutput::default()
            };
        }
        match trimmed {
            "true" => ExecOutput::default(),
            "false" => ExecOutput {
                exit_code: 1,
                ..ExecOutput::default()
            },
            _ => ExecOutput::default(),
        }
    }

    fn check_container(&self, container_id: &str) -> Result<(), BackendError> {
        let state = self.state.lock();
        match state.containers.get(container_id) {
            Some(c) if !c.removed => Ok(()),
            _ => Err(BackendError::ContainerNotFound(container_id.to_string())),
        }
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<(), BackendError> {
        let remaining = self.pull_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pull_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Transient(format!("pull timeout for {}", image)));
        }
        if image.contains("missing") {
            return Err(BackendError::ImageNotFound(image.to_string()));
        }
        self.state.lock().pulled.push(image.to_string());
        Ok(())
    }

    async fn create(&self, opts: &CreateOptions) -> Result<String, BackendError> {
        if let Some(msg) = self.create_failure.lock().clone() {
            return Err(BackendError::Other(msg));
        }
        let id = format!("mock-{:08x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.state.lock().containers.insert(
            id.clone(),
            MockContainer {
                image: opts.image.clone(),
                env: opts.env.clone(),
                network: opts.network.clone(),
                running: false,
                removed: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        match state.containers.get_mut(container_id) {
            Some(c) if !c.removed => {
                c.running = true;
                Ok(())
            }
            _ => Err(BackendError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput, BackendError> {
        self.check_container(container_id)?;

        // The runner passes ["/bin/sh", "-c", command]; take the payload.
        let command = cmd.last().cloned().unwrap_or_default();
        let scripted = {
            let mut state = self.state.lock();
            state.exec_log.push((container_id.to_string(), command.clone()));
            let found = state
                .scripted
                .iter()
                .position(|(needle, _)| command.contains(needle.as_str()));
            found.map(|idx| state.scripted.remove(idx).1)
        };

        if let Some(response) = scripted {
            return Ok(ExecOutput {
                exit_code: response.exit_code,
                stdout: response.stdout,
                stderr: response.stderr,
            });
        }
        Ok(Self::interpret(&command).await)
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if let Some(c) = state.containers.get_mut(container_id) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str, _force: bool) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        match state.containers.get_mut(container_id) {
            Some(c) => {
                c.running = false;
                c.removed = true;
                Ok(())
            }
            None => Err(BackendError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn copy_from(
        &self,
        container_id: &str,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), BackendError> {
        self.check_container(container_id)?;
        let contents = self
            .state
            .lock()
            .files
            .get(container_path)
            .cloned()
            .ok_or_else(|| BackendError::Other(format!("no such file: {}", container_path)))?;
        if let Some(parent) = host_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(host_path, contents)?;
        Ok(())
    }

    async fn stats(&self, container_id: &str) -> Result<ResourceSnapshot, BackendError> {
        self.check_container(container_id)?;
        Ok(self.stats.lock().clone())
    }

    async fn image_digest(&self, _image: &str) -> Result<Option<String>, BackendError> {
        Ok(self.digest.lock().clone())
    }

    async fn create_network(&self, name: &str) -> Result<String, BackendError> {
        self.state.lock().networks.insert(name.to_string(), Vec::new());
        Ok(name.to_string())
    }

    async fn remove_network(&self, name: &str) -> Result<(), BackendError> {
        self.state.lock().networks.remove(name);
        Ok(())
    }

    async fn connect(
        &self,
        container_id: &str,
        network: &str,
        _aliases: &[String],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if let Some(members) = state.networks.get_mut(network) {
            members.push(container_id.to_string());
        }
        if let Some(c) = state.containers.get_mut(container_id) {
            c.network = Some(network.to_string());
        }
        Ok(())
    }

    async fn list_matching(
        &self,
        container_id: &str,
        pattern: &str,
    ) -> Result<Vec<String>, BackendError> {
        self.check_container(container_id)?;
        Ok(self
            .state
            .lock()
            .matches
            .get(pattern)
            .cloned()
            .unwrap_or_default())
    }
}

//! # Container backend abstraction
//!
//! The execution core consumes containers through the narrow
//! [`ContainerBackend`] trait: image pull, container lifecycle, command
//! exec, file copy, stats, and network management. Everything above this
//! trait is backend-agnostic.
//!
//! ## Available backends
//!
//! | Backend | Use case | Notes |
//! |---------|----------|-------|
//! | `docker` | Production | Shells out to the `docker` CLI |
//! | `mock` | Testing | Deterministic, no daemon required |
//!
//! Use [`create_backend`] to instantiate one by name.

mod docker;
mod mock;

pub use docker::DockerCliBackend;
pub use mock::{MockBackend, MockExec};

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Attempts for operations classified as transient.
pub const TRANSIENT_RETRIES: u32 = 3;

/// Base backoff between transient retries.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Errors surfaced by container backends.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend itself is unreachable (daemon down, CLI missing).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Worth retrying: network hiccups, registry timeouts.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Exec machinery failed (distinct from the command exiting non-zero).
    #[error("exec failed: {0}")]
    ExecFailed(String),

    #[error("network operation failed: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Options for creating a sandbox container.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub image: String,
    /// Entry command keeping the sandbox alive (commands run via exec).
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub name: Option<String>,
    pub network: Option<String>,
    /// Hardening vector from the policy engine (`cap-drop=ALL`, ...).
    pub security_opts: Vec<String>,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<u64>,
    pub labels: HashMap<String, String>,
}

/// Captured output of one exec'd command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Point-in-time resource reading for a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_seconds: f64,
    pub memory_peak_mb: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub disk_bytes: u64,
}

impl From<ResourceSnapshot> for crate::schemas::ResourceUsage {
    fn from(s: ResourceSnapshot) -> Self {
        Self {
            cpu_seconds: s.cpu_seconds,
            memory_peak_mb: s.memory_peak_mb,
            net_rx_bytes: s.net_rx_bytes,
            net_tx_bytes: s.net_tx_bytes,
            disk_bytes: s.disk_bytes,
        }
    }
}

/// Primitive container operations the execution core is built on.
///
/// All methods are async; blocking work inside implementations goes through
/// the runtime's blocking facilities.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Backend name (e.g. "docker", "mock").
    fn name(&self) -> &str;

    /// Probe backend availability. Honors `ORCAOPS_SKIP_BACKEND_INIT`
    /// at the call site, not here.
    async fn ping(&self) -> Result<(), BackendError>;

    async fn pull(&self, image: &str) -> Result<(), BackendError>;

    /// Create a stopped container; returns its id.
    async fn create(&self, opts: &CreateOptions) -> Result<String, BackendError>;

    async fn start(&self, container_id: &str) -> Result<(), BackendError>;

    /// Run a command inside the container and capture its output.
    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput, BackendError>;

    /// Stop with a grace period before the backend escalates to kill.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), BackendError>;

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), BackendError>;

    /// Copy a file out of the container to a host path.
    async fn copy_from(
        &self,
        container_id: &str,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), BackendError>;

    async fn stats(&self, container_id: &str) -> Result<ResourceSnapshot, BackendError>;

    /// Resolved digest for a local image, when known.
    async fn image_digest(&self, image: &str) -> Result<Option<String>, BackendError>;

    async fn create_network(&self, name: &str) -> Result<String, BackendError>;

    async fn remove_network(&self, name: &str) -> Result<(), BackendError>;

    async fn connect(
        &self,
        container_id: &str,
        network: &str,
        aliases: &[String],
    ) -> Result<(), BackendError>;

    /// Expand a glob inside the container to matching paths.
    async fn list_matching(
        &self,
        container_id: &str,
        pattern: &str,
    ) -> Result<Vec<String>, BackendError>;
}

/// Retry an operation up to [`TRANSIENT_RETRIES`] times while it keeps
/// failing transiently; other errors surface immediately.
pub async fn with_retries<T, F, Fut>(op: &str, mut f: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < TRANSIENT_RETRIES => {
                warn!(op, attempt, error = %e, "transient backend failure, retrying");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Instantiate a backend by name.
pub fn create_backend(name: &str) -> Result<Box<dyn ContainerBackend>, BackendError> {
    match name.to_lowercase().as_str() {
        "docker" => Ok(Box::new(DockerCliBackend::new())),
        "mock" => Ok(Box::new(MockBackend::new())),
        other => Err(BackendError::Other(format!(
            "unknown backend: '{}'. Available: docker, mock",
            other
        ))),
    }
}

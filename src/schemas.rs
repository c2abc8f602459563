//! Core job data model: specs, step results, run records.
//!
//! These types form the bit-stable persisted schema: status enums serialize
//! uppercase, timestamps are ISO-8601 with timezone, and `run.json` field
//! names never change shape between releases.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::anomaly::Anomaly;
use crate::error::OrcaError;

/// Maximum length of a caller-supplied job id.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Lifecycle status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are final: a record never leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::TimedOut | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::TimedOut => "TIMED_OUT",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// What happens to the execution container once the job is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    #[default]
    AlwaysRemove,
    RemoveOnCompletion,
    KeepOnCompletion,
    RemoveOnTimeout,
    NeverRemove,
}

impl CleanupPolicy {
    /// Whether the container should be removed for the given terminal status.
    pub fn should_remove(&self, status: JobStatus) -> bool {
        match self {
            CleanupPolicy::AlwaysRemove => true,
            CleanupPolicy::RemoveOnCompletion => status == JobStatus::Success,
            CleanupPolicy::KeepOnCompletion => false,
            CleanupPolicy::RemoveOnTimeout => status == JobStatus::TimedOut,
            CleanupPolicy::NeverRemove => false,
        }
    }
}

/// Outcome of the container cleanup phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStatus {
    #[default]
    Pending,
    Removed,
    Kept,
    Failed,
}

/// Specification for a single sandboxed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    #[serde(default = "default_workspace_id")]
    pub workspace_id: String,
    pub image: String,
    /// Shell command strings, executed in order via `/bin/sh -c`.
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Glob patterns resolved inside the container after the last step.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Total wall-clock budget for all steps, in seconds.
    pub ttl_seconds: u64,
    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
    #[serde(default)]
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_workspace_id() -> String {
    crate::workspace::DEFAULT_WORKSPACE_ID.to_string()
}

impl JobSpec {
    /// Minimal spec with a generated job id.
    pub fn new(image: impl Into<String>, commands: Vec<String>, ttl_seconds: u64) -> Self {
        Self {
            job_id: generate_job_id(),
            workspace_id: default_workspace_id(),
            image: image.into(),
            commands,
            env: HashMap::new(),
            artifacts: Vec::new(),
            ttl_seconds,
            cleanup_policy: CleanupPolicy::default(),
            triggered_by: None,
            intent: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Validate the spec before admission. Invalid specs are never admitted.
    pub fn validate(&self) -> Result<(), OrcaError> {
        if self.job_id.is_empty() || self.job_id.len() > MAX_JOB_ID_LEN {
            return Err(OrcaError::validation(format!(
                "job_id must be 1..={} characters",
                MAX_JOB_ID_LEN
            )));
        }
        if !self
            .job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(OrcaError::validation(format!(
                "job_id '{}' contains characters outside [A-Za-z0-9._-]",
                self.job_id
            )));
        }
        if self.image.trim().is_empty() {
            return Err(OrcaError::validation("image must not be empty"));
        }
        if self.commands.is_empty() {
            return Err(OrcaError::validation("commands must not be empty"));
        }
        if self.commands.iter().any(|c| c.trim().is_empty()) {
            return Err(OrcaError::validation("commands must not contain empty entries"));
        }
        if self.ttl_seconds == 0 {
            return Err(OrcaError::validation("ttl_seconds must be greater than zero"));
        }
        Ok(())
    }

    /// Deterministic identity of `(image, commands)` for baseline keying.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.image, &self.commands)
    }
}

/// Generate a fresh job id (`job-<12 hex>`).
pub fn generate_job_id() -> String {
    format!("job-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

/// `hex(sha256(image ∥ 0x00 ∥ join(commands, 0x00)))` over the trimmed
/// image string. Identical inputs hash identically across processes.
pub fn fingerprint_of(image: &str, commands: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.trim().as_bytes());
    hasher.update([0u8]);
    for (i, cmd) in commands.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(cmd.as_bytes());
    }
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Result of one executed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub command: String,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Metadata for one extracted artifact file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub path_in_container: String,
    pub local_path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub content_type: String,
}

/// Final resource snapshot for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_seconds: f64,
    pub memory_peak_mb: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub disk_bytes: u64,
}

/// Sanitized view of the container environment at creation time.
/// Values whose keys match the redaction patterns are replaced before
/// capture; raw secrets never reach disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentCapture {
    pub image_digest: Option<String>,
    pub env: HashMap<String, String>,
}

/// Durable record of a single job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub fingerprint: String,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactMetadata>,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default)]
    pub environment_capture: Option<EnvironmentCapture>,
    #[serde(default)]
    pub cleanup_status: CleanupStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub anomalies: Vec<Anomaly>,
    pub spec: JobSpec,
    /// Container id while the sandbox is alive; kept for leak detection.
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// Warnings that do not affect the terminal status (missing artifact
    /// globs, truncated collection).
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RunRecord {
    /// Fresh QUEUED record for an admitted spec.
    pub fn queued(spec: JobSpec) -> Self {
        let fingerprint = spec.fingerprint();
        Self {
            job_id: spec.job_id.clone(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            fingerprint,
            steps: Vec::new(),
            artifacts: Vec::new(),
            resource_usage: None,
            environment_capture: None,
            cleanup_status: CleanupStatus::Pending,
            error: None,
            summary: None,
            anomalies: Vec::new(),
            spec,
            sandbox_id: None,
            warnings: Vec::new(),
        }
    }

    /// Wall-clock duration in seconds, 0.0 until both timestamps exist.
    pub fn duration_seconds(&self) -> f64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }

    /// Transition to a terminal status. Once terminal, the status is
    /// immutable; later phases must not rewrite it.
    pub fn finalize(&mut self, status: JobStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

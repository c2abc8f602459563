//! Single-job execution.
//!
//! Runs one [`JobSpec`] through its full lifecycle: image pull, hardened
//! container creation, ordered fail-fast command execution under a TTL
//! watchdog, artifact extraction, observability capture, cleanup per
//! policy, and atomic finalization of the run record. The fundamental
//! state machine reaches exactly one terminal status; the observability
//! and cleanup phases never change it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::anomaly::AnomalyStore;
use crate::backend::{with_retries, ContainerBackend, CreateOptions};
use crate::baseline::BaselineTracker;
use crate::cancel::CancelToken;
use crate::log_analyzer::SummaryGenerator;
use crate::run_store::RunStore;
use crate::schemas::{
    ArtifactMetadata, CleanupStatus, EnvironmentCapture, JobSpec, JobStatus, RunRecord, StepResult,
};
use crate::workspace::ResourceLimits;

/// Grace period given to the backend before it escalates a stop to a kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Exit code recorded for a step interrupted by the TTL watchdog.
const TIMEOUT_EXIT_CODE: i64 = 124;

static SECRET_KEY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![Regex::new(r"(?i)(secret|token|password|passwd|api[-_]?key|private[-_]?key|credential|auth)").unwrap()]
});

/// Redacts environment values whose keys look secret-like.
#[derive(Debug, Clone, Default)]
pub struct SecretRedactor {
    extra_patterns: Vec<String>,
}

impl SecretRedactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add operator-supplied key patterns on top of the defaults.
    pub fn with_patterns(patterns: Vec<String>) -> Self {
        Self {
            extra_patterns: patterns,
        }
    }

    pub fn redact(&self, env: &HashMap<String, String>) -> HashMap<String, String> {
        let extra: Vec<Regex> = self
            .extra_patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        env.iter()
            .map(|(k, v)| {
                let hit = SECRET_KEY_PATTERNS.iter().chain(extra.iter()).any(|re| re.is_match(k));
                (k.clone(), if hit { "***".to_string() } else { v.clone() })
            })
            .collect()
    }
}

/// Per-run inputs supplied by the manager or workflow layer.
#[derive(Clone, Default)]
pub struct RunContext {
    pub limits: ResourceLimits,
    pub security_opts: Vec<String>,
    /// Service network to join, when the workflow layer started one.
    pub network: Option<String>,
    pub cancel: CancelToken,
}

/// Executes single jobs against a container backend.
pub struct JobRunner {
    backend: Arc<dyn ContainerBackend>,
    store: RunStore,
    baselines: Option<Arc<BaselineTracker>>,
    anomalies: Option<Arc<AnomalyStore>>,
    redactor: SecretRedactor,
    summaries: SummaryGenerator,
}

impl JobRunner {
    pub fn new(backend: Arc<dyn ContainerBackend>, store: RunStore) -> Self {
        Self {
            backend,
            store,
            baselines: None,
            anomalies: None,
            redactor: SecretRedactor::new(),
            summaries: SummaryGenerator::new(),
        }
    }

    pub fn with_observability(
        mut self,
        baselines: Arc<BaselineTracker>,
        anomalies: Arc<AnomalyStore>,
    ) -> Self {
        self.baselines = Some(baselines);
        self.anomalies = Some(anomalies);
        self
    }

    pub fn with_redactor(mut self, redactor: SecretRedactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Execute a job to completion. Infallible by design: every failure
    /// mode lands in the returned record, not in an `Err`.
    #[instrument(skip(self, spec, ctx), fields(job_id = %spec.job_id, image = %spec.image))]
    pub async fn run(&self, spec: JobSpec, ctx: RunContext) -> RunRecord {
        let mut record = RunRecord::queued(spec);
        self.persist(&record);

        // Phase 1: image
        info!("preparing sandbox");
        if let Err(e) = with_retries("pull", || self.backend.pull(&record.spec.image)).await {
            record.error = Some(format!("image pull failed: {}", e));
            record.finalize(JobStatus::Failed);
            self.observe(&mut record);
            self.persist(&record);
            return record;
        }

        if ctx.cancel.is_cancelled() {
            record.error = Some("job cancelled before start".into());
            record.finalize(JobStatus::Cancelled);
            record.cleanup_status = CleanupStatus::Removed;
            self.persist(&record);
            return record;
        }

        record.status = JobStatus::Running;
        record.started_at = Some(Utc::now());
        self.persist(&record);

        // Phase 2: container
        let container_id = match self.create_container(&mut record, &ctx).await {
            Ok(id) => Some(id),
            Err(e) => {
                record.error = Some(e);
                None
            }
        };

        // Phase 3+4: commands under the TTL watchdog
        let status = match &container_id {
            Some(id) => self.execute_commands(&mut record, id, &ctx).await,
            None => JobStatus::Failed,
        };
        record.finalize(status);

        // Phase 5: artifacts
        if let Some(id) = &container_id {
            self.collect_artifacts(&mut record, id, &ctx).await;
        }

        // Phase 6: observability
        if let Some(id) = &container_id {
            match self.backend.stats(id).await {
                Ok(snapshot) => record.resource_usage = Some(snapshot.into()),
                Err(e) => debug!(error = %e, "resource snapshot unavailable"),
            }
        }
        self.observe(&mut record);

        // Phase 7: cleanup
        if let Some(id) = &container_id {
            self.cleanup_container(&mut record, id).await;
        } else {
            record.cleanup_status = CleanupStatus::Removed;
        }

        // Phase 8: finalize
        self.persist(&record);
        info!(status = %record.status, "job finished");
        record
    }

    async fn create_container(
        &self,
        record: &mut RunRecord,
        ctx: &RunContext,
    ) -> Result<String, String> {
        let mut labels = HashMap::new();
        labels.insert("orcaops.job_id".to_string(), record.spec.job_id.clone());
        labels.insert("orcaops.ttl".to_string(), record.spec.ttl_seconds.to_string());

        let opts = CreateOptions {
            image: record.spec.image.clone(),
            command: Vec::new(),
            env: record.spec.env.clone(),
            name: None,
            network: ctx.network.clone(),
            security_opts: ctx.security_opts.clone(),
            cpu_limit: Some(ctx.limits.max_cpu_per_job),
            memory_limit_mb: Some(ctx.limits.max_memory_per_job_mb),
            labels,
        };

        let container_id = with_retries("create", || self.backend.create(&opts))
            .await
            .map_err(|e| format!("container create failed: {}", e))?;
        record.sandbox_id = Some(container_id.clone());

        let digest = match self.backend.image_digest(&record.spec.image).await {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "image digest unavailable");
                None
            }
        };
        record.environment_capture = Some(EnvironmentCapture {
            image_digest: digest,
            env: self.redactor.redact(&record.spec.env),
        });

        self.backend
            .start(&container_id)
            .await
            .map_err(|e| format!("container start failed: {}", e))?;
        Ok(container_id)
    }

    /// Run commands in order, fail-fast, under the job TTL. Returns the
    /// terminal status of the execution phase.
    async fn execute_commands(
        &self,
        record: &mut RunRecord,
        container_id: &str,
        ctx: &RunContext,
    ) -> JobStatus {
        let deadline = Instant::now() + Duration::from_secs(record.spec.ttl_seconds);
        let commands = record.spec.commands.clone();

        for (index, command) in commands.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return self.interrupt(record, container_id, "job cancelled").await;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.timeout(record, container_id, index, command).await;
            }

            debug!(step = index, %command, "running step");
            let step_started = Utc::now();
            let shell_cmd = ["/bin/sh".to_string(), "-c".to_string(), command.clone()];
            let exec = self.backend.exec(container_id, &shell_cmd);

            let output = tokio::select! {
                result = exec => result,
                _ = tokio::time::sleep(remaining) => {
                    return self.timeout(record, container_id, index, command).await;
                }
                _ = ctx.cancel.cancelled() => {
                    return self.interrupt(record, container_id, "job cancelled").await;
                }
            };

            let step_finished = Utc::now();
            match output {
                Ok(out) => {
                    let step = StepResult {
                        index,
                        command: command.clone(),
                        exit_code: out.exit_code,
                        stdout: out.stdout,
                        stderr: out.stderr,
                        duration_seconds: (step_finished - step_started).num_milliseconds() as f64
                            / 1000.0,
                        started_at: step_started,
                        finished_at: step_finished,
                    };
                    let exit_code = step.exit_code;
                    self.record_step(record, step);
                    if exit_code != 0 {
                        warn!(step = index, exit_code, "step failed, skipping remaining commands");
                        return JobStatus::Failed;
                    }
                }
                Err(e) => {
                    error!(step = index, error = %e, "exec failed");
                    record.error = Some(format!("step {} exec failed: {}", index, e));
                    return JobStatus::Failed;
                }
            }
        }
        JobStatus::Success
    }

    async fn timeout(
        &self,
        record: &mut RunRecord,
        container_id: &str,
        index: usize,
        command: &str,
    ) -> JobStatus {
        warn!(ttl = record.spec.ttl_seconds, "job exceeded its TTL, stopping container");
        let now = Utc::now();
        self.record_step(
            record,
            StepResult {
                index,
                command: command.to_string(),
                exit_code: TIMEOUT_EXIT_CODE,
                stdout: String::new(),
                stderr: format!("command timed out after {} seconds", record.spec.ttl_seconds),
                duration_seconds: 0.0,
                started_at: now,
                finished_at: now,
            },
        );
        if let Err(e) = self.backend.stop(container_id, STOP_GRACE).await {
            warn!(error = %e, "container stop after timeout failed");
        }
        record.error = Some(format!("job exceeded ttl of {} seconds", record.spec.ttl_seconds));
        JobStatus::TimedOut
    }

    async fn interrupt(
        &self,
        record: &mut RunRecord,
        container_id: &str,
        reason: &str,
    ) -> JobStatus {
        info!(reason, "stopping container for cancellation");
        if let Err(e) = self.backend.stop(container_id, STOP_GRACE).await {
            warn!(error = %e, "container stop after cancel failed");
        }
        record.error = Some(reason.to_string());
        JobStatus::Cancelled
    }

    fn record_step(&self, record: &mut RunRecord, step: StepResult) {
        if let Err(e) = self.store.append_step(&record.job_id, &step) {
            warn!(error = %e, "failed to append step log");
        }
        record.steps.push(step);
    }

    /// Resolve artifact globs inside the container and copy matches into
    /// the run directory, bounded by the workspace artifact budget.
    async fn collect_artifacts(&self, record: &mut RunRecord, container_id: &str, ctx: &RunContext) {
        if record.spec.artifacts.is_empty() {
            return;
        }
        let budget_bytes = ctx.limits.max_artifacts_size_mb * 1024 * 1024;
        let mut collected_bytes: u64 = 0;
        let job_dir = self.store.job_dir(&record.job_id);
        let patterns = record.spec.artifacts.clone();

        'patterns: for pattern in &patterns {
            let paths = match self.backend.list_matching(container_id, pattern).await {
                Ok(paths) => paths,
                Err(e) => {
                    warn!(pattern, error = %e, "artifact glob resolution failed");
                    record
                        .warnings
                        .push(format!("artifact pattern '{}' failed: {}", pattern, e));
                    continue;
                }
            };
            if paths.is_empty() {
                record
                    .warnings
                    .push(format!("no artifacts matched pattern '{}'", pattern));
                continue;
            }

            for path in paths {
                let filename = Path::new(&path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "artifact".to_string());
                let dest = job_dir.join(&filename);

                if let Err(e) = self.backend.copy_from(container_id, &path, &dest).await {
                    warn!(path, error = %e, "artifact copy failed");
                    record
                        .warnings
                        .push(format!("failed to collect artifact '{}': {}", path, e));
                    continue;
                }

                let size = std::fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
                collected_bytes += size;
                record.artifacts.push(ArtifactMetadata {
                    path_in_container: path.clone(),
                    local_path: filename.clone(),
                    size_bytes: size,
                    sha256: hash_file(&dest).unwrap_or_else(|| "unavailable".to_string()),
                    content_type: content_type_for(&filename).to_string(),
                });

                if collected_bytes > budget_bytes {
                    warn!(
                        collected_bytes,
                        budget_bytes, "artifact budget exceeded, truncating collection"
                    );
                    record.warnings.push(format!(
                        "artifact collection truncated at {} bytes (budget {} MB)",
                        collected_bytes, ctx.limits.max_artifacts_size_mb
                    ));
                    break 'patterns;
                }
            }
        }
    }

    /// Summary, baseline push, anomaly attach. Never touches the status.
    fn observe(&self, record: &mut RunRecord) {
        record.summary = Some(self.summaries.one_line_summary(record));

        if let Some(baselines) = &self.baselines {
            let detected = baselines.update(record);
            for anomaly_record in detected {
                if let Some(store) = &self.anomalies {
                    store.store(&anomaly_record);
                }
                record.anomalies.push(anomaly_record.to_anomaly());
            }
        }
    }

    async fn cleanup_container(&self, record: &mut RunRecord, container_id: &str) {
        if record.spec.cleanup_policy.should_remove(record.status) {
            match self.backend.remove(container_id, true).await {
                Ok(()) => record.cleanup_status = CleanupStatus::Removed,
                Err(e) => {
                    error!(container_id, error = %e, "failed to remove container");
                    record.cleanup_status = CleanupStatus::Failed;
                }
            }
        } else {
            record.cleanup_status = CleanupStatus::Kept;
        }
    }

    fn persist(&self, record: &RunRecord) {
        if let Err(e) = self.store.put(record) {
            error!(job_id = %record.job_id, error = %e, "failed to persist run record");
        }
    }
}

fn hash_file(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", b);
    }
    Some(out)
}

fn content_type_for(filename: &str) -> &'static str {
    match Path::new(filename).extension().and_then(|e| e.to_str()) {
        Some("txt") | Some("log") => "text/plain",
        Some("json") => "application/json",
        Some("jsonl") => "application/jsonl",
        Some("xml") => "application/xml",
        Some("html") => "text/html",
        Some("csv") => "text/csv",
        Some("tar") => "application/x-tar",
        Some("gz") | Some("tgz") => "application/gzip",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use tempfile::TempDir;

    fn runner_with(backend: Arc<MockBackend>, tmp: &TempDir) -> JobRunner {
        JobRunner::new(backend, RunStore::new(tmp.path()))
    }

    fn ctx() -> RunContext {
        RunContext {
            limits: ResourceLimits::default(),
            security_opts: vec!["cap-drop=ALL".into()],
            network: None,
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn redactor_masks_secret_keys() {
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "hunter2".to_string());
        env.insert("DATABASE_PASSWORD".to_string(), "pg".to_string());
        env.insert("AUTH_TOKEN".to_string(), "t".to_string());
        env.insert("PATH".to_string(), "/usr/bin".to_string());

        let redacted = SecretRedactor::new().redact(&env);
        assert_eq!(redacted["API_KEY"], "***");
        assert_eq!(redacted["DATABASE_PASSWORD"], "***");
        assert_eq!(redacted["AUTH_TOKEN"], "***");
        assert_eq!(redacted["PATH"], "/usr/bin");
    }

    #[test]
    fn redactor_accepts_extra_patterns() {
        let mut env = HashMap::new();
        env.insert("INTERNAL_HANDLE".to_string(), "x".to_string());
        let redactor = SecretRedactor::with_patterns(vec!["(?i)handle".into()]);
        assert_eq!(redactor.redact(&env)["INTERNAL_HANDLE"], "***");
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("report.txt"), "text/plain");
        assert_eq!(content_type_for("data.json"), "application/json");
        assert_eq!(content_type_for("bundle.tar"), "application/x-tar");
        assert_eq!(content_type_for("binary"), "application/octet-stream");
    }

    #[tokio::test]
    async fn golden_path_success() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let runner = runner_with(backend.clone(), &tmp);

        let mut spec = JobSpec::new("alpine:3.19", vec!["echo hi".into()], 60);
        spec.job_id = "golden".into();
        let record = runner.run(spec, ctx()).await;

        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.steps.len(), 1);
        assert_eq!(record.steps[0].exit_code, 0);
        assert_eq!(record.steps[0].stdout, "hi\n");
        assert!(record.finished_at.unwrap() >= record.started_at.unwrap());
        assert!(record.started_at.unwrap() >= record.created_at);
        assert_eq!(record.cleanup_status, CleanupStatus::Removed);
        assert!(record.summary.as_deref().unwrap().contains("passed"));

        // run.json exists with the terminal state
        let store = RunStore::new(tmp.path());
        assert_eq!(store.get("golden").unwrap().status, JobStatus::Success);
        // container removed under always_remove
        assert!(backend.live_containers().is_empty());
    }

    #[tokio::test]
    async fn fail_fast_skips_remaining_commands() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let runner = runner_with(backend.clone(), &tmp);

        let spec = JobSpec::new(
            "alpine:3.19",
            vec!["true".into(), "false".into(), "echo never".into()],
            60,
        );
        let record = runner.run(spec, ctx()).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.steps.len(), 2);
        assert_eq!(record.steps[0].exit_code, 0);
        assert_ne!(record.steps[1].exit_code, 0);
        assert!(!record.steps.iter().any(|s| s.command == "echo never"));
        // exactly one failing step, and it is the last recorded one
        let failing: Vec<_> = record.steps.iter().filter(|s| s.exit_code != 0).collect();
        assert_eq!(failing.len(), 1);
        assert_eq!(failing[0].index, record.steps.last().unwrap().index);
    }

    #[tokio::test]
    async fn ttl_timeout_marks_timed_out() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let runner = runner_with(backend.clone(), &tmp);

        let mut spec = JobSpec::new("alpine:3.19", vec!["sleep 10".into()], 1);
        spec.cleanup_policy = crate::schemas::CleanupPolicy::RemoveOnTimeout;
        let started = std::time::Instant::now();
        let record = runner.run(spec, ctx()).await;

        assert_eq!(record.status, JobStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(record.steps.last().unwrap().exit_code, TIMEOUT_EXIT_CODE);
        // remove_on_timeout removes the container on this path
        assert_eq!(record.cleanup_status, CleanupStatus::Removed);
        assert!(backend.live_containers().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_step() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let runner = runner_with(backend.clone(), &tmp);

        let run_ctx = ctx();
        let cancel = run_ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let spec = JobSpec::new("alpine:3.19", vec!["sleep 30".into()], 60);
        let created = Utc::now();
        let record = runner.run(spec, run_ctx).await;

        assert_eq!(record.status, JobStatus::Cancelled);
        let elapsed = (record.finished_at.unwrap() - created).num_seconds();
        assert!(elapsed < 60);
    }

    #[tokio::test]
    async fn pull_failure_is_recorded_after_retries() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        backend.fail_pulls(10);
        let runner = runner_with(backend.clone(), &tmp);

        let record = runner
            .run(JobSpec::new("alpine:3.19", vec!["true".into()], 60), ctx())
            .await;
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("pull failed"));
        assert!(record.steps.is_empty());
    }

    #[tokio::test]
    async fn transient_pull_recovers() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        backend.fail_pulls(2);
        let runner = runner_with(backend.clone(), &tmp);

        let record = runner
            .run(JobSpec::new("alpine:3.19", vec!["true".into()], 60), ctx())
            .await;
        assert_eq!(record.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn missing_image_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let runner = runner_with(backend.clone(), &tmp);

        let record = runner
            .run(JobSpec::new("ghcr.io/missing/app:1", vec!["true".into()], 60), ctx())
            .await;
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn artifacts_collected_with_metadata() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        backend.add_artifact("/out/*.txt", "/out/report.txt", b"results\n");
        let runner = runner_with(backend.clone(), &tmp);

        let mut spec = JobSpec::new("alpine:3.19", vec!["echo done".into()], 60);
        spec.job_id = "artifacty".into();
        spec.artifacts = vec!["/out/*.txt".into()];
        let record = runner.run(spec, ctx()).await;

        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.artifacts.len(), 1);
        let artifact = &record.artifacts[0];
        assert_eq!(artifact.path_in_container, "/out/report.txt");
        assert_eq!(artifact.local_path, "report.txt");
        assert_eq!(artifact.size_bytes, 8);
        assert_eq!(artifact.content_type, "text/plain");
        assert_eq!(artifact.sha256.len(), 64);
        assert!(tmp.path().join("artifacty").join("report.txt").is_file());
    }

    #[tokio::test]
    async fn missing_artifact_glob_warns_without_failing() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let runner = runner_with(backend.clone(), &tmp);

        let mut spec = JobSpec::new("alpine:3.19", vec!["echo done".into()], 60);
        spec.artifacts = vec!["/out/*.xml".into()];
        let record = runner.run(spec, ctx()).await;

        assert_eq!(record.status, JobStatus::Success);
        assert!(record.artifacts.is_empty());
        assert!(record.warnings.iter().any(|w| w.contains("no artifacts matched")));
    }

    #[tokio::test]
    async fn artifact_budget_truncates_collection() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let big = vec![b'x'; 2 * 1024 * 1024];
        backend.add_artifact("/out/*", "/out/a.bin", &big);
        backend.add_artifact("/out/*", "/out/b.bin", &big);
        backend.add_artifact("/out/*", "/out/c.bin", &big);
        let runner = runner_with(backend.clone(), &tmp);

        let mut spec = JobSpec::new("alpine:3.19", vec!["echo done".into()], 60);
        spec.artifacts = vec!["/out/*".into()];
        let mut run_ctx = ctx();
        run_ctx.limits.max_artifacts_size_mb = 3;
        let record = runner.run(spec, run_ctx).await;

        // Still SUCCESS: budget overrun is a warning, not a failure
        assert_eq!(record.status, JobStatus::Success);
        assert!(record.artifacts.len() < 3);
        assert!(record.warnings.iter().any(|w| w.contains("truncated")));
    }

    #[tokio::test]
    async fn environment_capture_is_redacted() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let runner = runner_with(backend.clone(), &tmp);

        let mut spec = JobSpec::new("alpine:3.19", vec!["true".into()], 60);
        spec.env.insert("API_TOKEN".into(), "secret-value".into());
        spec.env.insert("LOG_LEVEL".into(), "debug".into());
        let record = runner.run(spec, ctx()).await;

        let capture = record.environment_capture.unwrap();
        assert_eq!(capture.env["API_TOKEN"], "***");
        assert_eq!(capture.env["LOG_LEVEL"], "debug");
        assert!(capture.image_digest.is_some());
    }

    #[tokio::test]
    async fn keep_on_completion_leaves_container() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let runner = runner_with(backend.clone(), &tmp);

        let mut spec = JobSpec::new("alpine:3.19", vec!["true".into()], 60);
        spec.cleanup_policy = crate::schemas::CleanupPolicy::KeepOnCompletion;
        let record = runner.run(spec, ctx()).await;

        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.cleanup_status, CleanupStatus::Kept);
        assert_eq!(backend.live_containers().len(), 1);
    }

    #[tokio::test]
    async fn resource_usage_snapshot_attached() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let runner = runner_with(backend.clone(), &tmp);

        let record = runner
            .run(JobSpec::new("alpine:3.19", vec!["true".into()], 60), ctx())
            .await;
        let usage = record.resource_usage.unwrap();
        assert!(usage.memory_peak_mb > 0.0);
    }

    #[tokio::test]
    async fn steps_streamed_to_jsonl() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let runner = runner_with(backend.clone(), &tmp);

        let mut spec = JobSpec::new("alpine:3.19", vec!["echo one".into(), "echo two".into()], 60);
        spec.job_id = "streamed".into();
        runner.run(spec, ctx()).await;

        let steps = RunStore::new(tmp.path()).get_steps("streamed");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].stdout, "one\n");
        assert_eq!(steps[1].stdout, "two\n");
    }

    #[tokio::test]
    async fn baseline_updated_on_completion() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let baselines = Arc::new(BaselineTracker::new(tmp.path().join("baselines.json")));
        let anomalies = Arc::new(AnomalyStore::new(tmp.path().join("anomalies")));
        let runner = JobRunner::new(backend.clone(), RunStore::new(tmp.path()))
            .with_observability(baselines.clone(), anomalies);

        let spec = JobSpec::new("alpine:3.19", vec!["echo hi".into()], 60);
        let fingerprint = spec.fingerprint();
        runner.run(spec, ctx()).await;

        assert_eq!(baselines.get(&fingerprint).unwrap().samples, 1);
    }
}

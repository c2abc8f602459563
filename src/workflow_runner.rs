//! Workflow DAG execution.
//!
//! Compiles a validated [`WorkflowSpec`] into dependency levels and runs
//! them level-parallel: after every job at level k is terminal, level k+1
//! is scheduled. Condition gates, `on_complete` rules, matrix expansion,
//! and service containers are resolved per job; the actual sandbox runs go
//! through [`JobManager`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::condition::ConditionEvaluator;
use crate::error::OrcaError;
use crate::job_manager::{JobManager, SERVICE_NETWORK_METADATA_KEY};
use crate::schemas::{JobSpec, JobStatus};
use crate::service_manager::{ServiceManager, StartedServices};
use crate::workflow_schema::{
    execution_levels, expand_matrix, interpolate_matrix, matrix_key, OnComplete, WorkflowJob,
    WorkflowSpec,
};

/// Poll interval while waiting on a submitted job.
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Success,
    Failed,
    Partial,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Success
                | WorkflowStatus::Failed
                | WorkflowStatus::Partial
                | WorkflowStatus::Cancelled
        )
    }
}

/// Per-job state inside a workflow. Extends the job statuses with
/// `SKIPPED` for condition-gated jobs, which count as success for
/// downstream `requires` unless the dependent runs `on_complete: failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowJobState {
    Queued,
    Running,
    Success,
    Failed,
    TimedOut,
    Cancelled,
    Skipped,
}

impl WorkflowJobState {
    fn from_job_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => WorkflowJobState::Queued,
            JobStatus::Running => WorkflowJobState::Running,
            JobStatus::Success => WorkflowJobState::Success,
            JobStatus::Failed => WorkflowJobState::Failed,
            JobStatus::TimedOut => WorkflowJobState::TimedOut,
            JobStatus::Cancelled => WorkflowJobState::Cancelled,
        }
    }

    /// Lowercase form used by condition expressions.
    pub fn condition_value(&self) -> &'static str {
        match self {
            WorkflowJobState::Queued => "queued",
            WorkflowJobState::Running => "running",
            WorkflowJobState::Success => "success",
            WorkflowJobState::Failed => "failed",
            WorkflowJobState::TimedOut => "timed_out",
            WorkflowJobState::Cancelled => "cancelled",
            WorkflowJobState::Skipped => "skipped",
        }
    }

    fn is_failure(&self) -> bool {
        matches!(self, WorkflowJobState::Failed | WorkflowJobState::TimedOut)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJobStatus {
    pub job_name: String,
    pub status: WorkflowJobState,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub matrix_key: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowJobStatus {
    fn new(job_name: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            status: WorkflowJobState::Queued,
            job_id: None,
            matrix_key: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Durable record of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: String,
    pub spec_name: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
    /// Keyed by job name; matrix variants use `name[k=v,...]`.
    #[serde(default)]
    pub job_statuses: BTreeMap<String, WorkflowJobStatus>,
    #[serde(default)]
    pub job_run_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowRecord {
    pub fn pending(workflow_id: &str, spec: &WorkflowSpec, triggered_by: Option<String>) -> Self {
        let mut job_statuses = BTreeMap::new();
        for name in spec.jobs.keys() {
            job_statuses.insert(name.clone(), WorkflowJobStatus::new(name));
        }
        Self {
            workflow_id: workflow_id.to_string(),
            spec_name: spec.name.clone(),
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            env: spec.env.clone(),
            triggered_by,
            job_statuses,
            job_run_ids: BTreeMap::new(),
            error: None,
        }
    }
}

/// Aggregate the states of a base job name (all matrix variants included).
fn aggregate_state(
    record: &WorkflowRecord,
    base: &str,
) -> Option<WorkflowJobState> {
    let mut states = Vec::new();
    for (name, status) in &record.job_statuses {
        if name == base || (name.starts_with(base) && name[base.len()..].starts_with('[')) {
            states.push(status.status);
        }
    }
    if states.is_empty() {
        return None;
    }
    if states.iter().any(|s| s.is_failure()) {
        return Some(WorkflowJobState::Failed);
    }
    if states.iter().any(|s| *s == WorkflowJobState::Cancelled) {
        return Some(WorkflowJobState::Cancelled);
    }
    if states
        .iter()
        .any(|s| matches!(s, WorkflowJobState::Queued | WorkflowJobState::Running))
    {
        return Some(WorkflowJobState::Running);
    }
    if states.iter().all(|s| *s == WorkflowJobState::Skipped) {
        return Some(WorkflowJobState::Skipped);
    }
    Some(WorkflowJobState::Success)
}

enum Gate {
    Run,
    /// Condition gate: treated as success downstream.
    Skip(String),
    /// Upstream outcome gate: the job never becomes eligible.
    Blocked(String),
}

/// Executes one workflow spec against a job manager.
pub struct WorkflowRunner {
    jobs: Arc<JobManager>,
    services: Arc<ServiceManager>,
    max_parallel: usize,
}

impl WorkflowRunner {
    pub fn new(jobs: Arc<JobManager>, services: Arc<ServiceManager>) -> Self {
        Self {
            jobs,
            services,
            max_parallel: 4,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Run the workflow to a terminal state. The spec must already have
    /// passed validation; a cyclic spec fails here without running jobs.
    #[instrument(skip(self, spec, cancel), fields(workflow_id = %workflow_id, name = %spec.name))]
    pub async fn run(
        &self,
        spec: WorkflowSpec,
        workflow_id: String,
        cancel: CancelToken,
        triggered_by: Option<String>,
    ) -> WorkflowRecord {
        let mut record = WorkflowRecord::pending(&workflow_id, &spec, triggered_by);
        record.status = WorkflowStatus::Running;
        record.started_at = Some(Utc::now());

        let levels = match execution_levels(&spec) {
            Ok(levels) => levels,
            Err(e) => {
                record.status = WorkflowStatus::Failed;
                record.error = Some(e.to_string());
                record.finished_at = Some(Utc::now());
                return record;
            }
        };

        let deadline = Instant::now() + Duration::from_secs(spec.timeout_seconds);
        let shared = Arc::new(Mutex::new(record));
        let mut timed_out = false;

        'levels: for level in &levels {
            if cancel.is_cancelled() {
                self.mark_queued(&shared, "workflow cancelled", WorkflowJobState::Cancelled);
                break 'levels;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                self.mark_queued(&shared, "workflow_timeout", WorkflowJobState::Cancelled);
                break 'levels;
            }

            // Gate every job at this level against upstream outcomes and
            // conditions before anything is scheduled.
            let mut runnable: Vec<(String, WorkflowJob, BTreeMap<String, String>)> = Vec::new();
            for job_name in level {
                let job = spec.jobs[job_name].clone();
                let gate = {
                    let rec = shared.lock();
                    self.gate(&rec, job_name, &job)
                };
                match gate {
                    Gate::Run => {
                        let variants = match &job.matrix {
                            Some(matrix) => expand_matrix(matrix),
                            None => vec![BTreeMap::new()],
                        };
                        let expanded = variants.len() > 1 || job.matrix.is_some();
                        for params in variants {
                            let display = if expanded && !params.is_empty() {
                                format!("{}[{}]", job_name, matrix_key(&params))
                            } else {
                                job_name.clone()
                            };
                            if display != *job_name {
                                let mut rec = shared.lock();
                                rec.job_statuses.remove(job_name);
                                let mut status = WorkflowJobStatus::new(&display);
                                status.matrix_key = Some(matrix_key(&params));
                                rec.job_statuses.insert(display.clone(), status);
                            }
                            runnable.push((display, job.clone(), params));
                        }
                    }
                    Gate::Skip(reason) => {
                        let mut rec = shared.lock();
                        let entry = rec
                            .job_statuses
                            .entry(job_name.clone())
                            .or_insert_with(|| WorkflowJobStatus::new(job_name));
                        entry.status = WorkflowJobState::Skipped;
                        entry.error = Some(reason);
                        entry.finished_at = Some(Utc::now());
                    }
                    Gate::Blocked(reason) => {
                        let mut rec = shared.lock();
                        let entry = rec
                            .job_statuses
                            .entry(job_name.clone())
                            .or_insert_with(|| WorkflowJobStatus::new(job_name));
                        entry.status = WorkflowJobState::Cancelled;
                        entry.error = Some(reason);
                        entry.finished_at = Some(Utc::now());
                    }
                }
            }

            if runnable.is_empty() {
                continue;
            }

            // Level barrier: every job here terminates before level k+1.
            let semaphore = Arc::new(Semaphore::new(self.max_parallel));
            let mut tasks = JoinSet::new();
            for (display, job, params) in runnable {
                let permit_source = semaphore.clone();
                let runner_jobs = self.jobs.clone();
                let runner_services = self.services.clone();
                let shared = shared.clone();
                let cancel = cancel.clone();
                let spec_env = spec.env.clone();
                let spec_name = spec.name.clone();
                let cleanup_policy = spec.cleanup_policy;
                let workflow_id = workflow_id.clone();
                tasks.spawn(async move {
                    let _permit = permit_source.acquire_owned().await;
                    execute_single(
                        runner_jobs,
                        runner_services,
                        shared,
                        cancel,
                        workflow_id,
                        spec_name,
                        spec_env,
                        cleanup_policy,
                        display,
                        job,
                        params,
                        deadline,
                    )
                    .await;
                });
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "workflow job task panicked");
                }
            }
        }

        let mut record = Arc::try_unwrap(shared)
            .map(|m| m.into_inner())
            .unwrap_or_else(|arc| arc.lock().clone());
        record.finished_at = Some(Utc::now());
        let timed_out = timed_out
            || record
                .job_statuses
                .values()
                .any(|s| s.error.as_deref() == Some("workflow_timeout"));
        record.status = if cancel.is_cancelled() {
            record.error.get_or_insert_with(|| "workflow cancelled".into());
            WorkflowStatus::Cancelled
        } else if timed_out {
            record.error = Some("workflow_timeout".into());
            WorkflowStatus::Failed
        } else {
            compute_final_status(&record)
        };
        info!(status = ?record.status, "workflow finished");
        record
    }

    fn mark_queued(&self, shared: &Arc<Mutex<WorkflowRecord>>, reason: &str, state: WorkflowJobState) {
        let mut rec = shared.lock();
        for status in rec.job_statuses.values_mut() {
            if status.status == WorkflowJobState::Queued {
                status.status = state;
                status.error = Some(reason.to_string());
                status.finished_at = Some(Utc::now());
            }
        }
    }

    /// Decide whether a job runs, is condition-skipped, or is blocked by
    /// upstream outcomes.
    fn gate(&self, record: &WorkflowRecord, job_name: &str, job: &WorkflowJob) -> Gate {
        match job.on_complete {
            OnComplete::Always => {}
            OnComplete::Failure => {
                let any_failed = job.requires.iter().any(|dep| {
                    aggregate_state(record, dep).is_some_and(|s| s.is_failure())
                });
                if !any_failed {
                    return Gate::Blocked("no upstream failure to handle".into());
                }
            }
            OnComplete::Success => {
                let all_ok = job.requires.iter().all(|dep| {
                    matches!(
                        aggregate_state(record, dep),
                        Some(WorkflowJobState::Success) | Some(WorkflowJobState::Skipped) | None
                    )
                });
                if !all_ok {
                    return Gate::Blocked("upstream failure".into());
                }
            }
        }

        let statuses: HashMap<String, String> = {
            let mut map = HashMap::new();
            for name in record.job_statuses.keys() {
                let base = name.split('[').next().unwrap_or(name).to_string();
                if let Some(state) = aggregate_state(record, &base) {
                    map.insert(base, state.condition_value().to_string());
                }
            }
            map
        };
        let evaluator = ConditionEvaluator::new(statuses, record.env.clone());

        if let Some(condition) = &job.if_condition {
            match evaluator.evaluate(condition) {
                Ok(true) => {}
                Ok(false) => return Gate::Skip(format!("if condition not met: {}", condition)),
                Err(e) => {
                    warn!(job = job_name, error = %e, "condition evaluation failed");
                    return Gate::Skip(format!("condition error: {}", e));
                }
            }
        }
        if let Some(condition) = &job.unless_condition {
            match evaluator.evaluate(condition) {
                Ok(false) => {}
                Ok(true) => return Gate::Skip(format!("unless condition met: {}", condition)),
                Err(e) => {
                    warn!(job = job_name, error = %e, "condition evaluation failed");
                    return Gate::Skip(format!("condition error: {}", e));
                }
            }
        }
        Gate::Run
    }
}

/// SUCCESS when every non-skipped job succeeded; CANCELLED when nothing
/// failed but cancellations exist; PARTIAL on mixed success/failure across
/// branches; FAILED otherwise.
fn compute_final_status(record: &WorkflowRecord) -> WorkflowStatus {
    let states: Vec<WorkflowJobState> = record
        .job_statuses
        .values()
        .map(|s| s.status)
        .filter(|s| *s != WorkflowJobState::Skipped)
        .collect();

    if states.is_empty() || states.iter().all(|s| *s == WorkflowJobState::Success) {
        return WorkflowStatus::Success;
    }
    let any_failure = states.iter().any(|s| s.is_failure());
    let any_cancelled = states.iter().any(|s| *s == WorkflowJobState::Cancelled);
    let any_success = states.iter().any(|s| *s == WorkflowJobState::Success);

    if !any_failure && any_cancelled {
        return WorkflowStatus::Cancelled;
    }
    if any_success && (any_failure || any_cancelled) {
        return WorkflowStatus::Partial;
    }
    WorkflowStatus::Failed
}

fn sanitize_job_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.chars().take(128).collect()
}

#[allow(clippy::too_many_arguments)]
async fn execute_single(
    jobs: Arc<JobManager>,
    services: Arc<ServiceManager>,
    shared: Arc<Mutex<WorkflowRecord>>,
    cancel: CancelToken,
    workflow_id: String,
    spec_name: String,
    workflow_env: HashMap<String, String>,
    cleanup_policy: crate::schemas::CleanupPolicy,
    display_name: String,
    job: WorkflowJob,
    params: BTreeMap<String, String>,
    deadline: Instant,
) {
    let set_state = |state: WorkflowJobState, error: Option<String>| {
        let mut rec = shared.lock();
        if let Some(entry) = rec.job_statuses.get_mut(&display_name) {
            entry.status = state;
            if error.is_some() {
                entry.error = error.clone();
            }
            if matches!(state, WorkflowJobState::Running) {
                entry.started_at = Some(Utc::now());
            } else {
                entry.finished_at = Some(Utc::now());
            }
        }
    };

    // Matrix interpolation into image, commands, and env values.
    let image = interpolate_matrix(&job.image, &params);
    let commands: Vec<String> = job
        .commands
        .iter()
        .map(|c| interpolate_matrix(c, &params))
        .collect();

    let mut env = workflow_env;
    for (k, v) in &job.env {
        env.insert(k.clone(), interpolate_matrix(v, &params));
    }
    for (k, v) in &params {
        env.insert(format!("MATRIX_{}", k.to_uppercase()), v.clone());
    }

    // Service containers come up before the job and go down after it.
    let started: Option<StartedServices> = if job.services.is_empty() {
        None
    } else {
        match services
            .start(&workflow_id, &sanitize_job_id(&display_name), &job.services)
            .await
        {
            Ok(started) => {
                env.extend(started.env.clone());
                Some(started)
            }
            Err(e) => {
                set_state(
                    WorkflowJobState::Failed,
                    Some(format!("service startup failed: {}", e)),
                );
                return;
            }
        }
    };

    let suffix = if params.is_empty() {
        String::new()
    } else {
        format!("-{}", matrix_key(&params).replace(['=', ','], "-"))
    };
    let job_id = sanitize_job_id(&format!("wf-{}-{}{}", workflow_id, display_name.split('[').next().unwrap_or(&display_name), suffix));

    let mut job_spec = JobSpec::new(image, commands, job.timeout_seconds.max(1));
    job_spec.job_id = job_id.clone();
    job_spec.env = env;
    job_spec.artifacts = job.artifacts.clone();
    job_spec.cleanup_policy = cleanup_policy;
    job_spec.triggered_by = Some("workflow".to_string());
    job_spec.tags = vec![
        "workflow".to_string(),
        spec_name,
        display_name.split('[').next().unwrap_or(&display_name).to_string(),
    ];
    job_spec
        .metadata
        .insert("workflow_id".to_string(), json!(workflow_id));
    if let Some(started) = &started {
        job_spec.metadata.insert(
            SERVICE_NETWORK_METADATA_KEY.to_string(),
            json!(started.network),
        );
    }

    {
        let mut rec = shared.lock();
        rec.job_run_ids.insert(display_name.clone(), job_id.clone());
        if let Some(entry) = rec.job_statuses.get_mut(&display_name) {
            entry.job_id = Some(job_id.clone());
        }
    }
    set_state(WorkflowJobState::Running, None);

    let submitted = jobs.submit(job_spec, "workflow");
    match submitted {
        Ok(_) => {
            let wait_deadline =
                Instant::now() + Duration::from_secs(job.timeout_seconds.max(1) + 30);
            loop {
                if cancel.is_cancelled() || Instant::now() >= deadline {
                    let reason = if cancel.is_cancelled() {
                        "workflow cancelled"
                    } else {
                        "workflow_timeout"
                    };
                    let _ = jobs.cancel(&job_id);
                    // Let the executor finalize before reporting
                    let _ = jobs.wait(&job_id).await;
                    set_state(WorkflowJobState::Cancelled, Some(reason.to_string()));
                    break;
                }
                if Instant::now() >= wait_deadline {
                    let _ = jobs.cancel(&job_id);
                    set_state(
                        WorkflowJobState::TimedOut,
                        Some(format!("job did not complete within {}s", job.timeout_seconds)),
                    );
                    break;
                }
                match jobs.get(&job_id) {
                    Some(record) if record.status.is_terminal() => {
                        set_state(
                            WorkflowJobState::from_job_status(record.status),
                            record.error.clone(),
                        );
                        break;
                    }
                    Some(_) => tokio::time::sleep(JOB_POLL_INTERVAL).await,
                    None => {
                        set_state(
                            WorkflowJobState::Failed,
                            Some("job record disappeared".to_string()),
                        );
                        break;
                    }
                }
            }
        }
        Err(OrcaError::AlreadyExists { .. }) => {
            set_state(
                WorkflowJobState::Failed,
                Some("duplicate job id for workflow job".to_string()),
            );
        }
        Err(e) => {
            set_state(WorkflowJobState::Failed, Some(e.to_string()));
        }
    }

    if let Some(started) = started {
        services.stop(&started).await;
    }
}

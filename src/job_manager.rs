//! Job lifecycle management.
//!
//! Admission (validation, policy, quota), executor spawn, the in-memory
//! registry with disk spill, cancellation, eviction, and startup
//! reconciliation of runs orphaned by a previous process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::anomaly::AnomalyStore;
use crate::audit::{AuditAction, AuditLogger, AuditOutcome};
use crate::backend::ContainerBackend;
use crate::baseline::BaselineTracker;
use crate::cancel::CancelToken;
use crate::config::{self, OrcaPaths};
use crate::error::{OrcaError, Result};
use crate::job_runner::{JobRunner, RunContext};
use crate::policy::{PolicyEngine, SecurityPolicy};
use crate::quota::{QuotaTracker, ReservationKind};
use crate::run_store::{find_non_terminal, RunStore};
use crate::schemas::{JobSpec, JobStatus, RunRecord};
use crate::workspace::{WorkspaceRegistry, WorkspaceStatus};

/// Completed entries kept in memory before eviction to disk-only access.
const MAX_RESIDENT_JOBS: usize = 100;

/// Metadata key the workflow layer uses to pass a service network in.
pub const SERVICE_NETWORK_METADATA_KEY: &str = "service_network";

struct JobEntry {
    record: Mutex<RunRecord>,
    cancel: CancelToken,
    workspace_id: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Concurrent job registry and admission front door.
pub struct JobManager {
    runner: Arc<JobRunner>,
    store: RunStore,
    policy: PolicyEngine,
    quota: Arc<QuotaTracker>,
    audit: Arc<AuditLogger>,
    workspaces: Arc<WorkspaceRegistry>,
    jobs: Mutex<HashMap<String, Arc<JobEntry>>>,
}

impl JobManager {
    /// Build a manager rooted at `paths`. Probes the backend unless
    /// `ORCAOPS_SKIP_BACKEND_INIT=1`, then reconciles orphaned runs.
    pub async fn new(
        backend: Arc<dyn ContainerBackend>,
        paths: &OrcaPaths,
        policy: SecurityPolicy,
    ) -> Result<Arc<Self>> {
        paths.ensure_dirs()?;
        if !config::skip_backend_init() {
            backend.ping().await?;
        }

        let store = RunStore::new(paths.artifacts_dir());
        let baselines = Arc::new(BaselineTracker::new(paths.baselines_path()));
        let anomalies = Arc::new(AnomalyStore::new(paths.anomalies_dir()));
        let runner = Arc::new(
            JobRunner::new(backend, store.clone()).with_observability(baselines, anomalies),
        );

        let manager = Arc::new(Self {
            runner,
            store,
            policy: PolicyEngine::new(policy),
            quota: Arc::new(QuotaTracker::new()),
            audit: Arc::new(AuditLogger::new(paths.audit_dir())),
            workspaces: Arc::new(WorkspaceRegistry::new(paths.workspaces_dir())),
            jobs: Mutex::new(HashMap::new()),
        });
        manager.reconcile_orphans();
        Ok(manager)
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceRegistry> {
        &self.workspaces
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    /// Admit and start a job. Returns the initial QUEUED record; the
    /// executor task owns the record from here on.
    #[instrument(skip(self, spec), fields(job_id = %spec.job_id, workspace = %spec.workspace_id))]
    pub fn submit(self: &Arc<Self>, spec: JobSpec, actor: &str) -> Result<RunRecord> {
        spec.validate()?;
        let workspace = self.workspaces.resolve(&spec.workspace_id);
        if workspace.status != WorkspaceStatus::Active {
            return Err(OrcaError::validation(format!(
                "workspace '{}' is not active",
                workspace.id
            )));
        }
        if spec.ttl_seconds > workspace.limits.max_job_duration_seconds {
            return Err(OrcaError::validation(format!(
                "ttl_seconds {} exceeds workspace maximum {}",
                spec.ttl_seconds, workspace.limits.max_job_duration_seconds
            )));
        }

        // Policy gate. Violations are audited whether or not anything else
        // would have rejected the job.
        let engine = self.policy.for_workspace(&workspace.settings);
        let verdict = engine.validate_job(&spec);
        if !verdict.allowed {
            self.audit.log_action(
                &workspace.id,
                "user",
                actor,
                AuditAction::PolicyViolated,
                "job",
                &spec.job_id,
                AuditOutcome::Denied,
                json!({ "violations": verdict.violations }),
            );
            self.audit.log_action(
                &workspace.id,
                "user",
                actor,
                AuditAction::JobDenied,
                "job",
                &spec.job_id,
                AuditOutcome::Denied,
                json!({ "reason": "policy", "violations": verdict.violations }),
            );
            return Err(OrcaError::PolicyDenied {
                violations: verdict.violations,
            });
        }

        // Quota gate: check-and-reserve, released by the executor.
        if let Err(e) = self
            .quota
            .check_and_reserve(&workspace, ReservationKind::Job, &spec.job_id)
        {
            self.audit.log_action(
                &workspace.id,
                "user",
                actor,
                AuditAction::JobDenied,
                "job",
                &spec.job_id,
                AuditOutcome::Denied,
                json!({ "reason": "quota", "detail": e.to_string() }),
            );
            return Err(e);
        }

        let network = spec
            .metadata
            .get(SERVICE_NETWORK_METADATA_KEY)
            .and_then(|v| v.as_str())
            .map(String::from);
        let ctx = RunContext {
            limits: workspace.limits.clone(),
            security_opts: engine.container_security_opts(),
            network,
            cancel: CancelToken::new(),
        };

        // Registry insert decides duplicate admission: under this lock at
        // most one submit for a job_id wins.
        let entry = {
            let mut jobs = self.jobs.lock();
            if jobs.contains_key(&spec.job_id) || self.store.get(&spec.job_id).is_some() {
                drop(jobs);
                self.quota
                    .release(&workspace.id, ReservationKind::Job, &spec.job_id);
                return Err(OrcaError::AlreadyExists {
                    kind: "job",
                    id: spec.job_id.clone(),
                });
            }
            let entry = Arc::new(JobEntry {
                record: Mutex::new(RunRecord::queued(spec.clone())),
                cancel: ctx.cancel.clone(),
                workspace_id: workspace.id.clone(),
                handle: Mutex::new(None),
            });
            jobs.insert(spec.job_id.clone(), entry.clone());
            entry
        };

        self.audit.log_action(
            &workspace.id,
            "user",
            actor,
            AuditAction::JobCreated,
            "job",
            &spec.job_id,
            AuditOutcome::Success,
            json!({ "image": spec.image, "commands": spec.commands.len() }),
        );

        let initial = entry.record.lock().clone();
        let manager = Arc::clone(self);
        let entry_for_task = entry.clone();
        let handle = tokio::spawn(async move {
            manager.execute(spec, ctx, entry_for_task).await;
        });
        *entry.handle.lock() = Some(handle);

        Ok(initial)
    }

    async fn execute(self: Arc<Self>, spec: JobSpec, ctx: RunContext, entry: Arc<JobEntry>) {
        let job_id = spec.job_id.clone();
        let final_record = self.runner.run(spec, ctx).await;

        let outcome = if final_record.status == JobStatus::Success {
            AuditOutcome::Success
        } else {
            AuditOutcome::Error
        };
        self.audit.log_action(
            &entry.workspace_id,
            "system",
            "job_manager",
            AuditAction::JobCompleted,
            "job",
            &job_id,
            outcome,
            json!({ "status": final_record.status.to_string() }),
        );

        *entry.record.lock() = final_record;
        self.quota
            .release(&entry.workspace_id, ReservationKind::Job, &job_id);
        self.evict_completed();
    }

    /// Snapshot of a job's record, memory first then disk.
    pub fn get(&self, job_id: &str) -> Option<RunRecord> {
        let entry = self.jobs.lock().get(job_id).cloned();
        match entry {
            Some(entry) => Some(entry.record.lock().clone()),
            None => self.store.get(job_id),
        }
    }

    /// All known jobs (resident and spilled), newest first.
    pub fn list(&self, status: Option<JobStatus>) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = {
            let jobs = self.jobs.lock();
            jobs.values().map(|e| e.record.lock().clone()).collect()
        };
        let resident: std::collections::HashSet<String> =
            records.iter().map(|r| r.job_id.clone()).collect();

        let (spilled, _) = self.store.list(&crate::run_store::RunFilter {
            limit: 0,
            ..crate::run_store::RunFilter::new()
        });
        records.extend(spilled.into_iter().filter(|r| !resident.contains(&r.job_id)));

        if let Some(s) = status {
            records.retain(|r| r.status == s);
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Request cancellation. The executor observes the signal between
    /// steps and at watchdog ticks and finalizes the record as CANCELLED.
    pub fn cancel(&self, job_id: &str) -> Result<RunRecord> {
        let entry = self
            .jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or(OrcaError::NotFound {
                kind: "job",
                id: job_id.to_string(),
            })?;
        info!(job_id, "cancellation requested");
        entry.cancel.cancel();
        let record = entry.record.lock().clone();
        Ok(record)
    }

    /// Wait until a job reaches a terminal status (polling, bounded by the
    /// caller's own timeout if needed).
    pub async fn wait(&self, job_id: &str) -> Option<RunRecord> {
        loop {
            match self.get(job_id) {
                Some(record) if record.status.is_terminal() => return Some(record),
                Some(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                None => return None,
            }
        }
    }

    /// Cancel everything and wait for executors to drain.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<JobEntry>> = self.jobs.lock().values().cloned().collect();
        for entry in &entries {
            entry.cancel.cancel();
        }
        for entry in entries {
            let handle = entry.handle.lock().take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    warn!(error = %e, "executor task join failed during shutdown");
                }
            }
        }
    }

    /// Evict terminal entries once the registry is over its cap. Evicted
    /// records stay reachable through the run store.
    fn evict_completed(&self) {
        let mut jobs = self.jobs.lock();
        if jobs.len() <= MAX_RESIDENT_JOBS {
            return;
        }
        let mut terminal: Vec<(String, chrono::DateTime<chrono::Utc>)> = jobs
            .iter()
            .filter(|(_, e)| e.record.lock().status.is_terminal())
            .map(|(id, e)| (id.clone(), e.record.lock().created_at))
            .collect();
        terminal.sort_by_key(|(_, created)| *created);

        let excess = jobs.len().saturating_sub(MAX_RESIDENT_JOBS);
        for (id, _) in terminal.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }

    /// Mark runs left non-terminal by a dead process as FAILED(orphaned).
    fn reconcile_orphans(&self) {
        for mut record in find_non_terminal(&self.store) {
            warn!(job_id = %record.job_id, status = %record.status, "reconciling orphaned run");
            record.error = Some("orphaned: process terminated before completion".into());
            record.finalize(JobStatus::Failed);
            if let Err(e) = self.store.put(&record) {
                error!(job_id = %record.job_id, error = %e, "failed to persist orphan reconciliation");
                continue;
            }
            self.audit.log_action(
                &record.spec.workspace_id,
                "system",
                "job_manager",
                AuditAction::JobCompleted,
                "job",
                &record.job_id,
                AuditOutcome::Error,
                json!({ "reason": "orphaned" }),
            );
        }
    }
}

//! Workflow lifecycle management and persistence.
//!
//! Mirrors the job manager for workflows: submit spawns a runner task,
//! records live in an in-memory registry with disk spill to
//! `workflows/<workflow_id>/workflow.json`, and cancellation propagates to
//! every in-flight job owned by the workflow.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::audit::{AuditAction, AuditOutcome};
use crate::backend::ContainerBackend;
use crate::cancel::CancelToken;
use crate::config::{atomic_write, OrcaPaths};
use crate::error::{OrcaError, Result};
use crate::job_manager::JobManager;
use crate::service_manager::ServiceManager;
use crate::workflow_runner::{WorkflowRecord, WorkflowRunner, WorkflowStatus};
use crate::workflow_schema::{validate_workflow, WorkflowSpec};

/// Completed workflow entries kept resident before eviction.
const MAX_RESIDENT_WORKFLOWS: usize = 100;

/// Disk-backed store for workflow records.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    dir: PathBuf,
}

impl WorkflowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn put(&self, record: &WorkflowRecord) -> Result<()> {
        let path = self.dir.join(&record.workflow_id).join("workflow.json");
        let bytes = serde_json::to_vec_pretty(record)?;
        atomic_write(&path, &bytes)?;
        Ok(())
    }

    pub fn get(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        let path = self.dir.join(workflow_id).join("workflow.json");
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn list(&self, status: Option<WorkflowStatus>) -> Vec<WorkflowRecord> {
        let mut records: Vec<WorkflowRecord> = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|entry| {
                    let path = entry.path().join("workflow.json");
                    let contents = std::fs::read_to_string(path).ok()?;
                    serde_json::from_str(&contents).ok()
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        if let Some(s) = status {
            records.retain(|r| r.status == s);
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn delete(&self, workflow_id: &str) -> bool {
        let dir = self.dir.join(workflow_id);
        dir.is_dir() && std::fs::remove_dir_all(dir).is_ok()
    }
}

struct WorkflowEntry {
    record: Mutex<WorkflowRecord>,
    cancel: CancelToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Registry and front door for workflow execution.
pub struct WorkflowManager {
    jobs: Arc<JobManager>,
    runner: Arc<WorkflowRunner>,
    store: WorkflowStore,
    workflows: Mutex<HashMap<String, Arc<WorkflowEntry>>>,
}

impl WorkflowManager {
    pub fn new(
        jobs: Arc<JobManager>,
        backend: Arc<dyn ContainerBackend>,
        paths: &OrcaPaths,
    ) -> Arc<Self> {
        let services = Arc::new(ServiceManager::new(backend));
        let runner = Arc::new(WorkflowRunner::new(jobs.clone(), services));
        Arc::new(Self {
            jobs,
            runner,
            store: WorkflowStore::new(paths.workflows_dir()),
            workflows: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    /// Validate and start a workflow in the background. Returns the
    /// initial PENDING record.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub fn submit(
        self: &Arc<Self>,
        spec: WorkflowSpec,
        workflow_id: Option<String>,
        triggered_by: Option<String>,
    ) -> Result<WorkflowRecord> {
        validate_workflow(&spec)?;
        let workflow_id = workflow_id
            .unwrap_or_else(|| format!("wf-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]));

        let entry = {
            let mut workflows = self.workflows.lock();
            if workflows.contains_key(&workflow_id) || self.store.get(&workflow_id).is_some() {
                return Err(OrcaError::AlreadyExists {
                    kind: "workflow",
                    id: workflow_id,
                });
            }
            let record = WorkflowRecord::pending(&workflow_id, &spec, triggered_by.clone());
            let entry = Arc::new(WorkflowEntry {
                record: Mutex::new(record),
                cancel: CancelToken::new(),
                handle: Mutex::new(None),
            });
            workflows.insert(workflow_id.clone(), entry.clone());
            entry
        };

        self.jobs.audit().log_action(
            crate::workspace::DEFAULT_WORKSPACE_ID,
            "user",
            triggered_by.as_deref().unwrap_or("system"),
            AuditAction::WorkflowCreated,
            "workflow",
            &workflow_id,
            AuditOutcome::Success,
            json!({ "spec": spec.name, "jobs": spec.jobs.len() }),
        );

        let initial = entry.record.lock().clone();
        let manager = Arc::clone(self);
        let entry_for_task = entry.clone();
        let cancel = entry.cancel.clone();
        let id_for_task = workflow_id.clone();
        let handle = tokio::spawn(async move {
            let final_record = manager
                .runner
                .run(spec, id_for_task.clone(), cancel, triggered_by)
                .await;

            let outcome = match final_record.status {
                WorkflowStatus::Success => AuditOutcome::Success,
                _ => AuditOutcome::Error,
            };
            manager.jobs.audit().log_action(
                crate::workspace::DEFAULT_WORKSPACE_ID,
                "system",
                "workflow_manager",
                AuditAction::WorkflowCompleted,
                "workflow",
                &id_for_task,
                outcome,
                json!({ "status": final_record.status }),
            );

            if let Err(e) = manager.store.put(&final_record) {
                warn!(workflow_id = %id_for_task, error = %e, "failed to persist workflow record");
            }
            *entry_for_task.record.lock() = final_record;
            manager.evict_completed();
        });
        *entry.handle.lock() = Some(handle);

        info!(workflow_id = %workflow_id, "workflow submitted");
        Ok(initial)
    }

    pub fn get(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        let entry = self.workflows.lock().get(workflow_id).cloned();
        match entry {
            Some(entry) => Some(entry.record.lock().clone()),
            None => self.store.get(workflow_id),
        }
    }

    pub fn list(&self, status: Option<WorkflowStatus>) -> Vec<WorkflowRecord> {
        let mut records: Vec<WorkflowRecord> = {
            let workflows = self.workflows.lock();
            workflows.values().map(|e| e.record.lock().clone()).collect()
        };
        let resident: std::collections::HashSet<String> =
            records.iter().map(|r| r.workflow_id.clone()).collect();
        records.extend(
            self.store
                .list(None)
                .into_iter()
                .filter(|r| !resident.contains(&r.workflow_id)),
        );
        if let Some(s) = status {
            records.retain(|r| r.status == s);
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Cancel the workflow and, through it, every in-flight job it owns.
    pub fn cancel(&self, workflow_id: &str) -> Result<WorkflowRecord> {
        let entry = self
            .workflows
            .lock()
            .get(workflow_id)
            .cloned()
            .ok_or(OrcaError::NotFound {
                kind: "workflow",
                id: workflow_id.to_string(),
            })?;
        info!(workflow_id, "workflow cancellation requested");
        entry.cancel.cancel();
        let record = entry.record.lock().clone();
        Ok(record)
    }

    /// Wait for a workflow to reach a terminal status.
    pub async fn wait(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        loop {
            match self.get(workflow_id) {
                Some(record) if record.status.is_terminal() => return Some(record),
                Some(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                None => return None,
            }
        }
    }

    pub async fn shutdown(&self) {
        let entries: Vec<Arc<WorkflowEntry>> =
            self.workflows.lock().values().cloned().collect();
        for entry in &entries {
            entry.cancel.cancel();
        }
        for entry in entries {
            let handle = entry.handle.lock().take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    warn!(error = %e, "workflow task join failed during shutdown");
                }
            }
        }
        self.jobs.shutdown().await;
    }

    fn evict_completed(&self) {
        let mut workflows = self.workflows.lock();
        if workflows.len() <= MAX_RESIDENT_WORKFLOWS {
            return;
        }
        let mut terminal: Vec<(String, chrono::DateTime<chrono::Utc>)> = workflows
            .iter()
            .filter(|(_, e)| e.record.lock().status.is_terminal())
            .map(|(id, e)| (id.clone(), e.record.lock().created_at))
            .collect();
        terminal.sort_by_key(|(_, created)| *created);
        let excess = workflows.len().saturating_sub(MAX_RESIDENT_WORKFLOWS);
        for (id, _) in terminal.into_iter().take(excess) {
            workflows.remove(&id);
        }
    }
}

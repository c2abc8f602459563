//! Workspace model and registry.
//!
//! A workspace scopes quota limits and policy settings for a tenant.
//! Exactly one workspace `ws_default` always exists; the registry creates
//! it on first access. Records persist as
//! `workspaces/<workspace_id>/workspace.json`.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::atomic_write;
use crate::error::{OrcaError, Result};
use crate::schemas::CleanupPolicy;

pub const DEFAULT_WORKSPACE_ID: &str = "ws_default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    User,
    Team,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    #[default]
    Active,
    Suspended,
    Archived,
}

/// Hard resource caps for one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_concurrent_jobs: u32,
    pub max_concurrent_sandboxes: u32,
    pub max_job_duration_seconds: u64,
    pub max_cpu_per_job: f64,
    pub max_memory_per_job_mb: u64,
    pub max_artifacts_size_mb: u64,
    #[serde(default)]
    pub daily_job_limit: Option<u32>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            max_concurrent_sandboxes: 10,
            max_job_duration_seconds: 3600,
            max_cpu_per_job: 2.0,
            max_memory_per_job_mb: 2048,
            max_artifacts_size_mb: 512,
            daily_job_limit: None,
        }
    }
}

/// Per-workspace policy knobs merged into the global security policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    #[serde(default)]
    pub default_cleanup_policy: CleanupPolicy,
    /// Image globs allowed in this workspace (wins over the global allow-list).
    #[serde(default)]
    pub allowed_images: Vec<String>,
    /// Image globs denied in this workspace (unioned with the global deny-list).
    #[serde(default)]
    pub blocked_images: Vec<String>,
    #[serde(default = "default_max_job_timeout")]
    pub max_job_timeout: u64,
    /// Opt-in: run sandboxes with a read-only root filesystem.
    #[serde(default)]
    pub read_only_rootfs: bool,
}

fn default_max_job_timeout() -> u64 {
    3600
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            default_cleanup_policy: CleanupPolicy::default(),
            allowed_images: Vec::new(),
            blocked_images: Vec::new(),
            max_job_timeout: default_max_job_timeout(),
            read_only_rootfs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub owner_type: OwnerType,
    pub owner_id: String,
    #[serde(default)]
    pub settings: WorkspaceSettings,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Thread-safe registry backed by per-workspace JSON files.
pub struct WorkspaceRegistry {
    dir: PathBuf,
    cache: DashMap<String, Workspace>,
}

impl WorkspaceRegistry {
    /// Open the registry, loading every persisted workspace into the cache.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let registry = Self {
            dir: dir.into(),
            cache: DashMap::new(),
        };
        registry.load_all();
        registry
    }

    pub fn create(
        &self,
        name: impl Into<String>,
        owner_type: OwnerType,
        owner_id: impl Into<String>,
        settings: Option<WorkspaceSettings>,
        limits: Option<ResourceLimits>,
        workspace_id: Option<String>,
    ) -> Result<Workspace> {
        let id = workspace_id
            .unwrap_or_else(|| format!("ws_{}", &uuid::Uuid::new_v4().simple().to_string()[..16]));
        let name = name.into();
        let now = Utc::now();
        let ws = Workspace {
            id: id.clone(),
            name: name.clone(),
            owner_type,
            owner_id: owner_id.into(),
            settings: settings.unwrap_or_default(),
            limits: limits.unwrap_or_default(),
            status: WorkspaceStatus::Active,
            created_at: now,
            updated_at: now,
        };

        if self.cache.contains_key(&id) {
            return Err(OrcaError::AlreadyExists { kind: "workspace", id });
        }
        let name_taken = self
            .cache
            .iter()
            .any(|e| e.name == name && e.status != WorkspaceStatus::Archived);
        if name_taken {
            return Err(OrcaError::Validation(format!(
                "workspace name '{}' already in use",
                name
            )));
        }

        self.cache.insert(id.clone(), ws.clone());
        self.persist(&ws);
        Ok(ws)
    }

    pub fn get(&self, workspace_id: &str) -> Option<Workspace> {
        if let Some(ws) = self.cache.get(workspace_id) {
            return Some(ws.clone());
        }
        self.load_from_disk(workspace_id)
    }

    /// The default workspace, created on demand.
    pub fn get_default(&self) -> Workspace {
        if let Some(ws) = self.get(DEFAULT_WORKSPACE_ID) {
            return ws;
        }
        match self.create(
            "default",
            OwnerType::User,
            "system",
            None,
            None,
            Some(DEFAULT_WORKSPACE_ID.to_string()),
        ) {
            Ok(ws) => ws,
            // Raced with another creator: the record exists now.
            Err(_) => self
                .get(DEFAULT_WORKSPACE_ID)
                .expect("default workspace must exist after create race"),
        }
    }

    /// Workspace for a job submission: named workspace when it exists,
    /// otherwise the default.
    pub fn resolve(&self, workspace_id: &str) -> Workspace {
        if workspace_id == DEFAULT_WORKSPACE_ID {
            return self.get_default();
        }
        self.get(workspace_id).unwrap_or_else(|| self.get_default())
    }

    pub fn list(&self, status: Option<WorkspaceStatus>) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = self.cache.iter().map(|e| e.clone()).collect();
        if let Some(s) = status {
            all.retain(|w| w.status == s);
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub fn update(
        &self,
        workspace_id: &str,
        settings: Option<WorkspaceSettings>,
        limits: Option<ResourceLimits>,
        status: Option<WorkspaceStatus>,
    ) -> Result<Workspace> {
        let mut entry = self.cache.get_mut(workspace_id).ok_or(OrcaError::NotFound {
            kind: "workspace",
            id: workspace_id.to_string(),
        })?;
        if let Some(s) = settings {
            entry.settings = s;
        }
        if let Some(l) = limits {
            entry.limits = l;
        }
        if let Some(s) = status {
            entry.status = s;
        }
        entry.updated_at = Utc::now();
        let ws = entry.clone();
        drop(entry);
        self.persist(&ws);
        Ok(ws)
    }

    pub fn archive(&self, workspace_id: &str) -> bool {
        self.update(workspace_id, None, None, Some(WorkspaceStatus::Archived))
            .is_ok()
    }

    fn persist(&self, ws: &Workspace) {
        let path = self.dir.join(&ws.id).join("workspace.json");
        match serde_json::to_vec_pretty(ws) {
            Ok(bytes) => {
                if let Err(e) = atomic_write(&path, &bytes) {
                    warn!(workspace = %ws.id, error = %e, "failed to persist workspace");
                }
            }
            Err(e) => warn!(workspace = %ws.id, error = %e, "failed to serialize workspace"),
        }
    }

    fn load_from_disk(&self, workspace_id: &str) -> Option<Workspace> {
        let path = self.dir.join(workspace_id).join("workspace.json");
        let contents = std::fs::read_to_string(path).ok()?;
        let ws: Workspace = serde_json::from_str(&contents).ok()?;
        self.cache.insert(ws.id.clone(), ws.clone());
        Some(ws)
    }

    fn load_all(&self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path().join("workspace.json");
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<Workspace>(&contents) {
                Ok(ws) => {
                    self.cache.insert(ws.id.clone(), ws);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable workspace"),
            }
        }
    }
}

/// Point-in-time usage snapshot reported by the quota tracker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceUsage {
    pub workspace_id: String,
    pub running_jobs: u32,
    pub running_sandboxes: u32,
    pub jobs_today: u32,
}

/// Open metadata map helper: well-known keys are typed at the call sites,
/// everything else passes through untouched.
pub type Metadata = HashMap<String, serde_json::Value>;

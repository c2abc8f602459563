//! Append-only audit event stream.
//!
//! Events land in `audit/YYYY-MM-DD.jsonl` (local date). Appends hold a
//! process-wide writer lock and emit the whole line in a single write, so
//! concurrent writers never interleave partial lines. Reads scan files in
//! reverse chronological order.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Auditable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.denied")]
    JobDenied,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "workflow.created")]
    WorkflowCreated,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "policy.violated")]
    PolicyViolated,
    #[serde(rename = "auth.key_created")]
    AuthKeyCreated,
    #[serde(rename = "auth.denied")]
    AuthDenied,
    #[serde(rename = "workspace.created")]
    WorkspaceCreated,
    #[serde(rename = "workspace.updated")]
    WorkspaceUpdated,
    #[serde(rename = "workspace.archived")]
    WorkspaceArchived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub workspace_id: String,
    pub actor_type: String,
    pub actor_id: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub details: Value,
    pub outcome: AuditOutcome,
}

/// Serialized single-writer appender for audit events.
pub struct AuditLogger {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    /// Append one event. Failures are logged, never propagated: auditing
    /// must not take down the job path.
    pub fn log(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit event");
                return;
            }
        };
        let date = event.timestamp.with_timezone(&Local).format("%Y-%m-%d");
        let path = self.dir.join(format!("{}.jsonl", date));

        let _guard = self.lock.lock();
        let result = fs::create_dir_all(&self.dir).and_then(|_| {
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| f.write_all(format!("{}\n", line).as_bytes()))
        });
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "failed to append audit event");
        }
    }

    /// Build and append an event in one call.
    #[allow(clippy::too_many_arguments)]
    pub fn log_action(
        &self,
        workspace_id: &str,
        actor_type: &str,
        actor_id: &str,
        action: AuditAction,
        resource_type: &str,
        resource_id: &str,
        outcome: AuditOutcome,
        details: Value,
    ) -> AuditEvent {
        let event = AuditEvent {
            event_id: format!("evt_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            timestamp: Utc::now(),
            workspace_id: workspace_id.to_string(),
            actor_type: actor_type.to_string(),
            actor_id: actor_id.to_string(),
            action,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            details,
            outcome,
        };
        self.log(&event);
        event
    }
}

/// Filters for [`AuditStore::query`].
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub workspace_id: Option<String>,
    pub actor_id: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Self::default()
        }
    }
}

/// Read-side scanner over the audit files.
pub struct AuditStore {
    dir: PathBuf,
}

impl AuditStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Query events newest-first. Returns `(page, total_matching)`.
    pub fn query(&self, query: &AuditQuery) -> (Vec<AuditEvent>, usize) {
        let mut events = self.load_range(query.after, query.before);

        if let Some(ws) = &query.workspace_id {
            events.retain(|e| &e.workspace_id == ws);
        }
        if let Some(actor) = &query.actor_id {
            events.retain(|e| &e.actor_id == actor);
        }
        if let Some(action) = query.action {
            events.retain(|e| e.action == action);
        }
        if let Some(rt) = &query.resource_type {
            events.retain(|e| &e.resource_type == rt);
        }
        if let Some(after) = query.after {
            events.retain(|e| e.timestamp >= after);
        }
        if let Some(before) = query.before {
            events.retain(|e| e.timestamp <= before);
        }

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let total = events.len();
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        let page = events.into_iter().skip(query.offset).take(limit).collect();
        (page, total)
    }

    /// Delete audit files older than `days` local days. Returns the count.
    pub fn cleanup(&self, days: i64) -> usize {
        let cutoff = (Local::now() - chrono::Duration::days(days))
            .format("%Y-%m-%d")
            .to_string();
        let mut deleted = 0;
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(date_part) = name.strip_suffix(".jsonl") else {
                continue;
            };
            if date_part < cutoff.as_str() && fs::remove_file(entry.path()).is_ok() {
                deleted += 1;
            }
        }
        deleted
    }

    /// Load events from date files intersecting the range, newest file first.
    fn load_range(
        &self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Vec<AuditEvent> {
        let mut files: Vec<PathBuf> = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
                .collect(),
            Err(_) => return Vec::new(),
        };
        files.sort();
        files.reverse();

        let after_date = after.map(|t| t.with_timezone(&Local).format("%Y-%m-%d").to_string());
        let before_date = before.map(|t| t.with_timezone(&Local).format("%Y-%m-%d").to_string());

        let mut events = Vec::new();
        for path in files {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            if let Some(a) = &after_date {
                if stem.as_str() < a.as_str() {
                    continue;
                }
            }
            if let Some(b) = &before_date {
                if stem.as_str() > b.as_str() {
                    continue;
                }
            }
            let Ok(contents) = fs::read_to_string(&path) else {
                continue;
            };
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<AuditEvent>(line) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping bad audit line"),
                }
            }
        }
        events
    }
}

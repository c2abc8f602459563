//! Run record persistence.
//!
//! One directory per run under `<base>/artifacts/<job_id>/`: `run.json`
//! (atomic replace), `steps.jsonl` (streamed as steps finish), and any
//! extracted artifact files. Listing scans run directories; the rename
//! discipline guarantees a reader never sees a half-written record.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use globset::Glob;
use serde::{Deserialize, Serialize};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::atomic_write;
use crate::error::{OrcaError, Result};
use crate::schemas::{JobStatus, RunRecord, StepResult};

/// Filter set for [`RunStore::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    pub status: Option<JobStatus>,
    /// Glob matched against the spec image.
    pub image: Option<String>,
    /// Records must carry every listed tag.
    pub tags: Vec<String>,
    pub triggered_by: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub min_duration_seconds: Option<f64>,
    pub max_duration_seconds: Option<f64>,
    pub limit: usize,
    pub offset: usize,
}

impl RunFilter {
    pub fn new() -> Self {
        Self {
            limit: 50,
            ..Self::default()
        }
    }
}

/// Disk-backed store for run records and their artifacts.
#[derive(Debug, Clone)]
pub struct RunStore {
    artifacts_dir: PathBuf,
}

impl RunStore {
    pub fn new(artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
        }
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.artifacts_dir.join(job_id)
    }

    /// Atomically replace `run.json` for this record.
    pub fn put(&self, record: &RunRecord) -> Result<()> {
        let path = self.job_dir(&record.job_id).join("run.json");
        let bytes = serde_json::to_vec_pretty(record)?;
        // Disk-full and friends get one retry before surfacing.
        if let Err(first) = atomic_write(&path, &bytes) {
            warn!(job_id = %record.job_id, error = %first, "run record write failed, retrying once");
            atomic_write(&path, &bytes)?;
        }
        Ok(())
    }

    /// Append one step to `steps.jsonl` as it completes.
    pub fn append_step(&self, job_id: &str, step: &StepResult) -> Result<()> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir)?;
        let line = serde_json::to_string(step)?;
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("steps.jsonl"))?;
        f.write_all(format!("{}\n", line).as_bytes())?;
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<RunRecord> {
        let path = self.job_dir(job_id).join("run.json");
        let contents = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(job_id, error = %e, "unreadable run record");
                None
            }
        }
    }

    /// Steps streamed so far for a run.
    pub fn get_steps(&self, job_id: &str) -> Vec<StepResult> {
        let path = self.job_dir(job_id).join("steps.jsonl");
        let Ok(contents) = fs::read_to_string(path) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// List records matching the filter, newest first.
    /// Returns `(page, total_matching)`.
    pub fn list(&self, filter: &RunFilter) -> (Vec<RunRecord>, usize) {
        let image_glob = filter
            .image
            .as_deref()
            .and_then(|p| Glob::new(p).ok())
            .map(|g| g.compile_matcher());

        let mut records: Vec<RunRecord> = self
            .scan_all()
            .into_iter()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| {
                image_glob
                    .as_ref()
                    .map_or(true, |g| g.is_match(&r.spec.image))
            })
            .filter(|r| filter.tags.iter().all(|t| r.spec.tags.contains(t)))
            .filter(|r| {
                filter
                    .triggered_by
                    .as_deref()
                    .map_or(true, |t| r.spec.triggered_by.as_deref() == Some(t))
            })
            .filter(|r| filter.after.map_or(true, |a| r.created_at >= a))
            .filter(|r| filter.before.map_or(true, |b| r.created_at <= b))
            .filter(|r| {
                filter
                    .min_duration_seconds
                    .map_or(true, |min| r.duration_seconds() >= min)
            })
            .filter(|r| {
                filter
                    .max_duration_seconds
                    .map_or(true, |max| r.duration_seconds() <= max)
            })
            .collect();

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = records.len();
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
        let page = records.into_iter().skip(filter.offset).take(limit).collect();
        (page, total)
    }

    /// Remove a run directory and everything in it.
    pub fn delete(&self, job_id: &str) -> bool {
        let dir = self.job_dir(job_id);
        if !dir.is_dir() {
            return false;
        }
        fs::remove_dir_all(dir).is_ok()
    }

    /// Delete runs created before the cutoff. Returns deleted job ids.
    pub fn cleanup(&self, older_than: DateTime<Utc>) -> Vec<String> {
        let mut deleted = Vec::new();
        for record in self.scan_all() {
            if record.created_at < older_than && self.delete(&record.job_id) {
                deleted.push(record.job_id);
            }
        }
        deleted
    }

    /// Artifact files in a run directory (excludes the bookkeeping files).
    pub fn list_artifacts(&self, job_id: &str) -> Vec<PathBuf> {
        let dir = self.job_dir(job_id);
        WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                !matches!(
                    e.file_name().to_str(),
                    Some("run.json") | Some("steps.jsonl")
                )
            })
            .map(|e| e.into_path())
            .collect()
    }

    fn scan_all(&self) -> Vec<RunRecord> {
        let entries = match fs::read_dir(&self.artifacts_dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path().join("run.json");
                let contents = fs::read_to_string(path).ok()?;
                serde_json::from_str(&contents).ok()
            })
            .collect()
    }
}

/// Find run records that never reached a terminal status (a previous
/// process died mid-flight). Used by startup reconciliation.
pub fn find_non_terminal(store: &RunStore) -> Vec<RunRecord> {
    let (records, _) = store.list(&RunFilter {
        limit: 0,
        ..RunFilter::new()
    });
    records.into_iter().filter(|r| !r.status.is_terminal()).collect()
}

impl RunStore {
    /// Load a record, erroring instead of returning `None`.
    pub fn get_required(&self, job_id: &str) -> Result<RunRecord> {
        self.get(job_id).ok_or(OrcaError::NotFound {
            kind: "job",
            id: job_id.to_string(),
        })
    }
}

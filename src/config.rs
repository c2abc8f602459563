//! Base directory layout and process configuration.
//!
//! All persistent state lives under one configurable root (default
//! `~/.orcaops`):
//!
//! ```text
//! artifacts/<job_id>/run.json
//! artifacts/<job_id>/steps.jsonl
//! workflows/<workflow_id>/workflow.json
//! baselines.json
//! anomalies/YYYY-MM-DD.jsonl
//! audit/YYYY-MM-DD.jsonl
//! workspaces/<workspace_id>/workspace.json
//! ```
//!
//! Every writer in the crate uses write-temp-then-rename so readers never
//! observe a partially written document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Set to `1` to skip container backend probing at startup (test harnesses).
pub const SKIP_BACKEND_INIT_ENV: &str = "ORCAOPS_SKIP_BACKEND_INIT";

/// Resolved directory layout for one OrcaOps instance.
#[derive(Debug, Clone)]
pub struct OrcaPaths {
    base: PathBuf,
}

impl OrcaPaths {
    /// Layout rooted at an explicit base directory.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Default layout under `~/.orcaops` (falls back to CWD when the home
    /// directory cannot be resolved).
    pub fn default_home() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            base: home.join(".orcaops"),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.base.join("artifacts")
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.artifacts_dir().join(job_id)
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.base.join("workflows")
    }

    pub fn workflow_dir(&self, workflow_id: &str) -> PathBuf {
        self.workflows_dir().join(workflow_id)
    }

    pub fn baselines_path(&self) -> PathBuf {
        self.base.join("baselines.json")
    }

    pub fn anomalies_dir(&self) -> PathBuf {
        self.base.join("anomalies")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.base.join("audit")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.base.join("workspaces")
    }

    /// Create the top-level directories if missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.artifacts_dir(),
            self.workflows_dir(),
            self.anomalies_dir(),
            self.audit_dir(),
            self.workspaces_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Whether backend probing should be skipped for this process.
pub fn skip_backend_init() -> bool {
    std::env::var(SKIP_BACKEND_INIT_ENV).map(|v| v == "1").unwrap_or(false)
}

/// Write `contents` to `path` atomically: temp file in the same directory,
/// then rename over the destination.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent directory"))?;
    fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("write"),
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(contents)?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

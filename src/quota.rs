//! Workspace quota tracking.
//!
//! Process-wide counters of concurrent and daily usage per workspace.
//! Reservation is check-and-reserve under one lock: the limit check and the
//! increment are never separated, so concurrent submitters cannot both pass
//! a full quota.

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{OrcaError, Result};
use crate::workspace::{Workspace, WorkspaceUsage};

/// What kind of resource a reservation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationKind {
    Job,
    Sandbox,
}

#[derive(Debug, Default)]
struct WorkspaceCounters {
    running_jobs: FxHashSet<String>,
    running_sandboxes: FxHashSet<String>,
    jobs_today: u32,
    today: Option<NaiveDate>,
}

impl WorkspaceCounters {
    /// Reset the daily counter when a date change is observed.
    fn roll_date(&mut self, now: NaiveDate) {
        if self.today != Some(now) {
            self.today = Some(now);
            self.jobs_today = 0;
        }
    }
}

/// Thread-safe per-workspace usage tracker.
#[derive(Default)]
pub struct QuotaTracker {
    inner: Mutex<FxHashMap<String, WorkspaceCounters>>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically verify limits and reserve a slot for `resource_id`.
    /// On success the reservation is held until [`release`](Self::release).
    pub fn check_and_reserve(
        &self,
        workspace: &Workspace,
        kind: ReservationKind,
        resource_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let counters = inner.entry(workspace.id.clone()).or_default();
        counters.roll_date(Local::now().date_naive());

        match kind {
            ReservationKind::Job => {
                let current = counters.running_jobs.len() as u32;
                if current >= workspace.limits.max_concurrent_jobs {
                    return Err(OrcaError::QuotaExceeded(format!(
                        "concurrent job limit reached: {}/{}",
                        current, workspace.limits.max_concurrent_jobs
                    )));
                }
                if let Some(daily) = workspace.limits.daily_job_limit {
                    if counters.jobs_today >= daily {
                        return Err(OrcaError::QuotaExceeded(format!(
                            "daily job limit reached: {}/{}",
                            counters.jobs_today, daily
                        )));
                    }
                }
                counters.running_jobs.insert(resource_id.to_string());
                counters.jobs_today += 1;
            }
            ReservationKind::Sandbox => {
                let current = counters.running_sandboxes.len() as u32;
                if current >= workspace.limits.max_concurrent_sandboxes {
                    return Err(OrcaError::QuotaExceeded(format!(
                        "concurrent sandbox limit reached: {}/{}",
                        current, workspace.limits.max_concurrent_sandboxes
                    )));
                }
                counters.running_sandboxes.insert(resource_id.to_string());
            }
        }
        Ok(())
    }

    /// Release a reservation. Releasing an unknown id is a no-op, so a
    /// double release cannot underflow the counters.
    pub fn release(&self, workspace_id: &str, kind: ReservationKind, resource_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(counters) = inner.get_mut(workspace_id) {
            match kind {
                ReservationKind::Job => counters.running_jobs.remove(resource_id),
                ReservationKind::Sandbox => counters.running_sandboxes.remove(resource_id),
            };
        }
    }

    /// Current usage snapshot for a workspace.
    pub fn usage(&self, workspace_id: &str) -> WorkspaceUsage {
        let mut inner = self.inner.lock();
        let counters = inner.entry(workspace_id.to_string()).or_default();
        counters.roll_date(Local::now().date_naive());
        WorkspaceUsage {
            workspace_id: workspace_id.to_string(),
            running_jobs: counters.running_jobs.len() as u32,
            running_sandboxes: counters.running_sandboxes.len() as u32,
            jobs_today: counters.jobs_today,
        }
    }
}

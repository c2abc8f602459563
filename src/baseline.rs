//! Per-fingerprint performance baselines.
//!
//! Each `(image, commands)` fingerprint accumulates an exponential moving
//! average of duration, percentile estimates over a bounded ring of recent
//! samples, memory statistics, and success/failure counts. The store loads
//! at process start and is rewritten atomically after every update.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::anomaly::{AnomalyDetector, AnomalyRecord};
use crate::config::atomic_write;
use crate::schemas::{JobStatus, RunRecord};

/// EMA smoothing factor.
pub const EMA_ALPHA: f64 = 0.1;

/// Ring size for percentile estimation.
pub const RING_SIZE: usize = 100;

/// Accumulated statistics for one fingerprint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Baseline {
    pub samples: u64,
    pub duration_ema: f64,
    pub duration_stddev: f64,
    pub duration_p50: f64,
    pub duration_p95: f64,
    pub duration_p99: f64,
    pub memory_mean_mb: f64,
    pub memory_max_mb: f64,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// Ring of recent successful durations, newest last.
    #[serde(default)]
    pub recent_durations: Vec<f64>,
}

impl Baseline {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }

    fn push_duration(&mut self, duration: f64) {
        if self.recent_durations.len() >= RING_SIZE {
            self.recent_durations.remove(0);
        }
        self.recent_durations.push(duration);
        self.recompute_distribution();
    }

    /// Recompute p50/p95/p99 and the stddev estimate from the ring.
    fn recompute_distribution(&mut self) {
        let n = self.recent_durations.len();
        if n == 0 {
            return;
        }
        let mut sorted = self.recent_durations.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.duration_p50 = percentile(&sorted, 0.50);
        self.duration_p95 = percentile(&sorted, 0.95);
        self.duration_p99 = percentile(&sorted, 0.99);

        let mean = sorted.iter().sum::<f64>() / n as f64;
        let variance = sorted.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n as f64;
        self.duration_stddev = variance.sqrt();
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Tracks baselines keyed by fingerprint with per-key update serialization.
pub struct BaselineTracker {
    path: PathBuf,
    baselines: DashMap<String, Baseline>,
    detector: AnomalyDetector,
    save_lock: Mutex<()>,
}

impl BaselineTracker {
    /// Load the store from `path` (missing or corrupt files start empty).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let baselines = DashMap::new();
        if let Ok(contents) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<BTreeMap<String, Baseline>>(&contents) {
                Ok(map) => {
                    for (k, v) in map {
                        baselines.insert(k, v);
                    }
                }
                Err(e) => warn!(error = %e, "failed to parse baselines file, starting empty"),
            }
        }
        Self {
            path,
            baselines,
            detector: AnomalyDetector::new(),
            save_lock: Mutex::new(()),
        }
    }

    /// Fold one terminal run into its baseline and return anomalies detected
    /// against the pre-update statistics. Updates for the same fingerprint
    /// serialize on the map shard; different fingerprints proceed
    /// concurrently.
    pub fn update(&self, record: &RunRecord) -> Vec<AnomalyRecord> {
        if !record.status.is_terminal() || record.status == JobStatus::Cancelled {
            return Vec::new();
        }

        let duration = record.duration_seconds();
        let mut entry = self.baselines.entry(record.fingerprint.clone()).or_default();

        // Detect against what history said before this run folds in.
        let anomalies = self.detector.detect(record, entry.value());

        let baseline = entry.value_mut();
        baseline.samples += 1;
        match record.status {
            JobStatus::Success => baseline.success_count += 1,
            JobStatus::Failed | JobStatus::TimedOut => baseline.failure_count += 1,
            _ => {}
        }

        if record.status == JobStatus::Success && duration > 0.0 {
            if baseline.duration_ema <= 0.0 {
                baseline.duration_ema = duration;
            } else {
                baseline.duration_ema =
                    EMA_ALPHA * duration + (1.0 - EMA_ALPHA) * baseline.duration_ema;
            }
            baseline.push_duration(duration);
        }

        if let Some(usage) = &record.resource_usage {
            if usage.memory_peak_mb > 0.0 {
                if baseline.memory_max_mb < usage.memory_peak_mb {
                    baseline.memory_max_mb = usage.memory_peak_mb;
                }
                let n = baseline.samples as f64;
                baseline.memory_mean_mb =
                    baseline.memory_mean_mb + (usage.memory_peak_mb - baseline.memory_mean_mb) / n;
            }
        }
        baseline.last_updated = Some(Utc::now());
        drop(entry);

        debug!(fingerprint = %record.fingerprint, "baseline updated");
        self.save();
        anomalies
    }

    pub fn get(&self, fingerprint: &str) -> Option<Baseline> {
        self.baselines.get(fingerprint).map(|b| b.clone())
    }

    pub fn list(&self) -> BTreeMap<String, Baseline> {
        self.baselines
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn save(&self) {
        let _guard = self.save_lock.lock();
        let snapshot = self.list();
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = atomic_write(&self.path, &bytes) {
                    warn!(error = %e, "failed to persist baselines");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize baselines"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::{JobSpec, ResourceUsage};
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(status: JobStatus, duration_secs: i64) -> RunRecord {
        let spec = JobSpec::new("alpine:3.19", vec!["echo hi".into()], 60);
        let mut r = RunRecord::queued(spec);
        let start = Utc::now() - Duration::seconds(duration_secs);
        r.started_at = Some(start);
        r.finished_at = Some(start + Duration::seconds(duration_secs));
        r.status = status;
        r
    }

    #[test]
    fn first_success_seeds_ema() {
        let tmp = TempDir::new().unwrap();
        let tracker = BaselineTracker::new(tmp.path().join("baselines.json"));

        let r = record(JobStatus::Success, 10);
        tracker.update(&r);

        let b = tracker.get(&r.fingerprint).unwrap();
        assert_eq!(b.samples, 1);
        assert_eq!(b.success_count, 1);
        assert!((b.duration_ema - 10.0).abs() < 0.1);
        assert!((b.duration_p50 - 10.0).abs() < 0.1);
    }

    #[test]
    fn ema_smooths_subsequent_runs() {
        let tmp = TempDir::new().unwrap();
        let tracker = BaselineTracker::new(tmp.path().join("baselines.json"));

        tracker.update(&record(JobStatus::Success, 10));
        let r = record(JobStatus::Success, 20);
        tracker.update(&r);

        let b = tracker.get(&r.fingerprint).unwrap();
        // 0.1 * 20 + 0.9 * 10 = 11
        assert!((b.duration_ema - 11.0).abs() < 0.1);
        assert_eq!(b.samples, 2);
    }

    #[test]
    fn failures_count_without_touching_duration() {
        let tmp = TempDir::new().unwrap();
        let tracker = BaselineTracker::new(tmp.path().join("baselines.json"));

        tracker.update(&record(JobStatus::Success, 10));
        let r = record(JobStatus::Failed, 50);
        tracker.update(&r);

        let b = tracker.get(&r.fingerprint).unwrap();
        assert_eq!(b.failure_count, 1);
        assert_eq!(b.success_count, 1);
        assert!((b.duration_ema - 10.0).abs() < 0.1);
        assert!((b.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn cancelled_runs_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let tracker = BaselineTracker::new(tmp.path().join("baselines.json"));
        let r = record(JobStatus::Cancelled, 10);
        tracker.update(&r);
        assert!(tracker.get(&r.fingerprint).is_none());
    }

    #[test]
    fn percentiles_from_ring() {
        let mut b = Baseline::default();
        for i in 1..=100 {
            b.push_duration(i as f64);
        }
        assert!((b.duration_p50 - 50.0).abs() <= 1.0);
        assert!((b.duration_p95 - 95.0).abs() <= 1.0);
        assert!((b.duration_p99 - 99.0).abs() <= 1.0);
        assert!(b.duration_stddev > 0.0);
    }

    #[test]
    fn ring_is_bounded() {
        let mut b = Baseline::default();
        for i in 0..250 {
            b.push_duration(i as f64);
        }
        assert_eq!(b.recent_durations.len(), RING_SIZE);
        // Oldest entries rotated out
        assert!((b.recent_durations[0] - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn anomaly_emitted_after_min_samples() {
        let tmp = TempDir::new().unwrap();
        let tracker = BaselineTracker::new(tmp.path().join("baselines.json"));

        for _ in 0..3 {
            assert!(tracker.update(&record(JobStatus::Success, 10)).is_empty());
        }
        // 10x the baseline: critical duration anomaly
        let anomalies = tracker.update(&record(JobStatus::Success, 100));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, crate::anomaly::AnomalyType::Duration);
    }

    #[test]
    fn memory_stats_accumulate() {
        let tmp = TempDir::new().unwrap();
        let tracker = BaselineTracker::new(tmp.path().join("baselines.json"));

        let mut r = record(JobStatus::Success, 10);
        r.resource_usage = Some(ResourceUsage {
            memory_peak_mb: 100.0,
            ..ResourceUsage::default()
        });
        tracker.update(&r);

        let mut r2 = record(JobStatus::Success, 10);
        r2.resource_usage = Some(ResourceUsage {
            memory_peak_mb: 200.0,
            ..ResourceUsage::default()
        });
        tracker.update(&r2);

        let b = tracker.get(&r.fingerprint).unwrap();
        assert!((b.memory_max_mb - 200.0).abs() < f64::EPSILON);
        assert!((b.memory_mean_mb - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn persists_and_reloads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("baselines.json");
        let fingerprint;
        {
            let tracker = BaselineTracker::new(&path);
            let r = record(JobStatus::Success, 10);
            fingerprint = r.fingerprint.clone();
            tracker.update(&r);
        }
        let reloaded = BaselineTracker::new(&path);
        let b = reloaded.get(&fingerprint).unwrap();
        assert_eq!(b.samples, 1);
        assert!((b.duration_ema - 10.0).abs() < 0.1);
    }
}

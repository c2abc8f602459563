//! Anomaly detection against per-fingerprint baselines.
//!
//! Detection runs on completed jobs once a baseline has at least
//! `MIN_SAMPLES` observations. Detected anomalies are attached to the
//! terminating run record and appended to a date-partitioned JSONL stream.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::baseline::Baseline;
use crate::schemas::{JobStatus, RunRecord};

/// Baseline observations required before any detection fires.
pub const MIN_SAMPLES: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Duration,
    Memory,
    Flaky,
    SuccessRateDegradation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Warning,
    Critical,
}

/// Compact anomaly attached to a `RunRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub expected: String,
    pub actual: String,
    pub message: String,
}

/// Full anomaly record persisted to the anomaly stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub anomaly_id: String,
    pub job_id: String,
    /// Fingerprint of the baseline this anomaly was measured against.
    pub baseline_key: String,
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub description: String,
    pub expected: String,
    pub actual: String,
    #[serde(default)]
    pub z_score: Option<f64>,
    #[serde(default)]
    pub deviation_percent: Option<f64>,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

impl AnomalyRecord {
    /// Compact form for embedding in the run record.
    pub fn to_anomaly(&self) -> Anomaly {
        Anomaly {
            anomaly_type: self.anomaly_type,
            severity: self.severity,
            expected: self.expected.clone(),
            actual: self.actual.clone(),
            message: self.description.clone(),
        }
    }
}

fn new_anomaly_id() -> String {
    format!("anom_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

/// Stateless detector comparing one completed run against its baseline.
#[derive(Debug, Default)]
pub struct AnomalyDetector;

impl AnomalyDetector {
    pub fn new() -> Self {
        Self
    }

    /// Run every check. Empty until the baseline has `MIN_SAMPLES` runs.
    pub fn detect(&self, record: &RunRecord, baseline: &Baseline) -> Vec<AnomalyRecord> {
        let mut found = Vec::new();
        if baseline.samples < MIN_SAMPLES {
            return found;
        }

        if let Some(a) = self.check_duration(record, baseline) {
            found.push(a);
        }
        if let Some(a) = self.check_memory(record, baseline) {
            found.push(a);
        }
        if let Some(a) = self.check_flaky(record, baseline) {
            found.push(a);
        }
        if let Some(a) = self.check_success_rate(record, baseline) {
            found.push(a);
        }
        found
    }

    /// Duration deviation. Prefers a z-score when the baseline carries a
    /// usable stddev (|z| > 2 warning, |z| > 3 critical); otherwise falls
    /// back to the EMA ratio (>2x warning, >3x critical).
    fn check_duration(&self, record: &RunRecord, baseline: &Baseline) -> Option<AnomalyRecord> {
        if record.status != JobStatus::Success {
            return None;
        }
        let duration = record.duration_seconds();
        if duration <= 0.0 || baseline.duration_ema <= 0.0 {
            return None;
        }

        let (triggered, critical, z) = if baseline.duration_stddev > f64::EPSILON {
            let z = (duration - baseline.duration_ema) / baseline.duration_stddev;
            (z.abs() > 2.0, z.abs() > 3.0, Some(z))
        } else {
            let ratio = duration / baseline.duration_ema;
            (ratio > 2.0, ratio > 3.0, None)
        };
        if !triggered {
            return None;
        }

        let severity = if critical {
            AnomalySeverity::Critical
        } else {
            AnomalySeverity::Warning
        };
        let deviation =
            (duration - baseline.duration_ema) / baseline.duration_ema * 100.0;

        Some(AnomalyRecord {
            anomaly_id: new_anomaly_id(),
            job_id: record.job_id.clone(),
            baseline_key: record.fingerprint.clone(),
            anomaly_type: AnomalyType::Duration,
            severity,
            description: format!(
                "duration {:.1}s is {:.1}x the baseline ({:.1}s)",
                duration,
                duration / baseline.duration_ema,
                baseline.duration_ema
            ),
            expected: format!("{:.1}s", baseline.duration_ema),
            actual: format!("{:.1}s", duration),
            z_score: z.map(|v| (v * 100.0).round() / 100.0),
            deviation_percent: Some((deviation * 10.0).round() / 10.0),
            detected_at: Utc::now(),
            acknowledged: false,
        })
    }

    /// Memory peak above 1.5x the historical max warns, above 2x is critical.
    fn check_memory(&self, record: &RunRecord, baseline: &Baseline) -> Option<AnomalyRecord> {
        let usage = record.resource_usage.as_ref()?;
        if usage.memory_peak_mb <= 0.0 || baseline.memory_max_mb <= 0.0 {
            return None;
        }
        let ratio = usage.memory_peak_mb / baseline.memory_max_mb;
        if ratio <= 1.5 {
            return None;
        }
        let severity = if ratio > 2.0 {
            AnomalySeverity::Critical
        } else {
            AnomalySeverity::Warning
        };

        Some(AnomalyRecord {
            anomaly_id: new_anomaly_id(),
            job_id: record.job_id.clone(),
            baseline_key: record.fingerprint.clone(),
            anomaly_type: AnomalyType::Memory,
            severity,
            description: format!(
                "memory peak {:.0}MB is {:.1}x the baseline max ({:.0}MB)",
                usage.memory_peak_mb, ratio, baseline.memory_max_mb
            ),
            expected: format!("{:.0}MB", baseline.memory_max_mb),
            actual: format!("{:.0}MB", usage.memory_peak_mb),
            z_score: None,
            deviation_percent: Some(((ratio - 1.0) * 1000.0).round() / 10.0),
            detected_at: Utc::now(),
            acknowledged: false,
        })
    }

    /// Intermittent failure pattern: 10+ runs with success rate in [0.3, 0.9).
    fn check_flaky(&self, record: &RunRecord, baseline: &Baseline) -> Option<AnomalyRecord> {
        let total = baseline.success_count + baseline.failure_count;
        if total < 10 {
            return None;
        }
        let rate = baseline.success_rate();
        if !(0.3..0.9).contains(&rate) {
            return None;
        }

        Some(AnomalyRecord {
            anomaly_id: new_anomaly_id(),
            job_id: record.job_id.clone(),
            baseline_key: record.fingerprint.clone(),
            anomaly_type: AnomalyType::Flaky,
            severity: AnomalySeverity::Warning,
            description: format!(
                "success rate {:.0}% over {} runs indicates intermittent failures",
                rate * 100.0,
                total
            ),
            expected: ">=90% success rate".into(),
            actual: format!("{:.0}%", rate * 100.0),
            z_score: None,
            deviation_percent: None,
            detected_at: Utc::now(),
            acknowledged: false,
        })
    }

    /// Success rate below 0.8 with 5+ samples.
    fn check_success_rate(&self, record: &RunRecord, baseline: &Baseline) -> Option<AnomalyRecord> {
        let total = baseline.success_count + baseline.failure_count;
        if total < 5 {
            return None;
        }
        let rate = baseline.success_rate();
        if rate >= 0.8 {
            return None;
        }

        Some(AnomalyRecord {
            anomaly_id: new_anomaly_id(),
            job_id: record.job_id.clone(),
            baseline_key: record.fingerprint.clone(),
            anomaly_type: AnomalyType::SuccessRateDegradation,
            severity: AnomalySeverity::Critical,
            description: format!(
                "success rate has dropped to {:.0}% over {} runs",
                rate * 100.0,
                total
            ),
            expected: ">=80% success rate".into(),
            actual: format!("{:.0}%", rate * 100.0),
            z_score: None,
            deviation_percent: None,
            detected_at: Utc::now(),
            acknowledged: false,
        })
    }
}

/// Append-only JSONL store partitioned by local date.
pub struct AnomalyStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl AnomalyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    /// Append one anomaly; the whole line goes out in a single write.
    pub fn store(&self, record: &AnomalyRecord) {
        let _guard = self.lock.lock();
        let date = record.detected_at.with_timezone(&Local).format("%Y-%m-%d");
        let path = self.dir.join(format!("{}.jsonl", date));
        let line = match serde_json::to_string(record) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to serialize anomaly record");
                return;
            }
        };
        if let Err(e) = fs::create_dir_all(&self.dir).and_then(|_| {
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| f.write_all(format!("{}\n", line).as_bytes()))
        }) {
            warn!(error = %e, path = %path.display(), "failed to append anomaly record");
        }
    }

    /// Scan all files, newest date first.
    pub fn query(
        &self,
        anomaly_type: Option<AnomalyType>,
        severity: Option<AnomalySeverity>,
        job_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> (Vec<AnomalyRecord>, usize) {
        let mut records = self.scan_all();
        if let Some(t) = anomaly_type {
            records.retain(|r| r.anomaly_type == t);
        }
        if let Some(s) = severity {
            records.retain(|r| r.severity == s);
        }
        if let Some(id) = job_id {
            records.retain(|r| r.job_id == id);
        }
        records.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        let total = records.len();
        let page = records.into_iter().skip(offset).take(limit).collect();
        (page, total)
    }

    fn scan_all(&self) -> Vec<AnomalyRecord> {
        let mut records = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return records,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(contents) = fs::read_to_string(&path) else {
                continue;
            };
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                if let Ok(record) = serde_json::from_str::<AnomalyRecord>(line) {
                    records.push(record);
                }
            }
        }
        records
    }
}

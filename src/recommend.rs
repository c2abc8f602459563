//! Recommendations and aggregate metrics.
//!
//! The recommendation engine mines run history and baselines for
//! actionable improvements (image slimming, timeout right-sizing,
//! dependency caching, reliability). Metrics are computed on the fly from
//! the run store; nothing here keeps its own state.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::baseline::{Baseline, BaselineTracker};
use crate::run_store::{RunFilter, RunStore};
use crate::schemas::JobStatus;

static BLOATED_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(python:\d+\.\d+|node:\d+|ruby:\d+\.\d+|golang:\d+\.\d+)$").unwrap());

const CACHEABLE_COMMANDS: &[&str] = &[
    "pip install",
    "npm install",
    "npm ci",
    "yarn install",
    "apt-get install",
    "apk add",
    "cargo build",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    Performance,
    Cost,
    Reliability,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub recommendation_id: String,
    pub rec_type: RecommendationType,
    pub priority: RecommendationPriority,
    pub title: String,
    pub description: String,
    pub impact: String,
    pub action: String,
    #[serde(default)]
    pub evidence: Value,
}

fn new_rec_id() -> String {
    format!("rec_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

/// Generates recommendations from run history and baselines.
pub struct RecommendationEngine<'a> {
    store: &'a RunStore,
    baselines: &'a BaselineTracker,
}

impl<'a> RecommendationEngine<'a> {
    pub fn new(store: &'a RunStore, baselines: &'a BaselineTracker) -> Self {
        Self { store, baselines }
    }

    pub fn generate(&self, limit: usize) -> Vec<Recommendation> {
        let (records, _) = self.store.list(&RunFilter {
            limit: 0,
            ..RunFilter::new()
        });
        let baselines = self.baselines.list();

        let mut recs = Vec::new();
        recs.extend(self.image_optimization(&records));
        recs.extend(self.timeout_right_sizing(&baselines, &records));
        recs.extend(self.caching_opportunities(&records));
        recs.extend(self.reliability(&baselines));
        recs.sort_by(|a, b| b.priority.cmp(&a.priority));
        recs.truncate(limit);
        recs
    }

    /// Full-fat base images that have slim/alpine variants.
    fn image_optimization(&self, records: &[crate::schemas::RunRecord]) -> Vec<Recommendation> {
        let mut seen = std::collections::HashSet::new();
        let mut recs = Vec::new();
        for record in records {
            let image = &record.spec.image;
            if !seen.insert(image.clone()) {
                continue;
            }
            if BLOATED_IMAGE.is_match(image) {
                recs.push(Recommendation {
                    recommendation_id: new_rec_id(),
                    rec_type: RecommendationType::Cost,
                    priority: RecommendationPriority::Medium,
                    title: format!("Use a slim variant of {}", image),
                    description: format!(
                        "Image '{}' has slim/alpine variants that pull faster and use less disk.",
                        image
                    ),
                    impact: "Smaller images, faster pulls, lower storage cost.".into(),
                    action: format!("Replace '{}' with '{}-slim' or '{}-alpine'.", image, image, image),
                    evidence: json!({ "image": image }),
                });
            }
        }
        recs
    }

    /// Jobs whose observed p99 sits far below the TTL they request.
    fn timeout_right_sizing(
        &self,
        baselines: &BTreeMap<String, Baseline>,
        records: &[crate::schemas::RunRecord],
    ) -> Vec<Recommendation> {
        let mut recs = Vec::new();
        for (fingerprint, baseline) in baselines {
            if baseline.samples < 5 || baseline.duration_p99 <= 0.0 {
                continue;
            }
            let Some(ttl) = records
                .iter()
                .find(|r| &r.fingerprint == fingerprint)
                .map(|r| r.spec.ttl_seconds)
            else {
                continue;
            };
            if baseline.duration_p99 < ttl as f64 * 0.3 {
                let suggested = (baseline.duration_p99 * 2.0).ceil() as u64;
                recs.push(Recommendation {
                    recommendation_id: new_rec_id(),
                    rec_type: RecommendationType::Performance,
                    priority: RecommendationPriority::Low,
                    title: "Reduce job timeout".into(),
                    description: format!(
                        "p99 duration {:.1}s is well below the configured ttl of {}s.",
                        baseline.duration_p99, ttl
                    ),
                    impact: "Hung jobs fail faster.".into(),
                    action: format!("Set ttl_seconds to about {} (2x p99).", suggested),
                    evidence: json!({
                        "fingerprint": fingerprint,
                        "p99_seconds": baseline.duration_p99,
                        "current_ttl": ttl,
                        "suggested_ttl": suggested,
                    }),
                });
            }
        }
        recs
    }

    /// Repeated dependency installs that a cached layer would absorb.
    fn caching_opportunities(&self, records: &[crate::schemas::RunRecord]) -> Vec<Recommendation> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for record in records {
            for command in &record.spec.commands {
                for marker in CACHEABLE_COMMANDS {
                    if command.contains(marker) {
                        *counts.entry(marker).or_insert(0) += 1;
                    }
                }
            }
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count >= 3)
            .map(|(marker, count)| Recommendation {
                recommendation_id: new_rec_id(),
                rec_type: RecommendationType::Performance,
                priority: RecommendationPriority::Medium,
                title: format!("Cache '{}' results", marker),
                description: format!(
                    "'{}' ran in {} jobs; a pre-baked image would skip the repeated install.",
                    marker, count
                ),
                impact: "Shorter job durations, less registry traffic.".into(),
                action: "Bake dependencies into a custom image used by these jobs.".into(),
                evidence: json!({ "command": marker, "occurrences": count }),
            })
            .collect()
    }

    /// Unreliable fingerprints worth stabilizing. Anything under a 90%
    /// success rate qualifies, including jobs that almost always fail.
    fn reliability(&self, baselines: &BTreeMap<String, Baseline>) -> Vec<Recommendation> {
        let mut recs = Vec::new();
        for (fingerprint, baseline) in baselines {
            let total = baseline.success_count + baseline.failure_count;
            if total < 10 {
                continue;
            }
            let rate = baseline.success_rate();
            if rate < 0.9 {
                recs.push(Recommendation {
                    recommendation_id: new_rec_id(),
                    rec_type: RecommendationType::Reliability,
                    priority: RecommendationPriority::High,
                    title: "Stabilize a flaky job".into(),
                    description: format!(
                        "Jobs with this fingerprint succeed only {:.0}% of the time over {} runs.",
                        rate * 100.0,
                        total
                    ),
                    impact: "Fewer spurious failures and retries.".into(),
                    action: "Inspect recent failures for nondeterminism (timing, network, shared state)."
                        .into(),
                    evidence: json!({
                        "fingerprint": fingerprint,
                        "success_rate": rate,
                        "samples": total,
                    }),
                });
            }
        }
        recs
    }
}

/// Aggregate metrics over a run-store slice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_runs: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub timed_out_count: usize,
    pub cancelled_count: usize,
    pub success_rate: f64,
    pub avg_duration_seconds: f64,
    pub total_duration_seconds: f64,
    pub by_image: BTreeMap<String, ImageMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMetrics {
    pub count: usize,
    pub success: usize,
    pub failed: usize,
    pub avg_duration_seconds: f64,
}

/// Computes metrics on the fly; no separate storage.
pub struct MetricsAggregator<'a> {
    store: &'a RunStore,
}

impl<'a> MetricsAggregator<'a> {
    pub fn new(store: &'a RunStore) -> Self {
        Self { store }
    }

    pub fn compute(&self, filter: &RunFilter) -> Metrics {
        let (records, _) = self.store.list(filter);
        let mut metrics = Metrics {
            total_runs: records.len(),
            ..Metrics::default()
        };
        if records.is_empty() {
            return metrics;
        }

        let mut durations_by_image: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for record in &records {
            match record.status {
                JobStatus::Success => metrics.success_count += 1,
                JobStatus::Failed => metrics.failed_count += 1,
                JobStatus::TimedOut => metrics.timed_out_count += 1,
                JobStatus::Cancelled => metrics.cancelled_count += 1,
                _ => {}
            }
            let duration = record.duration_seconds();
            metrics.total_duration_seconds += duration;

            let entry = metrics.by_image.entry(record.spec.image.clone()).or_default();
            entry.count += 1;
            match record.status {
                JobStatus::Success => entry.success += 1,
                JobStatus::Failed => entry.failed += 1,
                _ => {}
            }
            if duration > 0.0 {
                durations_by_image
                    .entry(record.spec.image.clone())
                    .or_default()
                    .push(duration);
            }
        }

        metrics.success_rate = metrics.success_count as f64 / metrics.total_runs as f64;
        metrics.avg_duration_seconds = metrics.total_duration_seconds / metrics.total_runs as f64;
        for (image, durations) in durations_by_image {
            if let Some(entry) = metrics.by_image.get_mut(&image) {
                entry.avg_duration_seconds =
                    durations.iter().sum::<f64>() / durations.len() as f64;
            }
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::{JobSpec, RunRecord};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn seeded_store(tmp: &TempDir) -> RunStore {
        let store = RunStore::new(tmp.path().join("artifacts"));
        for (i, (image, status, secs)) in [
            ("python:3.12", JobStatus::Success, 5),
            ("python:3.12", JobStatus::Success, 6),
            ("python:3.12", JobStatus::Failed, 2),
            ("alpine:3.19", JobStatus::Success, 1),
        ]
        .iter()
        .enumerate()
        {
            let mut spec = JobSpec::new(*image, vec!["pip install -r reqs.txt".into()], 3600);
            spec.job_id = format!("m{}", i);
            let mut record = RunRecord::queued(spec);
            let start = Utc::now() - Duration::seconds(100);
            record.started_at = Some(start);
            record.finished_at = Some(start + Duration::seconds(*secs));
            record.status = *status;
            store.put(&record).unwrap();
        }
        store
    }

    #[test]
    fn metrics_aggregate_by_image() {
        let tmp = TempDir::new().unwrap();
        let store = seeded_store(&tmp);
        let metrics = MetricsAggregator::new(&store).compute(&RunFilter {
            limit: 0,
            ..RunFilter::new()
        });

        assert_eq!(metrics.total_runs, 4);
        assert_eq!(metrics.success_count, 3);
        assert_eq!(metrics.failed_count, 1);
        assert!((metrics.success_rate - 0.75).abs() < f64::EPSILON);

        let python = &metrics.by_image["python:3.12"];
        assert_eq!(python.count, 3);
        assert_eq!(python.success, 2);
        assert!(python.avg_duration_seconds > 0.0);
    }

    #[test]
    fn metrics_empty_store() {
        let tmp = TempDir::new().unwrap();
        let store = RunStore::new(tmp.path().join("artifacts"));
        let metrics = MetricsAggregator::new(&store).compute(&RunFilter::new());
        assert_eq!(metrics.total_runs, 0);
        assert_eq!(metrics.success_rate, 0.0);
    }

    #[test]
    fn recommends_slim_images_and_caching() {
        let tmp = TempDir::new().unwrap();
        let store = seeded_store(&tmp);
        let baselines = BaselineTracker::new(tmp.path().join("baselines.json"));

        let recs = RecommendationEngine::new(&store, &baselines).generate(50);
        assert!(recs.iter().any(|r| r.title.contains("slim variant of python:3.12")));
        assert!(recs
            .iter()
            .any(|r| r.rec_type == RecommendationType::Performance && r.title.contains("pip install")));
    }

    #[test]
    fn recommends_timeout_right_sizing() {
        let tmp = TempDir::new().unwrap();
        let store = seeded_store(&tmp);
        let baselines = BaselineTracker::new(tmp.path().join("baselines.json"));

        // Six fast successful runs against a 3600s ttl
        for i in 0..6 {
            let mut spec = JobSpec::new("python:3.12", vec!["pip install -r reqs.txt".into()], 3600);
            spec.job_id = format!("t{}", i);
            let mut record = RunRecord::queued(spec);
            let start = Utc::now() - Duration::seconds(50);
            record.started_at = Some(start);
            record.finished_at = Some(start + Duration::seconds(5));
            record.status = JobStatus::Success;
            store.put(&record).unwrap();
            baselines.update(&record);
        }

        let recs = RecommendationEngine::new(&store, &baselines).generate(50);
        let timeout_rec = recs.iter().find(|r| r.title == "Reduce job timeout").unwrap();
        assert!(timeout_rec.evidence["suggested_ttl"].as_u64().unwrap() < 100);
    }

    #[test]
    fn recommends_stabilizing_flaky_jobs() {
        let tmp = TempDir::new().unwrap();
        let store = RunStore::new(tmp.path().join("artifacts"));
        let baselines = BaselineTracker::new(tmp.path().join("baselines.json"));

        for i in 0..12 {
            let mut spec = JobSpec::new("alpine:3.19", vec!["./flaky-test.sh".into()], 60);
            spec.job_id = format!("f{}", i);
            let mut record = RunRecord::queued(spec);
            let start = Utc::now() - Duration::seconds(50);
            record.started_at = Some(start);
            record.finished_at = Some(start + Duration::seconds(3));
            record.status = if i % 2 == 0 {
                JobStatus::Success
            } else {
                JobStatus::Failed
            };
            baselines.update(&record);
        }

        let recs = RecommendationEngine::new(&store, &baselines).generate(50);
        let flaky = recs.iter().find(|r| r.title.contains("flaky")).unwrap();
        assert_eq!(flaky.priority, RecommendationPriority::High);
        assert_eq!(flaky.rec_type, RecommendationType::Reliability);
    }

    #[test]
    fn recommends_stabilizing_mostly_failing_jobs() {
        let tmp = TempDir::new().unwrap();
        let store = RunStore::new(tmp.path().join("artifacts"));
        let baselines = BaselineTracker::new(tmp.path().join("baselines.json"));

        // Succeeds 2 times out of 20: well below any flakiness band, but
        // still the kind of job most in need of a reliability fix
        for i in 0..20 {
            let mut spec = JobSpec::new("alpine:3.19", vec!["./broken-test.sh".into()], 60);
            spec.job_id = format!("b{}", i);
            let mut record = RunRecord::queued(spec);
            let start = Utc::now() - Duration::seconds(50);
            record.started_at = Some(start);
            record.finished_at = Some(start + Duration::seconds(3));
            record.status = if i < 2 {
                JobStatus::Success
            } else {
                JobStatus::Failed
            };
            baselines.update(&record);
        }

        let recs = RecommendationEngine::new(&store, &baselines).generate(50);
        let rec = recs
            .iter()
            .find(|r| r.rec_type == RecommendationType::Reliability)
            .unwrap();
        assert!((rec.evidence["success_rate"].as_f64().unwrap() - 0.1).abs() < 0.01);
        assert_eq!(rec.evidence["samples"].as_u64().unwrap(), 20);
    }
}

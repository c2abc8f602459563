//! End-to-end workflow tests against the mock backend.
//!
//! Covers level scheduling of a diamond DAG, condition gates, failure
//! handlers, matrix fan-out, service containers, cancellation, and the
//! workflow timeout.

use std::sync::Arc;
use std::time::Duration;

use orcaops::backend::MockBackend;
use orcaops::workflow_runner::WorkflowJobState;
use orcaops::{
    parse_workflow_yaml, JobManager, JobStatus, OrcaPaths, SecurityPolicy, WorkflowManager,
    WorkflowStatus,
};
use tempfile::TempDir;

// ============================================================================
// TEST HELPERS
// ============================================================================

async fn managers_at(tmp: &TempDir) -> (Arc<JobManager>, Arc<WorkflowManager>, Arc<MockBackend>) {
    let backend = Arc::new(MockBackend::new());
    let paths = OrcaPaths::new(tmp.path());
    let jobs = JobManager::new(backend.clone(), &paths, SecurityPolicy::default())
        .await
        .unwrap();
    let workflows = WorkflowManager::new(jobs.clone(), backend.clone(), &paths);
    (jobs, workflows, backend)
}

// ============================================================================
// DAG SCHEDULING
// ============================================================================

#[tokio::test]
async fn diamond_dag_runs_in_level_order() {
    let tmp = TempDir::new().unwrap();
    let (jobs, workflows, _) = managers_at(&tmp).await;

    let spec = parse_workflow_yaml(
        r#"
name: diamond
jobs:
  a:
    image: alpine:3.19
    commands: ["sleep 0.3"]
  b:
    image: alpine:3.19
    commands: ["sleep 0.5"]
    requires: [a]
  c:
    image: alpine:3.19
    commands: ["sleep 0.5"]
    requires: [a]
  d:
    image: alpine:3.19
    commands: ["echo done"]
    requires: [b, c]
"#,
    )
    .unwrap();

    workflows.submit(spec, Some("wf-diamond".into()), None).unwrap();
    let record = workflows.wait("wf-diamond").await.unwrap();

    assert_eq!(record.status, WorkflowStatus::Success);
    for name in ["a", "b", "c", "d"] {
        assert_eq!(record.job_statuses[name].status, WorkflowJobState::Success);
    }

    let run = |name: &str| jobs.get(&record.job_run_ids[name]).unwrap();
    let (a, b, c, d) = (run("a"), run("b"), run("c"), run("d"));

    // A completes before B and C start
    assert!(a.finished_at.unwrap() <= b.started_at.unwrap());
    assert!(a.finished_at.unwrap() <= c.started_at.unwrap());
    // B and C overlap in time
    assert!(b.started_at.unwrap() < c.finished_at.unwrap());
    assert!(c.started_at.unwrap() < b.finished_at.unwrap());
    // D starts only after both are terminal
    assert!(d.started_at.unwrap() >= b.finished_at.unwrap());
    assert!(d.started_at.unwrap() >= c.finished_at.unwrap());
}

#[tokio::test]
async fn cyclic_workflow_rejected_before_any_job() {
    let tmp = TempDir::new().unwrap();
    let (jobs, workflows, _) = managers_at(&tmp).await;

    let yaml = r#"
name: cyclic
jobs:
  a:
    image: alpine:3.19
    commands: ["echo a"]
    requires: [b]
  b:
    image: alpine:3.19
    commands: ["echo b"]
    requires: [a]
"#;
    assert!(parse_workflow_yaml(yaml).is_err());

    // Even an unvalidated spec object is rejected at submit
    let spec: orcaops::WorkflowSpec = serde_yaml::from_str(yaml).unwrap();
    assert!(workflows.submit(spec, Some("wf-cyclic".into()), None).is_err());
    assert!(jobs.list(None).is_empty());
}

// ============================================================================
// CONDITIONS AND ON_COMPLETE
// ============================================================================

#[tokio::test]
async fn condition_gate_skips_job_and_workflow_still_succeeds() {
    let tmp = TempDir::new().unwrap();
    let (_, workflows, _) = managers_at(&tmp).await;

    let spec = parse_workflow_yaml(
        r#"
name: gated
env:
  DEPLOY: "no"
jobs:
  build:
    image: alpine:3.19
    commands: ["echo build"]
  deploy:
    image: alpine:3.19
    commands: ["echo deploy"]
    requires: [build]
    if: "${{ jobs.build.status == 'success' and env.DEPLOY == 'yes' }}"
  verify:
    image: alpine:3.19
    commands: ["echo verify"]
    requires: [deploy]
"#,
    )
    .unwrap();

    workflows.submit(spec, Some("wf-gated".into()), None).unwrap();
    let record = workflows.wait("wf-gated").await.unwrap();

    assert_eq!(record.job_statuses["build"].status, WorkflowJobState::Success);
    assert_eq!(record.job_statuses["deploy"].status, WorkflowJobState::Skipped);
    // Skipped counts as success downstream: verify still runs
    assert_eq!(record.job_statuses["verify"].status, WorkflowJobState::Success);
    assert_eq!(record.status, WorkflowStatus::Success);
}

#[tokio::test]
async fn unless_condition_inverts_the_gate() {
    let tmp = TempDir::new().unwrap();
    let (_, workflows, _) = managers_at(&tmp).await;

    let spec = parse_workflow_yaml(
        r#"
name: unless
env:
  SKIP_TESTS: "yes"
jobs:
  test:
    image: alpine:3.19
    commands: ["echo testing"]
    unless: "${{ env.SKIP_TESTS == 'yes' }}"
"#,
    )
    .unwrap();

    workflows.submit(spec, Some("wf-unless".into()), None).unwrap();
    let record = workflows.wait("wf-unless").await.unwrap();
    assert_eq!(record.job_statuses["test"].status, WorkflowJobState::Skipped);
}

#[tokio::test]
async fn on_complete_failure_runs_only_after_upstream_failure() {
    let tmp = TempDir::new().unwrap();
    let (_, workflows, _) = managers_at(&tmp).await;

    let spec = parse_workflow_yaml(
        r#"
name: recovery
jobs:
  build:
    image: alpine:3.19
    commands: ["false"]
  cleanup:
    image: alpine:3.19
    commands: ["echo cleanup"]
    requires: [build]
    on_complete: failure
  notify:
    image: alpine:3.19
    commands: ["echo notify"]
    requires: [build]
    on_complete: always
  publish:
    image: alpine:3.19
    commands: ["echo publish"]
    requires: [build]
"#,
    )
    .unwrap();

    workflows.submit(spec, Some("wf-recovery".into()), None).unwrap();
    let record = workflows.wait("wf-recovery").await.unwrap();

    assert_eq!(record.job_statuses["build"].status, WorkflowJobState::Failed);
    assert_eq!(record.job_statuses["cleanup"].status, WorkflowJobState::Success);
    assert_eq!(record.job_statuses["notify"].status, WorkflowJobState::Success);
    // success-gated job never became eligible
    assert_eq!(record.job_statuses["publish"].status, WorkflowJobState::Cancelled);
    // mixed outcomes across branches
    assert_eq!(record.status, WorkflowStatus::Partial);
}

#[tokio::test]
async fn on_complete_failure_blocked_when_upstream_succeeds() {
    let tmp = TempDir::new().unwrap();
    let (_, workflows, _) = managers_at(&tmp).await;

    let spec = parse_workflow_yaml(
        r#"
name: no-recovery
jobs:
  build:
    image: alpine:3.19
    commands: ["echo ok"]
  rollback:
    image: alpine:3.19
    commands: ["echo rollback"]
    requires: [build]
    on_complete: failure
"#,
    )
    .unwrap();

    workflows.submit(spec, Some("wf-nr".into()), None).unwrap();
    let record = workflows.wait("wf-nr").await.unwrap();
    assert_eq!(record.job_statuses["build"].status, WorkflowJobState::Success);
    assert_eq!(record.job_statuses["rollback"].status, WorkflowJobState::Cancelled);
}

// ============================================================================
// MATRIX
// ============================================================================

#[tokio::test]
async fn matrix_fans_out_into_variant_jobs() {
    let tmp = TempDir::new().unwrap();
    let (jobs, workflows, backend) = managers_at(&tmp).await;

    let spec = parse_workflow_yaml(
        r#"
name: matrixed
jobs:
  test:
    image: "python:${{ matrix.python }}-slim"
    commands: ["echo testing ${{ matrix.python }}"]
    matrix:
      axes:
        python: ["3.11", "3.12"]
"#,
    )
    .unwrap();

    workflows.submit(spec, Some("wf-matrix".into()), None).unwrap();
    let record = workflows.wait("wf-matrix").await.unwrap();

    assert_eq!(record.status, WorkflowStatus::Success);
    assert_eq!(record.job_statuses.len(), 2);
    assert!(record.job_statuses.contains_key("test[python=3.11]"));
    assert!(record.job_statuses.contains_key("test[python=3.12]"));

    let pulled = backend.pulled_images();
    assert!(pulled.contains(&"python:3.11-slim".to_string()));
    assert!(pulled.contains(&"python:3.12-slim".to_string()));

    // each variant is an independent job with interpolated commands
    let run_id = &record.job_run_ids["test[python=3.12]"];
    let run = jobs.get(run_id).unwrap();
    assert_eq!(run.spec.commands, vec!["echo testing 3.12"]);
    assert_eq!(run.spec.env.get("MATRIX_PYTHON").map(String::as_str), Some("3.12"));
}

#[tokio::test]
async fn matrix_exclude_removes_variant() {
    let tmp = TempDir::new().unwrap();
    let (_, workflows, _) = managers_at(&tmp).await;

    let spec = parse_workflow_yaml(
        r#"
name: matrix-exclude
jobs:
  test:
    image: alpine:3.19
    commands: ["echo ${{ matrix.os }}-${{ matrix.arch }}"]
    matrix:
      axes:
        os: [linux, darwin]
        arch: [amd64, arm64]
      exclude:
        - os: darwin
          arch: amd64
"#,
    )
    .unwrap();

    workflows.submit(spec, Some("wf-mex".into()), None).unwrap();
    let record = workflows.wait("wf-mex").await.unwrap();
    assert_eq!(record.job_statuses.len(), 3);
    assert!(!record.job_statuses.contains_key("test[arch=amd64,os=darwin]"));
}

// ============================================================================
// SERVICES
// ============================================================================

#[tokio::test]
async fn services_start_inject_env_and_tear_down() {
    let tmp = TempDir::new().unwrap();
    let (jobs, workflows, backend) = managers_at(&tmp).await;

    let spec = parse_workflow_yaml(
        r#"
name: integration
jobs:
  test:
    image: python:3.12-slim
    commands: ["echo running tests"]
    services:
      postgres:
        image: postgres:15
        env:
          POSTGRES_PASSWORD: test
        port: 5432
        health_check: "pg_isready -U postgres"
"#,
    )
    .unwrap();

    workflows.submit(spec, Some("wf-svc".into()), None).unwrap();
    let record = workflows.wait("wf-svc").await.unwrap();
    assert_eq!(record.status, WorkflowStatus::Success);

    // the job saw the service endpoint env
    let run = jobs.get(&record.job_run_ids["test"]).unwrap();
    assert!(run.spec.env.get("POSTGRES_HOST").unwrap().contains("postgres"));
    assert_eq!(run.spec.env.get("POSTGRES_PORT").map(String::as_str), Some("5432"));

    // service containers and the network are gone afterwards
    assert!(backend.live_containers().is_empty());
    assert!(backend.networks().is_empty());
}

// ============================================================================
// CANCELLATION AND TIMEOUT
// ============================================================================

#[tokio::test]
async fn workflow_cancel_propagates_to_jobs() {
    let tmp = TempDir::new().unwrap();
    let (jobs, workflows, _) = managers_at(&tmp).await;

    let spec = parse_workflow_yaml(
        r#"
name: long
jobs:
  slow:
    image: alpine:3.19
    commands: ["sleep 30"]
    timeout: 60
"#,
    )
    .unwrap();

    workflows.submit(spec, Some("wf-cancel".into()), None).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    workflows.cancel("wf-cancel").unwrap();

    let record = workflows.wait("wf-cancel").await.unwrap();
    assert_eq!(record.status, WorkflowStatus::Cancelled);

    // the underlying job observed the cancellation too
    let run_id = &record.job_run_ids["slow"];
    let run = jobs.wait(run_id).await.unwrap();
    assert_eq!(run.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn workflow_timeout_fails_with_reason() {
    let tmp = TempDir::new().unwrap();
    let (_, workflows, _) = managers_at(&tmp).await;

    let spec = parse_workflow_yaml(
        r#"
name: too-slow
timeout: 1
jobs:
  slow:
    image: alpine:3.19
    commands: ["sleep 30"]
    timeout: 60
"#,
    )
    .unwrap();

    workflows.submit(spec, Some("wf-timeout".into()), None).unwrap();
    let record = workflows.wait("wf-timeout").await.unwrap();

    assert_eq!(record.status, WorkflowStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("workflow_timeout"));
}

// ============================================================================
// PERSISTENCE
// ============================================================================

#[tokio::test]
async fn workflow_record_persists_to_disk() {
    let tmp = TempDir::new().unwrap();
    let (_, workflows, _) = managers_at(&tmp).await;

    let spec = parse_workflow_yaml(
        r#"
name: persisted
jobs:
  only:
    image: alpine:3.19
    commands: ["echo hi"]
"#,
    )
    .unwrap();

    workflows.submit(spec, Some("wf-persist".into()), None).unwrap();
    workflows.wait("wf-persist").await.unwrap();

    let path = tmp
        .path()
        .join("workflows")
        .join("wf-persist")
        .join("workflow.json");
    let raw = std::fs::read_to_string(path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["workflow_id"], "wf-persist");
    assert_eq!(value["status"], "SUCCESS");
    assert_eq!(value["job_statuses"]["only"]["status"], "SUCCESS");

    // store fallback works once evicted from memory
    let from_store = workflows.store().get("wf-persist").unwrap();
    assert_eq!(from_store.status, WorkflowStatus::Success);
}

#[tokio::test]
async fn duplicate_workflow_id_rejected() {
    let tmp = TempDir::new().unwrap();
    let (_, workflows, _) = managers_at(&tmp).await;

    let yaml = r#"
name: dup
jobs:
  a:
    image: alpine:3.19
    commands: ["echo hi"]
"#;
    let spec = parse_workflow_yaml(yaml).unwrap();
    workflows.submit(spec.clone(), Some("wf-dup".into()), None).unwrap();
    assert!(workflows.submit(spec, Some("wf-dup".into()), None).is_err());
    workflows.wait("wf-dup").await.unwrap();
}

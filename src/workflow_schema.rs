//! Workflow spec types, YAML parsing, and DAG validation.
//!
//! A workflow is a named set of jobs with `requires` edges. Validation
//! rejects unknown references and cycles before anything executes;
//! scheduling metadata (levels) comes from a Kahn-style topological pass.
//! Matrix expansion and `${{ matrix.X }}` interpolation also live here.

use std::collections::BTreeMap;
use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condition::validate_condition;
use crate::schemas::CleanupPolicy;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowValidationError {
    #[error("workflow has no jobs")]
    Empty,
    #[error("job '{job}' requires unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },
    #[error("circular dependency detected involving: {0}")]
    Cycle(String),
    #[error("job '{job}' has an invalid condition: {reason}")]
    BadCondition { job: String, reason: String },
    #[error("job '{job}' is invalid: {reason}")]
    BadJob { job: String, reason: String },
}

/// When a job runs relative to its dependencies' outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnComplete {
    /// Run only when every required job succeeded.
    #[default]
    Success,
    /// Run only when at least one required job failed.
    Failure,
    /// Run once the required jobs are terminal, whatever their outcome.
    Always,
}

/// A dependency container started alongside a workflow job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Command exec'd inside the service container; exit 0 means healthy.
    #[serde(default)]
    pub health_check: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Matrix axis values accept any YAML scalar and normalize to strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct MatrixValue(pub String);

impl<'de> Deserialize<'de> for MatrixValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bool(bool),
            Int(i64),
            Float(f64),
            Str(String),
        }
        Ok(MatrixValue(match Repr::deserialize(deserializer)? {
            Repr::Bool(b) => b.to_string(),
            Repr::Int(i) => i.to_string(),
            Repr::Float(f) => f.to_string(),
            Repr::Str(s) => s,
        }))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixConfig {
    #[serde(default, alias = "parameters")]
    pub axes: BTreeMap<String, Vec<MatrixValue>>,
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, MatrixValue>>,
    #[serde(default)]
    pub include: Vec<BTreeMap<String, MatrixValue>>,
}

fn default_job_timeout() -> u64 {
    300
}

fn default_workflow_timeout() -> u64 {
    3600
}

/// One job inside a workflow. The job's name is its key in
/// [`WorkflowSpec::jobs`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub image: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    /// Declarative co-scheduling hint; validated but carries no extra
    /// edges (shared dependency levels already co-schedule these).
    #[serde(default)]
    pub parallel_with: Vec<String>,
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,
    #[serde(default, rename = "unless")]
    pub unless_condition: Option<String>,
    #[serde(default)]
    pub on_complete: OnComplete,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDefinition>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default = "default_job_timeout", alias = "timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub jobs: BTreeMap<String, WorkflowJob>,
    #[serde(default = "default_workflow_timeout", alias = "timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
}

/// Parse a workflow spec from YAML and validate it.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowSpec, crate::error::OrcaError> {
    let spec: WorkflowSpec = serde_yaml::from_str(yaml)?;
    validate_workflow(&spec)?;
    Ok(spec)
}

/// Structural validation: references, cycles, conditions, job shape.
pub fn validate_workflow(spec: &WorkflowSpec) -> Result<(), WorkflowValidationError> {
    if spec.jobs.is_empty() {
        return Err(WorkflowValidationError::Empty);
    }

    let names: FxHashSet<&str> = spec.jobs.keys().map(String::as_str).collect();
    for (name, job) in &spec.jobs {
        if job.commands.is_empty() {
            return Err(WorkflowValidationError::BadJob {
                job: name.clone(),
                reason: "commands must not be empty".into(),
            });
        }
        if job.image.trim().is_empty() {
            return Err(WorkflowValidationError::BadJob {
                job: name.clone(),
                reason: "image must not be empty".into(),
            });
        }
        for dep in job.requires.iter().chain(&job.parallel_with) {
            if !names.contains(dep.as_str()) {
                return Err(WorkflowValidationError::UnknownDependency {
                    job: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        for condition in [&job.if_condition, &job.unless_condition].into_iter().flatten() {
            validate_condition(condition).map_err(|e| WorkflowValidationError::BadCondition {
                job: name.clone(),
                reason: e.to_string(),
            })?;
        }
    }

    // Cycle check doubles as the level computation; discard the levels here.
    execution_levels(spec).map(|_| ())
}

/// Dependency levels: level 0 has no incoming edges; level k+1 contains
/// jobs whose requirements all sit in earlier levels. Errors on cycles.
pub fn execution_levels(
    spec: &WorkflowSpec,
) -> Result<Vec<Vec<String>>, WorkflowValidationError> {
    let mut in_degree: FxHashMap<&str, usize> = FxHashMap::default();
    let mut dependents: FxHashMap<&str, Vec<&str>> = FxHashMap::default();

    for (name, job) in &spec.jobs {
        in_degree.entry(name.as_str()).or_insert(0);
        for dep in &job.requires {
            *in_degree.entry(name.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&name, _)| name)
        .collect();
    ready.sort_unstable();

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut processed = 0usize;

    while !ready.is_empty() {
        levels.push(ready.iter().map(|s| s.to_string()).collect());
        let mut next: Vec<&str> = Vec::new();
        for name in ready.drain(..) {
            processed += 1;
            if let Some(children) = dependents.get(name) {
                for &child in children {
                    let deg = in_degree.get_mut(child).expect("child in degree map");
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(child);
                    }
                }
            }
        }
        next.sort_unstable();
        ready = next;
    }

    if processed != spec.jobs.len() {
        let stuck: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg > 0)
            .map(|(&name, _)| name)
            .collect();
        return Err(WorkflowValidationError::Cycle(stuck.join(", ")));
    }
    Ok(levels)
}

/// Expand a matrix into parameter combinations: Cartesian product of axes,
/// minus `exclude` entries, plus `include` entries. Empty axes expand to a
/// single identity variant.
pub fn expand_matrix(matrix: &MatrixConfig) -> Vec<BTreeMap<String, String>> {
    let mut combos: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
    for (axis, values) in &matrix.axes {
        let mut next = Vec::with_capacity(combos.len() * values.len().max(1));
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(axis.clone(), value.0.clone());
                next.push(extended);
            }
        }
        combos = next;
    }

    combos.retain(|combo| {
        !matrix.exclude.iter().any(|exc| {
            !exc.is_empty() && exc.iter().all(|(k, v)| combo.get(k) == Some(&v.0))
        })
    });

    for inc in &matrix.include {
        let as_combo: BTreeMap<String, String> =
            inc.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect();
        if !combos.contains(&as_combo) {
            combos.push(as_combo);
        }
    }
    combos
}

/// Deterministic key for one matrix combination (`k1=v1,k2=v2`).
pub fn matrix_key(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

static MATRIX_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\{\s*matrix\.([A-Za-z0-9_]+)\s*\}\}").unwrap());

/// Replace `${{ matrix.X }}` references; unknown axes stay literal.
pub fn interpolate_matrix(text: &str, params: &BTreeMap<String, String>) -> String {
    MATRIX_REF
        .replace_all(text, |caps: &regex::Captures| {
            params
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond_yaml() -> &'static str {
        r#"
name: diamond
env:
  CI: "true"
jobs:
  a:
    image: alpine:3.19
    commands: ["echo a"]
  b:
    image: alpine:3.19
    commands: ["echo b"]
    requires: [a]
  c:
    image: alpine:3.19
    commands: ["echo c"]
    requires: [a]
  d:
    image: alpine:3.19
    commands: ["echo d"]
    requires: [b, c]
timeout: 600
"#
    }

    #[test]
    fn parses_and_levels_diamond() {
        let spec = parse_workflow_yaml(diamond_yaml()).unwrap();
        assert_eq!(spec.name, "diamond");
        assert_eq!(spec.timeout_seconds, 600);
        assert_eq!(spec.env.get("CI").map(String::as_str), Some("true"));

        let levels = execution_levels(&spec).unwrap();
        assert_eq!(levels, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let yaml = r#"
name: bad
jobs:
  a:
    image: alpine:3.19
    commands: ["echo a"]
    requires: [ghost]
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown job 'ghost'"));
    }

    #[test]
    fn rejects_cycle_before_execution() {
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
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn rejects_empty_workflow_and_bad_jobs() {
        assert!(matches!(
            validate_workflow(&WorkflowSpec {
                name: "empty".into(),
                description: None,
                env: HashMap::new(),
                jobs: BTreeMap::new(),
                timeout_seconds: 60,
                cleanup_policy: CleanupPolicy::default(),
            }),
            Err(WorkflowValidationError::Empty)
        ));

        let yaml = r#"
name: nocommands
jobs:
  a:
    image: alpine:3.19
    commands: []
"#;
        assert!(parse_workflow_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_bad_condition_at_parse_time() {
        let yaml = r#"
name: badcond
jobs:
  a:
    image: alpine:3.19
    commands: ["echo a"]
    if: "${{ __import__('os') }}"
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("invalid condition"));
    }

    #[test]
    fn unreachable_jobs_are_allowed() {
        let yaml = r#"
name: island
jobs:
  a:
    image: alpine:3.19
    commands: ["echo a"]
  island:
    image: alpine:3.19
    commands: ["echo island"]
"#;
        let spec = parse_workflow_yaml(yaml).unwrap();
        let levels = execution_levels(&spec).unwrap();
        assert_eq!(levels, vec![vec!["a", "island"]]);
    }

    #[test]
    fn parallel_with_is_validated_but_adds_no_edges() {
        let yaml = r#"
name: hints
jobs:
  a:
    image: alpine:3.19
    commands: ["echo a"]
    parallel_with: [b]
  b:
    image: alpine:3.19
    commands: ["echo b"]
"#;
        let spec = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(execution_levels(&spec).unwrap().len(), 1);

        let yaml_bad = r#"
name: hints
jobs:
  a:
    image: alpine:3.19
    commands: ["echo a"]
    parallel_with: [ghost]
"#;
        assert!(parse_workflow_yaml(yaml_bad).is_err());
    }

    #[test]
    fn matrix_expansion_product_exclude_include() {
        let yaml = r#"
axes:
  python: ["3.11", "3.12"]
  os: [debian, alpine]
exclude:
  - python: "3.11"
    os: alpine
include:
  - python: "3.13"
    os: debian
"#;
        let matrix: MatrixConfig = serde_yaml::from_str(yaml).unwrap();
        let combos = expand_matrix(&matrix);
        // 2x2 = 4, minus 1 excluded, plus 1 included
        assert_eq!(combos.len(), 4);
        assert!(!combos.iter().any(|c| c.get("python") == Some(&"3.11".to_string())
            && c.get("os") == Some(&"alpine".to_string())));
        assert!(combos.iter().any(|c| c.get("python") == Some(&"3.13".to_string())));
    }

    #[test]
    fn matrix_numeric_scalars_normalize() {
        let yaml = r#"
axes:
  version: [1, 2.5, true]
"#;
        let matrix: MatrixConfig = serde_yaml::from_str(yaml).unwrap();
        let combos = expand_matrix(&matrix);
        let values: Vec<&str> = combos.iter().map(|c| c["version"].as_str()).collect();
        assert_eq!(values, vec!["1", "2.5", "true"]);
    }

    #[test]
    fn empty_matrix_is_identity() {
        let combos = expand_matrix(&MatrixConfig::default());
        assert_eq!(combos.len(), 1);
        assert!(combos[0].is_empty());
        assert_eq!(matrix_key(&combos[0]), "");
    }

    #[test]
    fn matrix_interpolation() {
        let mut params = BTreeMap::new();
        params.insert("python".to_string(), "3.12".to_string());

        assert_eq!(
            interpolate_matrix("python:${{ matrix.python }}-slim", &params),
            "python:3.12-slim"
        );
        assert_eq!(
            interpolate_matrix("pytest --py ${{matrix.python}}", &params),
            "pytest --py 3.12"
        );
        // Unknown axes stay literal
        assert_eq!(
            interpolate_matrix("${{ matrix.ghost }}", &params),
            "${{ matrix.ghost }}"
        );
    }

    #[test]
    fn matrix_key_is_sorted_and_stable() {
        let mut params = BTreeMap::new();
        params.insert("os".to_string(), "alpine".to_string());
        params.insert("python".to_string(), "3.12".to_string());
        assert_eq!(matrix_key(&params), "os=alpine,python=3.12");
    }

    #[test]
    fn services_shorthand_fields() {
        let yaml = r#"
name: with-services
jobs:
  test:
    image: python:3.12
    commands: ["pytest"]
    services:
      postgres:
        image: postgres:15
        env:
          POSTGRES_PASSWORD: test
        port: 5432
        health_check: "pg_isready -U postgres"
"#;
        let spec = parse_workflow_yaml(yaml).unwrap();
        let svc = &spec.jobs["test"].services["postgres"];
        assert_eq!(svc.image, "postgres:15");
        assert_eq!(svc.port, Some(5432));
        assert!(svc.health_check.as_deref().unwrap().contains("pg_isready"));
    }
}

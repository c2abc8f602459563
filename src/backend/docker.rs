//! Docker backend shelling out to the `docker` CLI.
//!
//! Keeps the integration surface to the CLI commands the trait needs; no
//! daemon SDK, no API version coupling. All subprocess work runs through
//! `tokio::process` with per-call timeouts.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{BackendError, ContainerBackend, CreateOptions, ExecOutput, ResourceSnapshot};

/// Ceiling for a single CLI invocation that is not an exec.
const CLI_TIMEOUT: Duration = Duration::from_secs(120);

/// Availability probe timeout.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Container backend built on the `docker` command-line client.
pub struct DockerCliBackend {
    cli_path: String,
}

impl Default for DockerCliBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCliBackend {
    pub fn new() -> Self {
        Self {
            cli_path: "docker".to_string(),
        }
    }

    pub fn with_cli_path(mut self, path: impl Into<String>) -> Self {
        self.cli_path = path.into();
        self
    }

    async fn run(&self, args: &[String], timeout: Duration) -> Result<ExecOutput, BackendError> {
        debug!(cli = %self.cli_path, ?args, "docker invocation");
        let child = Command::new(&self.cli_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BackendError::Unavailable(format!("failed to spawn {}: {}", self.cli_path, e))
            })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                BackendError::Transient(format!("docker {:?} timed out after {:?}", args, timeout))
            })?
            .map_err(BackendError::Io)?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1) as i64,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_ok(&self, args: &[String], timeout: Duration) -> Result<String, BackendError> {
        let out = self.run(args, timeout).await?;
        if out.exit_code != 0 {
            return Err(classify(&out.stderr));
        }
        Ok(out.stdout)
    }
}

/// Map docker CLI stderr to an error kind.
fn classify(stderr: &str) -> BackendError {
    let lower = stderr.to_lowercase();
    if lower.contains("no such image")
        || lower.contains("manifest unknown")
        || lower.contains("repository does not exist")
        || lower.contains("pull access denied")
    {
        BackendError::ImageNotFound(stderr.trim().to_string())
    } else if lower.contains("no such container") {
        BackendError::ContainerNotFound(stderr.trim().to_string())
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
    {
        BackendError::Unavailable(stderr.trim().to_string())
    } else if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("tls handshake")
        || lower.contains("temporary failure")
        || lower.contains("i/o timeout")
    {
        BackendError::Transient(stderr.trim().to_string())
    } else {
        BackendError::Other(stderr.trim().to_string())
    }
}

/// Quote a string for safe interpolation into `sh -c`. Wraps in single
/// quotes and escapes embedded single quotes, so glob metacharacters stay
/// literal to the outer shell and expand only where intended.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[async_trait]
impl ContainerBackend for DockerCliBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.run_ok(
            &["version".into(), "--format".into(), "{{.Server.Version}}".into()],
            PING_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    async fn pull(&self, image: &str) -> Result<(), BackendError> {
        self.run_ok(
            &["pull".into(), "--quiet".into(), image.to_string()],
            Duration::from_secs(600),
        )
        .await
        .map(|_| ())
    }

    async fn create(&self, opts: &CreateOptions) -> Result<String, BackendError> {
        let mut args: Vec<String> = vec!["create".into()];
        if let Some(name) = &opts.name {
            args.push("--name".into());
            args.push(name.clone());
        }
        if let Some(network) = &opts.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        for opt in &opts.security_opts {
            // Hardening entries arrive pre-formed: "cap-drop=ALL",
            // "security-opt=no-new-privileges", "read-only"
            match opt.split_once('=') {
                Some((flag, value)) => {
                    args.push(format!("--{}", flag));
                    args.push(value.to_string());
                }
                None => args.push(format!("--{}", opt)),
            }
        }
        for (k, v) in &opts.env {
            args.push("--env".into());
            args.push(format!("{}={}", k, v));
        }
        for (k, v) in &opts.labels {
            args.push("--label".into());
            args.push(format!("{}={}", k, v));
        }
        if let Some(cpus) = opts.cpu_limit {
            args.push("--cpus".into());
            args.push(format!("{}", cpus));
        }
        if let Some(mem) = opts.memory_limit_mb {
            args.push("--memory".into());
            args.push(format!("{}m", mem));
        }
        args.push(opts.image.clone());
        if opts.command.is_empty() {
            args.push("sleep".into());
            args.push("infinity".into());
        } else {
            args.extend(opts.command.iter().cloned());
        }

        let stdout = self.run_ok(&args, CLI_TIMEOUT).await?;
        Ok(stdout.trim().to_string())
    }

    async fn start(&self, container_id: &str) -> Result<(), BackendError> {
        self.run_ok(&["start".into(), container_id.to_string()], CLI_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput, BackendError> {
        let mut args: Vec<String> = vec!["exec".into(), container_id.to_string()];
        args.extend(cmd.iter().cloned());
        // No timeout here: step budgets are the runner's watchdog's job.
        self.run(&args, Duration::from_secs(24 * 3600)).await
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), BackendError> {
        self.run_ok(
            &[
                "stop".into(),
                "--time".into(),
                grace.as_secs().max(1).to_string(),
                container_id.to_string(),
            ],
            CLI_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), BackendError> {
        let mut args: Vec<String> = vec!["rm".into()];
        if force {
            args.push("--force".into());
        }
        args.push(container_id.to_string());
        self.run_ok(&args, CLI_TIMEOUT).await.map(|_| ())
    }

    async fn copy_from(
        &self,
        container_id: &str,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), BackendError> {
        self.run_ok(
            &[
                "cp".into(),
                format!("{}:{}", container_id, container_path),
                host_path.to_string_lossy().into_owned(),
            ],
            CLI_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    async fn stats(&self, container_id: &str) -> Result<ResourceSnapshot, BackendError> {
        let stdout = self
            .run_ok(
                &[
                    "stats".into(),
                    "--no-stream".into(),
                    "--format".into(),
                    "{{json .}}".into(),
                    container_id.to_string(),
                ],
                CLI_TIMEOUT,
            )
            .await?;
        Ok(parse_stats_line(stdout.trim()))
    }

    async fn image_digest(&self, image: &str) -> Result<Option<String>, BackendError> {
        let stdout = self
            .run_ok(
                &[
                    "image".into(),
                    "inspect".into(),
                    "--format".into(),
                    "{{if .RepoDigests}}{{index .RepoDigests 0}}{{end}}".into(),
                    image.to_string(),
                ],
                CLI_TIMEOUT,
            )
            .await?;
        let digest = stdout.trim();
        Ok(if digest.is_empty() {
            None
        } else {
            Some(digest.to_string())
        })
    }

    async fn create_network(&self, name: &str) -> Result<String, BackendError> {
        let stdout = self
            .run_ok(&["network".into(), "create".into(), name.to_string()], CLI_TIMEOUT)
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(stdout.trim().to_string())
    }

    async fn remove_network(&self, name: &str) -> Result<(), BackendError> {
        self.run_ok(&["network".into(), "rm".into(), name.to_string()], CLI_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|e| BackendError::Network(e.to_string()))
    }

    async fn connect(
        &self,
        container_id: &str,
        network: &str,
        aliases: &[String],
    ) -> Result<(), BackendError> {
        let mut args: Vec<String> = vec!["network".into(), "connect".into()];
        for alias in aliases {
            args.push("--alias".into());
            args.push(alias.clone());
        }
        args.push(network.to_string());
        args.push(container_id.to_string());
        self.run_ok(&args, CLI_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|e| BackendError::Network(e.to_string()))
    }

    async fn list_matching(
        &self,
        container_id: &str,
        pattern: &str,
    ) -> Result<Vec<String>, BackendError> {
        // The glob is quoted against the outer shell; `sh -c` expands it
        // inside the container only.
        let find = format!(
            "for p in {}; do [ -e \"$p\" ] && printf '%s\\n' \"$p\"; done",
            glob_word(pattern)
        );
        let out = self
            .exec(container_id, &["/bin/sh".into(), "-c".into(), find])
            .await?;
        if out.exit_code != 0 && !out.stderr.is_empty() {
            return Err(BackendError::ExecFailed(out.stderr.trim().to_string()));
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

/// Quote everything in the pattern except glob metacharacters, so `*`/`?`
/// still expand while spaces and shell syntax stay inert.
fn glob_word(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    for c in pattern.chars() {
        match c {
            '*' | '?' | '[' | ']' | '/' | '.' | '-' | '_' => out.push(c),
            c if c.is_ascii_alphanumeric() => out.push(c),
            c => {
                out.push('\\');
                out.push(c);
            }
        }
    }
    out
}

fn parse_stats_line(line: &str) -> ResourceSnapshot {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return ResourceSnapshot::default();
    };
    let mem_usage = value
        .get("MemUsage")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let net_io = value.get("NetIO").and_then(|v| v.as_str()).unwrap_or_default();
    let block_io = value
        .get("BlockIO")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    ResourceSnapshot {
        cpu_seconds: 0.0,
        memory_peak_mb: parse_size_mb(mem_usage.split('/').next().unwrap_or_default()),
        net_rx_bytes: parse_size_bytes(net_io.split('/').next().unwrap_or_default()),
        net_tx_bytes: parse_size_bytes(net_io.split('/').nth(1).unwrap_or_default()),
        disk_bytes: parse_size_bytes(block_io.split('/').next().unwrap_or_default()),
    }
}

/// Parse docker size strings like "12.5MiB", "1.2GB", "648kB".
fn parse_size_bytes(s: &str) -> u64 {
    let s = s.trim();
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num.trim().parse().unwrap_or(0.0);
    let multiplier: f64 = match unit.trim().to_lowercase().as_str() {
        "b" | "" => 1.0,
        "kb" => 1e3,
        "kib" => 1024.0,
        "mb" => 1e6,
        "mib" => 1024.0 * 1024.0,
        "gb" => 1e9,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * multiplier) as u64
}

fn parse_size_mb(s: &str) -> f64 {
    parse_size_bytes(s) as f64 / (1024.0 * 1024.0)
}

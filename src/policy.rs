//! Security policy engine.
//!
//! Validates `(image, commands)` pairs against a global policy merged with
//! workspace settings, and produces the container hardening vector. Merge
//! rules: the workspace allow-list wins when non-empty; deny-lists union.

use globset::Glob;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::schemas::JobSpec;
use crate::workspace::WorkspaceSettings;

/// Image admission rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImagePolicy {
    /// When non-empty, images must match at least one glob.
    #[serde(default)]
    pub allowed_images: Vec<String>,
    /// Images matching any glob are denied.
    #[serde(default)]
    pub blocked_images: Vec<String>,
    /// Require an `@sha256:` pinned reference.
    #[serde(default)]
    pub require_digest: bool,
}

/// Command admission rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandPolicy {
    /// Exact-match denied commands (whitespace-trimmed comparison).
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    /// Denied regex patterns; anchoring is the operator's choice.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

/// Global security policy, merged per-job with workspace settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default)]
    pub image_policy: ImagePolicy,
    #[serde(default)]
    pub command_policy: CommandPolicy,
}

/// Outcome of a policy check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyResult {
    pub allowed: bool,
    pub violations: Vec<String>,
    pub policy_name: &'static str,
}

impl PolicyResult {
    fn from_violations(violations: Vec<String>, policy_name: &'static str) -> Self {
        Self {
            allowed: violations.is_empty(),
            violations,
            policy_name,
        }
    }
}

/// Validates jobs against the merged policy view.
pub struct PolicyEngine {
    policy: SecurityPolicy,
    workspace: Option<WorkspaceSettings>,
}

impl PolicyEngine {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self {
            policy,
            workspace: None,
        }
    }

    /// Merge in workspace settings for the job under validation.
    pub fn for_workspace(&self, settings: &WorkspaceSettings) -> Self {
        Self {
            policy: self.policy.clone(),
            workspace: Some(settings.clone()),
        }
    }

    /// Check an image against blocked globs, the effective allow-list, and
    /// the digest requirement. Reports every violation for this image.
    pub fn validate_image(&self, image: &str) -> PolicyResult {
        let mut violations = Vec::new();

        let mut blocked: Vec<&str> =
            self.policy.image_policy.blocked_images.iter().map(String::as_str).collect();
        if let Some(ws) = &self.workspace {
            blocked.extend(ws.blocked_images.iter().map(String::as_str));
        }
        for pattern in blocked {
            if glob_matches(pattern, image) {
                violations.push(format!("image '{}' is blocked by pattern '{}'", image, pattern));
            }
        }

        // Workspace allow-list takes precedence over the global one.
        let allowed: &[String] = match &self.workspace {
            Some(ws) if !ws.allowed_images.is_empty() => &ws.allowed_images,
            _ => &self.policy.image_policy.allowed_images,
        };
        if !allowed.is_empty() && !allowed.iter().any(|p| glob_matches(p, image)) {
            violations.push(format!(
                "image '{}' not in allowed list: [{}]",
                image,
                allowed.join(", ")
            ));
        }

        if self.policy.image_policy.require_digest && !image.contains("@sha256:") {
            violations.push(format!("image '{}' must specify a digest (image@sha256:...)", image));
        }

        PolicyResult::from_violations(violations, "image_policy")
    }

    /// Check one command against exact blocks and blocked regexes.
    pub fn validate_command(&self, command: &str) -> PolicyResult {
        let mut violations = Vec::new();
        let cp = &self.policy.command_policy;

        for blocked in &cp.blocked_commands {
            if command.trim() == blocked.trim() {
                violations.push(format!("command matches blocked command: '{}'", blocked));
            }
        }

        for pattern in &cp.blocked_patterns {
            match Regex::new(pattern) {
                Ok(re) => {
                    if re.is_match(command) {
                        violations.push(format!("command matches blocked pattern: '{}'", pattern));
                    }
                }
                Err(e) => warn!(pattern, error = %e, "skipping invalid blocked pattern"),
            }
        }

        PolicyResult::from_violations(violations, "command_policy")
    }

    /// Validate an entire spec, short-circuiting on the first denial.
    pub fn validate_job(&self, spec: &JobSpec) -> PolicyResult {
        let image_result = self.validate_image(&spec.image);
        if !image_result.allowed {
            return PolicyResult::from_violations(image_result.violations, "job_validation");
        }
        for command in &spec.commands {
            let cmd_result = self.validate_command(command);
            if !cmd_result.allowed {
                return PolicyResult::from_violations(cmd_result.violations, "job_validation");
            }
        }
        PolicyResult::from_violations(Vec::new(), "job_validation")
    }

    /// Container hardening vector: drop all capabilities, forbid privilege
    /// escalation, and a read-only root filesystem only when the workspace
    /// opts in.
    pub fn container_security_opts(&self) -> Vec<String> {
        let mut opts = vec![
            "cap-drop=ALL".to_string(),
            "security-opt=no-new-privileges".to_string(),
        ];
        if self.workspace.as_ref().is_some_and(|ws| ws.read_only_rootfs) {
            opts.push("read-only".to_string());
        }
        opts
    }
}

/// Filename-style glob match; invalid patterns never match.
fn glob_matches(pattern: &str, value: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(value),
        Err(e) => {
            warn!(pattern, error = %e, "skipping invalid image glob");
            false
        }
    }
}

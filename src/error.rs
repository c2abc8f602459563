//! Unified error handling for the OrcaOps core.
//!
//! Each subsystem keeps its own focused error type (`BackendError`,
//! `WorkflowValidationError`, `ConditionError`); `OrcaError` is the
//! top-level wrapper callers of the managers see.

use thiserror::Error;

use crate::backend::BackendError;

/// Top-level error type for job and workflow operations.
#[derive(Error, Debug)]
pub enum OrcaError {
    /// Malformed spec rejected before admission.
    #[error("invalid spec: {0}")]
    Validation(String),

    /// Job rejected by the policy engine.
    #[error("policy violation: {}", violations.join("; "))]
    PolicyDenied { violations: Vec<String> },

    /// Workspace quota exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A job or workflow with this id is already registered.
    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },

    /// Lookup miss across memory and disk.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Container backend failure (after retries, where applicable).
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Workflow spec failed structural validation.
    #[error("{0}")]
    Workflow(#[from] crate::workflow_schema::WorkflowValidationError),

    /// Condition expression failed to parse.
    #[error("{0}")]
    Condition(#[from] crate::condition::ConditionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrcaError {
    pub fn validation(msg: impl Into<String>) -> Self {
        OrcaError::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        OrcaError::Internal(msg.into())
    }

    /// True for errors that reject a submission before any executor runs.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            OrcaError::Validation(_)
                | OrcaError::PolicyDenied { .. }
                | OrcaError::QuotaExceeded(_)
                | OrcaError::AlreadyExists { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrcaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_denied_joins_violations() {
        let err = OrcaError::PolicyDenied {
            violations: vec!["bad image".into(), "bad command".into()],
        };
        assert_eq!(err.to_string(), "policy violation: bad image; bad command");
        assert!(err.is_rejection());
    }

    #[test]
    fn already_exists_display() {
        let err = OrcaError::AlreadyExists {
            kind: "job",
            id: "j1".into(),
        };
        assert_eq!(err.to_string(), "job 'j1' already exists");
    }

    #[test]
    fn backend_errors_are_not_rejections() {
        let err = OrcaError::Backend(BackendError::ImageNotFound("x".into()));
        assert!(!err.is_rejection());
    }
}

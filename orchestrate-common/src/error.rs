use serde::{Deserialize, Serialize};

pub type Result<T, E = OrchestrateError> = std::result::Result<T, E>;

/// Machine-readable error category, persisted on failed Operations.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    InvalidState,
    UnknownStep,
    Pattern,
    PartialCreate,
    PartialDelete,
    Provider,
    Timeout,
    Store,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::UnknownStep => "unknown_step",
            ErrorKind::Pattern => "pattern",
            ErrorKind::PartialCreate => "partial_create",
            ErrorKind::PartialDelete => "partial_delete",
            ErrorKind::Provider => "provider",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Store => "store",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestrateError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unknown provisioning step '{0}'")]
    UnknownStep(String),

    /// A placeholder in a naming pattern had no value in the context.
    #[error("naming pattern token '{token}' cannot be resolved")]
    Pattern { token: String },

    /// Some per-size resources were created before one failed. `rolled_back` were
    /// deleted again; `leaked` could not be deleted and need manual cleanup.
    #[error(
        "size '{failed}' failed: {reason} (rolled back: [{}], leaked: [{}])",
        .rolled_back.join(", "),
        .leaked.join(", ")
    )]
    PartialCreate {
        failed: String,
        reason: String,
        rolled_back: Vec<String>,
        leaked: Vec<String>,
    },

    /// Best-effort deletion finished with failures; each entry is `<size>: <reason>`.
    #[error("{deleted} resource(s) deleted, failed: [{}]", .failed.join("; "))]
    PartialDelete { deleted: usize, failed: Vec<String> },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("store error: {0}")]
    Store(String),

    /// The task running an Operation ended without producing an outcome.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestrateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrateError::Validation(_) => ErrorKind::Validation,
            OrchestrateError::NotFound(_) => ErrorKind::NotFound,
            OrchestrateError::Conflict(_) => ErrorKind::Conflict,
            OrchestrateError::InvalidState(_) => ErrorKind::InvalidState,
            OrchestrateError::UnknownStep(_) => ErrorKind::UnknownStep,
            OrchestrateError::Pattern { .. } => ErrorKind::Pattern,
            OrchestrateError::PartialCreate { .. } => ErrorKind::PartialCreate,
            OrchestrateError::PartialDelete { .. } => ErrorKind::PartialDelete,
            OrchestrateError::Provider(_) => ErrorKind::Provider,
            OrchestrateError::Timeout(_) => ErrorKind::Timeout,
            OrchestrateError::Store(_) => ErrorKind::Store,
            OrchestrateError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Wrap a collaborator failure. Uses the alternate format so anyhow context chains survive.
    pub fn provider(err: impl std::fmt::Display) -> Self {
        OrchestrateError::Provider(format!("{:#}", err))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        OrchestrateError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        OrchestrateError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        OrchestrateError::Conflict(msg.into())
    }

    /// Append `note` to the message, keeping the kind. Structured variants carry it in
    /// their reason or failure list.
    pub fn with_note(self, note: &str) -> Self {
        match self {
            OrchestrateError::Validation(m) => OrchestrateError::Validation(format!("{}; {}", m, note)),
            OrchestrateError::NotFound(m) => OrchestrateError::NotFound(format!("{}; {}", m, note)),
            OrchestrateError::Conflict(m) => OrchestrateError::Conflict(format!("{}; {}", m, note)),
            OrchestrateError::InvalidState(m) => OrchestrateError::InvalidState(format!("{}; {}", m, note)),
            OrchestrateError::Provider(m) => OrchestrateError::Provider(format!("{}; {}", m, note)),
            OrchestrateError::Timeout(m) => OrchestrateError::Timeout(format!("{}; {}", m, note)),
            OrchestrateError::Store(m) => OrchestrateError::Store(format!("{}; {}", m, note)),
            OrchestrateError::Internal(m) => OrchestrateError::Internal(format!("{}; {}", m, note)),
            OrchestrateError::PartialCreate { failed, reason, rolled_back, leaked } => {
                OrchestrateError::PartialCreate {
                    failed,
                    reason: format!("{}; {}", reason, note),
                    rolled_back,
                    leaked,
                }
            }
            OrchestrateError::PartialDelete { deleted, mut failed } => {
                failed.push(note.to_string());
                OrchestrateError::PartialDelete { deleted, failed }
            }
            // These carry only a name; there is no message to extend.
            other @ (OrchestrateError::UnknownStep(_) | OrchestrateError::Pattern { .. }) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_create_message_lists_resources() {
        let err = OrchestrateError::PartialCreate {
            failed: "large".into(),
            reason: "quota exceeded".into(),
            rolled_back: vec!["vfx-small".into(), "vfx-medium".into()],
            leaked: vec![],
        };
        assert_eq!(err.kind(), ErrorKind::PartialCreate);
        assert_eq!(
            err.to_string(),
            "size 'large' failed: quota exceeded (rolled back: [vfx-small, vfx-medium], leaked: [])"
        );
    }

    #[test]
    fn note_keeps_the_kind() {
        let err = OrchestrateError::Timeout("step 'install_blender' (1/1)".into())
            .with_note("build instance b was not deleted: quota");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().ends_with("; build instance b was not deleted: quota"));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let v = serde_json::to_value(ErrorKind::UnknownStep).unwrap();
        assert_eq!(v, serde_json::json!("unknown_step"));
        assert_eq!(ErrorKind::UnknownStep.as_str(), "unknown_step");
    }
}

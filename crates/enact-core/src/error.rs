use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EnactError {
    #[error("not initialized: run 'enact init'")]
    NotInitialized,

    /// A connector was asked to run an action outside its allowlist. This is a
    /// caller bug and is the only error the executor lets through.
    #[error("action '{action}' not in {system} allowlist: {allowed:?}")]
    ActionNotAllowed {
        system: String,
        action: String,
        allowed: Vec<String>,
    },

    #[error("invalid arguments for {system}.{action}: {reason}")]
    InvalidArgs {
        system: String,
        action: String,
        reason: String,
    },

    #[error("unknown action for {system}: {action}")]
    UnknownAction { system: String, action: String },

    #[error("unknown workflow: {name}. Registered: {registered:?}")]
    UnknownWorkflow {
        name: String,
        registered: Vec<String>,
    },

    #[error("workflow '{workflow}' requires payload field '{field}'")]
    MissingPayloadField { workflow: String, field: String },

    #[error("invalid payload for workflow '{workflow}': {reason}")]
    InvalidPayload { workflow: String, reason: String },

    #[error("system not registered: {0}")]
    SystemNotFound(String),

    #[error("receipt not found: {0}")]
    ReceiptNotFound(Uuid),

    #[error("receipt signature is invalid: {0}")]
    InvalidSignature(Uuid),

    #[error("run {0} has already been rolled back")]
    AlreadyRolledBack(Uuid),

    #[error("run {0} is a rollback receipt and cannot itself be rolled back")]
    NotRollbackable(Uuid),

    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),

    #[error("connector setup failed for {system}: {reason}")]
    ConnectorSetup { system: String, reason: String },

    #[error("invalid signing secret: {0}")]
    InvalidSecret(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EnactError {
    pub fn not_allowed(system: &str, action: &str, allowed: Vec<String>) -> Self {
        Self::ActionNotAllowed {
            system: system.to_string(),
            action: action.to_string(),
            allowed,
        }
    }

    pub fn is_not_allowed(&self) -> bool {
        matches!(self, Self::ActionNotAllowed { .. })
    }
}

pub type Result<T> = std::result::Result<T, EnactError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_allowed_display_lists_allowlist() {
        let err = EnactError::not_allowed(
            "github",
            "merge_pr",
            vec!["create_branch".to_string(), "create_pr".to_string()],
        );
        assert_eq!(
            err.to_string(),
            "action 'merge_pr' not in github allowlist: [\"create_branch\", \"create_pr\"]"
        );
        assert!(err.is_not_allowed());
    }

    #[test]
    fn unknown_workflow_lists_registered() {
        let err = EnactError::UnknownWorkflow {
            name: "nope".to_string(),
            registered: vec!["fs_write_file".to_string()],
        };
        assert!(err.to_string().contains("nope"));
        assert!(err.to_string().contains("fs_write_file"));
        assert!(!err.is_not_allowed());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EnactError = io.into();
        assert!(matches!(err, EnactError::Io(_)));
    }
}

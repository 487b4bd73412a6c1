//! Supervisor error types. Each variant maps to a stable machine-readable
//! code so the editor host can decide how to present it.

/// Errors raised by the connection and run supervisors
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Language service unreachable: {0}")]
    ServiceUnreachable(String),

    #[error("Interpreter path '{0}' is relative but no workspace folder is open")]
    NoWorkspace(String),

    #[error("Failed to start '{program}': {reason}")]
    SpawnFailure { program: String, reason: String },

    #[error("No active editor.")]
    NoActiveEditor,

    #[error("Not a TSPMO file: {0}")]
    UnsupportedDocument(String),

    #[error("Failed to save '{path}': {reason}")]
    SaveFailed { path: String, reason: String },

    #[error("Language service is already starting")]
    AlreadyRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ServiceUnreachable(_) => "SERVICE_UNREACHABLE",
            Self::NoWorkspace(_) => "NO_WORKSPACE",
            Self::SpawnFailure { .. } => "SPAWN_FAILURE",
            Self::NoActiveEditor => "NO_ACTIVE_EDITOR",
            Self::UnsupportedDocument(_) => "UNSUPPORTED_DOCUMENT",
            Self::SaveFailed { .. } => "SAVE_FAILED",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// JSON rendering for hosts that forward errors over a wire
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SupervisorError::NoWorkspace("x".into()).error_code(), "NO_WORKSPACE");
        assert_eq!(
            SupervisorError::ServiceUnreachable("gone".into()).error_code(),
            "SERVICE_UNREACHABLE"
        );
        let spawn = SupervisorError::SpawnFailure {
            program: "python3".into(),
            reason: "not found".into(),
        };
        assert_eq!(spawn.error_code(), "SPAWN_FAILURE");
        assert_eq!(spawn.to_string(), "Failed to start 'python3': not found");
    }

    #[test]
    fn test_to_json() {
        let json = SupervisorError::NoActiveEditor.to_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "No active editor.");
        assert_eq!(json["error_code"], "NO_ACTIVE_EDITOR");
    }

    #[test]
    fn test_internal_from_anyhow() {
        let err: SupervisorError = anyhow::anyhow!("boom").into();
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
        assert_eq!(err.to_string(), "boom");
    }
}

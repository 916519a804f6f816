// Session errors and user-friendly error messages
//
// `SessionError` is what the orchestrator returns. Backend failures pass
// through untouched; everything else names the broken precondition.
// The helpers below turn common failures into actionable messages.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::session::SessionPhase;

/// Errors returned by the training session orchestrator
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {operation} while session is {actual}; expected {expected}")]
    OutOfOrder {
        operation: &'static str,
        expected: SessionPhase,
        actual: SessionPhase,
    },

    #[error("missing artifacts in {}: {}", .path.display(), .missing.join(", "))]
    MissingArtifacts { path: PathBuf, missing: Vec<String> },

    #[error(
        "optimizer covers {optimizer_params} parameters of model {optimizer_model}, \
         but model {model} has {trainable_params} trainable parameters"
    )]
    OptimizerMismatch {
        model: u64,
        trainable_params: u64,
        optimizer_model: u64,
        optimizer_params: u64,
    },

    #[error("scheduler is bound to optimizer {scheduler_optimizer}, not {optimizer}")]
    SchedulerMismatch {
        optimizer: u64,
        scheduler_optimizer: u64,
    },

    #[error("merged model still carries adapter modules: {}", .modules.join(", "))]
    ResidualAdapter { modules: Vec<String> },

    #[error("training dataset is empty")]
    EmptyDataset,

    #[error("failed to write session files: {0:#}")]
    Storage(anyhow::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl SessionError {
    /// True when the error came from the training backend itself
    pub fn is_backend(&self) -> bool {
        matches!(self, SessionError::Backend(_))
    }
}

/// Format a worker startup failure with helpful suggestions
pub fn worker_unavailable_error(program: &str, error: &str) -> String {
    format!(
        "Could not start training worker '{}'\n\n\
        \x1b[1;33mError:\x1b[0m {}\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • Python is not installed or not on PATH\n\
        • The worker package is not installed in the active environment\n\
        • Wrong [backend] program/args in config\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Check the interpreter:\n\
           \x1b[36m{} --version\x1b[0m\n\n\
        2. Check the worker responds:\n\
           \x1b[36mtunesmith doctor\x1b[0m",
        program, error, program
    )
}

/// Format a missing-weights error raised before merging
pub fn weights_missing_error(path: &str) -> String {
    format!(
        "No trained adapter found at {}\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • Training has not been run for this config\n\
        • Training failed before saving\n\
        • The config changed, so the experiment directory changed too\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. List the experiment paths:\n\
           \x1b[36mtunesmith paths\x1b[0m\n\n\
        2. Run the full pipeline:\n\
           \x1b[36mtunesmith run --dataset train.jsonl\x1b[0m",
        path
    )
}

/// Wrap a generic error with suggestions
pub fn wrap_error_with_suggestion(error: impl fmt::Display, suggestion: &str) -> String {
    format!(
        "{}\n\n\
        \x1b[1;33mSuggestion:\x1b[0m {}",
        error, suggestion
    )
}

/// Turn a session error into the message shown on the console
pub fn describe_session_error(error: &SessionError) -> String {
    match error {
        SessionError::MissingArtifacts { path, .. } => {
            format!("{}\n\n{}", error, weights_missing_error(&path.display().to_string()))
        }
        SessionError::OutOfOrder { .. } => wrap_error_with_suggestion(
            error,
            "phases run in order: load → inject → train → merge",
        ),
        _ => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_message() {
        let err = SessionError::OutOfOrder {
            operation: "merge",
            expected: SessionPhase::Trained,
            actual: SessionPhase::Loaded,
        };
        assert_eq!(
            err.to_string(),
            "cannot merge while session is loaded; expected trained"
        );
        assert!(describe_session_error(&err).contains("load → inject → train → merge"));
    }

    #[test]
    fn test_missing_artifacts_lists_files() {
        let err = SessionError::MissingArtifacts {
            path: PathBuf::from("/tmp/weights"),
            missing: vec!["adapter_config.json".to_string(), "tokenizer_config.json".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "missing artifacts in /tmp/weights: adapter_config.json, tokenizer_config.json"
        );
        assert!(describe_session_error(&err).contains("tunesmith paths"));
    }

    #[test]
    fn test_backend_errors_are_transparent() {
        let err = SessionError::from(anyhow::anyhow!("CUDA out of memory"));
        assert!(err.is_backend());
        assert_eq!(err.to_string(), "CUDA out of memory");
    }

    #[test]
    fn test_worker_unavailable_has_doctor_hint() {
        let msg = worker_unavailable_error("python3", "No such file or directory");
        assert!(msg.contains("tunesmith doctor"));
        assert!(msg.contains("python3 --version"));
    }
}

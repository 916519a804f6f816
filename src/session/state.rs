// Session lifecycle
//
// unloaded -> loaded -> injected -> trained -> merged
//
// Each state owns exactly the handles that are live in that phase, so moving
// to the next state hands ownership over instead of mutating shared fields.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::backend::{ModelHandle, OptimizerBinding, TokenizerHandle};

/// Observable phase of a training session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Unloaded,
    Loaded,
    Injected,
    Trained,
    Merged,
    /// A transition was interrupted by an error; handles are gone
    Failed,
    /// The backend has been shut down
    Closed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Unloaded => "unloaded",
            SessionPhase::Loaded => "loaded",
            SessionPhase::Injected => "injected",
            SessionPhase::Trained => "trained",
            SessionPhase::Merged => "merged",
            SessionPhase::Failed => "failed",
            SessionPhase::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub(crate) enum SessionState {
    Unloaded,
    Loaded {
        model: ModelHandle,
        tokenizer: TokenizerHandle,
    },
    Injected {
        model: ModelHandle,
        tokenizer: TokenizerHandle,
        optimizer: Option<OptimizerBinding>,
    },
    Trained {
        model: ModelHandle,
        tokenizer: TokenizerHandle,
        optimizer: Option<OptimizerBinding>,
    },
    Merged {
        model: ModelHandle,
        tokenizer: TokenizerHandle,
    },
    Failed,
    Closed,
}

impl SessionState {
    pub(crate) fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Unloaded => SessionPhase::Unloaded,
            SessionState::Loaded { .. } => SessionPhase::Loaded,
            SessionState::Injected { .. } => SessionPhase::Injected,
            SessionState::Trained { .. } => SessionPhase::Trained,
            SessionState::Merged { .. } => SessionPhase::Merged,
            SessionState::Failed => SessionPhase::Failed,
            SessionState::Closed => SessionPhase::Closed,
        }
    }

    pub(crate) fn model(&self) -> Option<&ModelHandle> {
        match self {
            SessionState::Loaded { model, .. }
            | SessionState::Injected { model, .. }
            | SessionState::Trained { model, .. }
            | SessionState::Merged { model, .. } => Some(model),
            SessionState::Unloaded | SessionState::Failed | SessionState::Closed => None,
        }
    }

    pub(crate) fn tokenizer(&self) -> Option<&TokenizerHandle> {
        match self {
            SessionState::Loaded { tokenizer, .. }
            | SessionState::Injected { tokenizer, .. }
            | SessionState::Trained { tokenizer, .. }
            | SessionState::Merged { tokenizer, .. } => Some(tokenizer),
            SessionState::Unloaded | SessionState::Failed | SessionState::Closed => None,
        }
    }

    pub(crate) fn optimizer(&self) -> Option<&OptimizerBinding> {
        match self {
            SessionState::Injected { optimizer, .. } | SessionState::Trained { optimizer, .. } => {
                optimizer.as_ref()
            }
            _ => None,
        }
    }
}

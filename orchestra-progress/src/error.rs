use thiserror::Error;

use crate::CompletionState;

/// Misuse of the progress reporting state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgressError {
    #[error("step '{0}' does not exist")]
    UnknownStep(String),

    #[error("cannot {operation} step '{step}' because it is {state}; only InProgress steps can be changed")]
    StepNotInProgress {
        step: String,
        state: CompletionState,
        operation: &'static str,
    },

    #[error("task '{task}' does not exist in step '{step}'")]
    UnknownTask { step: String, task: String },

    #[error("cannot {operation} task '{task}' because it is {state}; only InProgress tasks can be changed")]
    TaskNotInProgress {
        task: String,
        state: CompletionState,
        operation: &'static str,
    },

    #[error("{0} is not a completion state; use one of the Completed states")]
    InvalidCompletionState(CompletionState),

    #[error("interaction '{0}' does not exist or was already answered")]
    UnknownInteraction(String),

    #[error("invalid answer for input '{input}': {reason}")]
    InvalidAnswer { input: String, reason: String },

    #[error("interaction was cancelled")]
    Cancelled,
}

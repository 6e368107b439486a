use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// How far a step or task has come.
///
/// The variants are ordered by severity, so the worst of several states is
/// their maximum:
/// `InProgress < Completed < CompletedWithWarning < CompletedWithError`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CompletionState {
    #[default]
    InProgress,
    Completed,
    CompletedWithWarning,
    CompletedWithError,
}

impl CompletionState {
    pub fn is_complete(self) -> bool {
        self != CompletionState::InProgress
    }

    pub fn is_warning(self) -> bool {
        self == CompletionState::CompletedWithWarning
    }

    pub fn is_error(self) -> bool {
        self == CompletionState::CompletedWithError
    }

    /// The worst of `states`, or `None` if there are none.
    pub fn worst_of(states: impl IntoIterator<Item = CompletionState>) -> Option<CompletionState> {
        states.into_iter().max()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompletionState::InProgress => "InProgress",
            CompletionState::Completed => "Completed",
            CompletionState::CompletedWithWarning => "CompletedWithWarning",
            CompletionState::CompletedWithError => "CompletedWithError",
        }
    }
}

impl Display for CompletionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

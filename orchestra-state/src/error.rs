use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    /// The section was saved with a version that no longer matches the
    /// store's version for that path.
    #[error(
        "concurrency conflict in section '{section}': expected version {expected}, but the current version is {actual}; \
         acquire the section again before saving"
    )]
    Conflict {
        section: String,
        expected: u64,
        actual: u64,
    },

    /// An overlapping section, an ancestor or a descendant of this one, was
    /// saved or deleted after this section was acquired.
    #[error(
        "concurrency conflict in section '{section}': expected version {expected}, but overlapping section '{changed}' \
         was modified after it was acquired; acquire the section again before saving"
    )]
    OverlapConflict {
        section: String,
        expected: u64,
        changed: String,
    },

    /// All state was cleared after the section was acquired.
    #[error(
        "concurrency conflict in section '{section}': expected version {expected}, but the deployment state was \
         cleared after it was acquired; acquire the section again before saving"
    )]
    ClearedConflict { section: String, expected: u64 },

    #[error("invalid section name '{name}': {reason}")]
    InvalidSectionName { name: String, reason: &'static str },

    #[error("operation on deployment state was cancelled")]
    Cancelled,

    #[error("could not update state at '{pointer}': {message}")]
    Patch { pointer: String, message: String },

    #[error("state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is not valid: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("state storage failed: {0}")]
    Storage(String),
}

impl StateError {
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StateError::Conflict { .. }
                | StateError::OverlapConflict { .. }
                | StateError::ClearedConflict { .. }
        )
    }
}

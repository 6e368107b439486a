//! Activity records: the events a [`crate::ProgressReporter`] publishes for
//! consumers such as a terminal renderer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{interaction::InputDescriptor, CompletionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityKind {
    Step,
    Task,
    Log,
    PublishComplete,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityData {
    pub id: String,
    pub status_text: String,
    pub completion_state: CompletionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub is_complete: bool,
    pub is_error: bool,
    pub is_warning: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub enable_markdown: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputDescriptor>,
}

impl ActivityData {
    /// Data for `id` in `state`, with the completion flags derived from the
    /// state and everything optional left empty.
    pub fn new(id: impl Into<String>, status_text: impl Into<String>, state: CompletionState) -> Self {
        ActivityData {
            id: id.into(),
            status_text: status_text.into(),
            completion_state: state,
            step_id: None,
            is_complete: state.is_complete(),
            is_error: state.is_error(),
            is_warning: state.is_warning(),
            completion_message: None,
            log_level: None,
            title: None,
            timestamp: Utc::now(),
            enable_markdown: false,
            inputs: Vec::new(),
        }
    }
}

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub data: ActivityData,
}

/// The receiving end of a reporter's activities, in publication order.
///
/// The stream ends once the reporter and every step and task handle created
/// from it have been dropped.
pub struct ActivityStream {
    receiver: mpsc::UnboundedReceiver<ActivityRecord>,
}

impl ActivityStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<ActivityRecord>) -> Self {
        ActivityStream { receiver }
    }

    /// Wait for the next activity. `None` when the stream has ended.
    pub async fn next(&mut self) -> Option<ActivityRecord> {
        self.receiver.recv().await
    }

    /// The next activity, if one is already buffered.
    pub fn try_next(&mut self) -> Option<ActivityRecord> {
        self.receiver.try_recv().ok()
    }

    /// Everything buffered right now.
    pub fn drain(&mut self) -> Vec<ActivityRecord> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

//! Progress reporting for long-running orchestra commands.
//!
//! A run is divided into *steps*, and steps into *tasks*. Both move from
//! [`CompletionState::InProgress`] to exactly one of the completed states, and
//! every change is published as an [`ActivityRecord`] on the
//! [`ActivityStream`] returned by [`ProgressReporter::new`].
//!
//! Steps and tasks are completed implicitly when their handles are dropped: a
//! task as `Completed`, a step with the worst state of its tasks. A step that
//! reported an error through one of its tasks therefore ends as
//! `CompletedWithError` even if the caller forgot to complete it.
//!
//! Prompts ([`ProgressReporter::prompt`]) block the caller until a consumer of
//! the stream answers them with [`ProgressReporter::complete_interaction`].

pub mod activity;
pub mod completion;
pub mod error;
pub mod interaction;
pub mod reporter;

pub use activity::{ActivityData, ActivityKind, ActivityRecord, ActivityStream, LogLevel};
pub use completion::CompletionState;
pub use error::ProgressError;
pub use interaction::{InputDescriptor, InputKind, InputValue, Interaction, InteractionResponse};
pub use reporter::{ProgressReporter, ReportingStep, ReportingTask};

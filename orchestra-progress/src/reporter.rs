use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    activity::{ActivityData, ActivityKind, ActivityRecord, ActivityStream, LogLevel},
    interaction::{Interaction, InteractionResponse},
    CompletionState, ProgressError,
};

struct TaskRecord {
    id: String,
    status_text: String,
    state: CompletionState,
    completion_message: String,
}

struct StepRecord {
    id: String,
    title: String,
    state: CompletionState,
    completion_text: String,
    /// The step owns its tasks.
    tasks: Vec<TaskRecord>,
    /// Live `ReportingStep` and `ReportingTask` handles for this step. The
    /// record is retired once it is complete and no handle is left.
    handles: usize,
}

impl StepRecord {
    /// The worst state among the tasks. Without tasks, the step's own state
    /// if it is complete, and `Completed` otherwise.
    fn aggregated_state(&self) -> CompletionState {
        match CompletionState::worst_of(self.tasks.iter().map(|t| t.state)) {
            Some(worst) => worst,
            None if self.state.is_complete() => self.state,
            None => CompletionState::Completed,
        }
    }

    fn task_mut(&mut self, task_id: &str) -> Result<&mut TaskRecord, ProgressError> {
        let step = self.id.clone();
        self.tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| ProgressError::UnknownTask {
                step,
                task: task_id.to_owned(),
            })
    }

    fn check_in_progress(&self, operation: &'static str) -> Result<(), ProgressError> {
        if self.state.is_complete() {
            return Err(ProgressError::StepNotInProgress {
                step: self.id.clone(),
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    fn activity(&self) -> ActivityRecord {
        let status_text = if self.state.is_complete() {
            &self.completion_text
        } else {
            &self.title
        };
        ActivityRecord {
            kind: ActivityKind::Step,
            data: ActivityData::new(&self.id, status_text, self.state),
        }
    }
}

impl TaskRecord {
    fn activity(&self, step_id: &str) -> ActivityRecord {
        let mut data = ActivityData::new(&self.id, &self.status_text, self.state);
        data.step_id = Some(step_id.to_owned());
        if self.state.is_complete() {
            data.completion_message = Some(self.completion_message.clone());
        }
        ActivityRecord {
            kind: ActivityKind::Task,
            data,
        }
    }

    fn complete(&mut self, state: CompletionState, message: String) {
        self.state = state;
        self.completion_message = message;
    }
}

struct PendingInteraction {
    interaction: Interaction,
    step_id: Option<String>,
    respond: oneshot::Sender<InteractionResponse>,
}

#[derive(Default)]
struct Registry {
    steps: HashMap<String, StepRecord>,
    interactions: HashMap<String, PendingInteraction>,
    /// The worst state among retired steps.
    retired: Option<CompletionState>,
}

impl Registry {
    fn step(&self, step_id: &str) -> Result<&StepRecord, ProgressError> {
        self.steps
            .get(step_id)
            .ok_or_else(|| ProgressError::UnknownStep(step_id.to_owned()))
    }

    fn step_mut(&mut self, step_id: &str) -> Result<&mut StepRecord, ProgressError> {
        self.steps
            .get_mut(step_id)
            .ok_or_else(|| ProgressError::UnknownStep(step_id.to_owned()))
    }
}

struct Shared {
    registry: Mutex<Registry>,
    events: Option<mpsc::UnboundedSender<ActivityRecord>>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Disposal runs from `Drop`, which must not panic on a poisoned lock.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish `record`. Callers hold the registry lock, which keeps the
    /// stream in the same order as the state transitions.
    fn emit(&self, _registry: &Registry, record: ActivityRecord) {
        trace!(
            kind = ?record.kind,
            id = %record.data.id,
            state = %record.data.completion_state,
            "activity"
        );
        if let Some(events) = &self.events {
            if events.send(record).is_err() {
                trace!("activity stream closed; dropping activity");
            }
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn check_completion_state(state: CompletionState) -> Result<(), ProgressError> {
    if state.is_complete() {
        Ok(())
    } else {
        Err(ProgressError::InvalidCompletionState(state))
    }
}

/// Creates steps and tasks, enforces their state machine, and publishes an
/// [`ActivityRecord`] for every change.
///
/// Every explicit change to a step or task that is missing or no longer in
/// progress fails with a [`ProgressError`]. Disposal, including the implicit
/// disposal when a [`ReportingStep`] or [`ReportingTask`] is dropped, only
/// acts on entities that are still in progress and never fails.
#[derive(Clone)]
pub struct ProgressReporter {
    shared: Arc<Shared>,
}

impl ProgressReporter {
    pub fn new() -> (ProgressReporter, ActivityStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let reporter = ProgressReporter {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                events: Some(sender),
            }),
        };
        (reporter, ActivityStream::new(receiver))
    }

    /// A reporter without a stream, for non-interactive runs. The state
    /// machine is enforced as usual; activities are discarded.
    pub fn null() -> ProgressReporter {
        ProgressReporter {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                events: None,
            }),
        }
    }

    pub fn create_step(&self, title: impl Into<String>) -> ReportingStep {
        let record = StepRecord {
            id: new_id(),
            title: title.into(),
            state: CompletionState::InProgress,
            completion_text: String::new(),
            tasks: Vec::new(),
            handles: 1,
        };
        let id = record.id.clone();
        debug!(step = %id, title = %record.title, "step created");
        let mut registry = self.shared.registry();
        let activity = record.activity();
        registry.steps.insert(id.clone(), record);
        self.shared.emit(&registry, activity);
        ReportingStep {
            reporter: self.clone(),
            id,
        }
    }

    pub fn create_task(
        &self,
        step: &ReportingStep,
        status_text: impl Into<String>,
    ) -> Result<ReportingTask, ProgressError> {
        self.create_task_in(&step.id, status_text.into())
    }

    fn create_task_in(
        &self,
        step_id: &str,
        status_text: String,
    ) -> Result<ReportingTask, ProgressError> {
        let mut registry = self.shared.registry();
        let step = registry.step_mut(step_id)?;
        step.check_in_progress("create a task in")?;
        let record = TaskRecord {
            id: new_id(),
            status_text,
            state: CompletionState::InProgress,
            completion_message: String::new(),
        };
        let id = record.id.clone();
        let activity = record.activity(step_id);
        step.tasks.push(record);
        step.handles += 1;
        self.shared.emit(&registry, activity);
        Ok(ReportingTask {
            reporter: self.clone(),
            step_id: step_id.to_owned(),
            id,
        })
    }

    fn update_task(
        &self,
        step_id: &str,
        task_id: &str,
        status_text: String,
    ) -> Result<(), ProgressError> {
        let mut registry = self.shared.registry();
        let step = registry.step_mut(step_id)?;
        step.check_in_progress("update a task in")?;
        let task = step.task_mut(task_id)?;
        if task.state.is_complete() {
            return Err(ProgressError::TaskNotInProgress {
                task: task_id.to_owned(),
                state: task.state,
                operation: "update",
            });
        }
        task.status_text = status_text;
        let activity = task.activity(step_id);
        self.shared.emit(&registry, activity);
        Ok(())
    }

    fn complete_task(
        &self,
        step_id: &str,
        task_id: &str,
        state: CompletionState,
        message: Option<String>,
    ) -> Result<(), ProgressError> {
        check_completion_state(state)?;
        let mut registry = self.shared.registry();
        let step = registry.step_mut(step_id)?;
        step.check_in_progress("complete a task in")?;
        let task = step.task_mut(task_id)?;
        if task.state.is_complete() {
            return Err(ProgressError::TaskNotInProgress {
                task: task_id.to_owned(),
                state: task.state,
                operation: "complete",
            });
        }
        task.complete(state, message.unwrap_or_default());
        let activity = task.activity(step_id);
        self.shared.emit(&registry, activity);
        Ok(())
    }

    fn complete_step(
        &self,
        step_id: &str,
        completion_text: String,
        state: CompletionState,
    ) -> Result<(), ProgressError> {
        check_completion_state(state)?;
        let mut registry = self.shared.registry();
        let step = registry.step_mut(step_id)?;
        step.check_in_progress("complete")?;
        step.state = state;
        step.completion_text = completion_text;
        debug!(step = %step_id, state = %state, "step completed");
        let activity = step.activity();
        self.shared.emit(&registry, activity);
        Ok(())
    }

    fn log(
        &self,
        step_id: &str,
        level: LogLevel,
        message: String,
        enable_markdown: bool,
    ) -> Result<(), ProgressError> {
        let registry = self.shared.registry();
        registry.step(step_id)?.check_in_progress("log to")?;
        let mut data = ActivityData::new(new_id(), message, CompletionState::InProgress);
        data.step_id = Some(step_id.to_owned());
        data.log_level = Some(level);
        data.enable_markdown = enable_markdown;
        self.shared.emit(
            &registry,
            ActivityRecord {
                kind: ActivityKind::Log,
                data,
            },
        );
        Ok(())
    }

    fn dispose_task(&self, step_id: &str, task_id: &str) {
        let mut registry = self.shared.registry();
        let Some(step) = registry.steps.get_mut(step_id) else {
            return;
        };
        let Ok(task) = step.task_mut(task_id) else {
            return;
        };
        if task.state.is_complete() {
            return;
        }
        let message = task.status_text.clone();
        task.complete(CompletionState::Completed, message);
        let activity = task.activity(step_id);
        self.shared.emit(&registry, activity);
    }

    fn dispose_step(&self, step_id: &str) {
        let mut registry = self.shared.registry();
        let Some(step) = registry.steps.get_mut(step_id) else {
            return;
        };
        if step.state.is_complete() {
            return;
        }
        let mut activities = Vec::new();
        for task in step.tasks.iter_mut().filter(|t| !t.state.is_complete()) {
            let message = task.status_text.clone();
            task.complete(CompletionState::Completed, message);
            activities.push(task.activity(step_id));
        }
        step.state = step.aggregated_state();
        step.completion_text = step.title.clone();
        debug!(step = %step_id, state = %step.state, "step disposed");
        activities.push(step.activity());
        for activity in activities {
            self.shared.emit(&registry, activity);
        }
    }

    /// Called when a handle to the step goes away.
    fn release_step(&self, step_id: &str) {
        let mut registry = self.shared.registry();
        let Some(step) = registry.steps.get_mut(step_id) else {
            return;
        };
        step.handles = step.handles.saturating_sub(1);
        if step.handles > 0 || !step.state.is_complete() {
            return;
        }
        if let Some(step) = registry.steps.remove(step_id) {
            trace!(step = %step_id, state = %step.state, "step retired");
            let retired = registry.retired.into_iter().chain([step.state]);
            registry.retired = CompletionState::worst_of(retired);
        }
    }

    #[cfg(test)]
    fn step_count(&self) -> usize {
        self.shared.registry().steps.len()
    }

    fn step_state(&self, step_id: &str) -> Option<CompletionState> {
        self.shared.registry().steps.get(step_id).map(|s| s.state)
    }

    fn task_state(&self, step_id: &str, task_id: &str) -> Option<CompletionState> {
        self.shared
            .registry()
            .steps
            .get(step_id)?
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .map(|t| t.state)
    }

    /// The worst state across all steps created so far, including retired
    /// ones; `Completed` if there are none.
    pub fn aggregated_completion_state(&self) -> CompletionState {
        let registry = self.shared.registry();
        let live = registry.steps.values().map(|s| s.state);
        CompletionState::worst_of(live.chain(registry.retired))
            .unwrap_or(CompletionState::Completed)
    }

    /// Announce the end of the whole run.
    ///
    /// `state` defaults to [`aggregated_completion_state`](Self::aggregated_completion_state).
    /// Without a `message`, the status text is a fixed phrase for the state.
    /// Returns the state that was reported.
    pub fn complete_publish(
        &self,
        message: Option<&str>,
        state: Option<CompletionState>,
        is_deploy: bool,
    ) -> CompletionState {
        let state = state.unwrap_or_else(|| self.aggregated_completion_state());
        let status_text = match message {
            Some(message) => message.to_owned(),
            None => {
                let operation = if is_deploy { "Deployment" } else { "Publishing" };
                let outcome = match state {
                    CompletionState::CompletedWithError => "completed with errors",
                    CompletionState::CompletedWithWarning => "completed with warnings",
                    CompletionState::InProgress | CompletionState::Completed => {
                        "completed successfully"
                    }
                };
                format!("{} {}", operation, outcome)
            }
        };
        let mut data = ActivityData::new("publish-complete", status_text, state);
        // Marks the end of the run even if someone passed InProgress.
        data.is_complete = true;
        let registry = self.shared.registry();
        self.shared.emit(
            &registry,
            ActivityRecord {
                kind: ActivityKind::PublishComplete,
                data,
            },
        );
        state
    }

    /// Ask a question and wait for [`complete_interaction`](Self::complete_interaction).
    ///
    /// The prompt activity carries the interaction id in `data.id`. When
    /// `cancel` fires first, the interaction is withdrawn and
    /// [`ProgressError::Cancelled`] is returned. Dropping the future before
    /// the answer arrives withdraws the interaction as well.
    pub async fn prompt(
        &self,
        step: Option<&ReportingStep>,
        interaction: Interaction,
        cancel: &CancellationToken,
    ) -> Result<InteractionResponse, ProgressError> {
        let id = new_id();
        let receiver = {
            let mut registry = self.shared.registry();
            let step_id = match step {
                Some(step) => {
                    registry.step(&step.id)?.check_in_progress("prompt in")?;
                    Some(step.id.clone())
                }
                None => None,
            };
            let mut data =
                ActivityData::new(&id, &interaction.message, CompletionState::InProgress);
            data.step_id = step_id.clone();
            data.title = Some(interaction.title.clone());
            data.enable_markdown = interaction.enable_markdown;
            data.inputs = interaction.inputs.clone();
            let (respond, receiver) = oneshot::channel();
            registry.interactions.insert(
                id.clone(),
                PendingInteraction {
                    interaction,
                    step_id,
                    respond,
                },
            );
            self.shared.emit(
                &registry,
                ActivityRecord {
                    kind: ActivityKind::Prompt,
                    data,
                },
            );
            receiver
        };

        let mut pending = PendingPrompt {
            reporter: self,
            id: &id,
            answered: false,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProgressError::Cancelled),
            response = receiver => {
                pending.answered = true;
                response.map_err(|_| ProgressError::Cancelled)
            }
        }
    }

    fn withdraw_interaction(&self, id: &str) {
        let mut registry = self.shared.registry();
        if let Some(pending) = registry.interactions.remove(id) {
            let mut data = ActivityData::new(
                id,
                &pending.interaction.message,
                CompletionState::CompletedWithWarning,
            );
            data.step_id = pending.step_id;
            data.completion_message = Some("cancelled".to_owned());
            self.shared.emit(
                &registry,
                ActivityRecord {
                    kind: ActivityKind::Prompt,
                    data,
                },
            );
        }
    }

    /// Answer the interaction `id`, one answer per input in order. Invalid
    /// answers leave the interaction pending.
    pub fn complete_interaction(&self, id: &str, answers: Vec<String>) -> Result<(), ProgressError> {
        let unknown = || ProgressError::UnknownInteraction(id.to_owned());
        let mut registry = self.shared.registry();
        let response = match registry.interactions.get(id) {
            Some(pending) => pending.interaction.parse_answers(&answers)?,
            None => return Err(unknown()),
        };
        let pending = registry.interactions.remove(id).ok_or_else(unknown)?;
        let mut data = ActivityData::new(
            id,
            &pending.interaction.message,
            CompletionState::Completed,
        );
        data.step_id = pending.step_id;
        if pending.respond.send(response).is_err() {
            trace!(interaction = %id, "prompt caller went away before the answer arrived");
        }
        self.shared.emit(
            &registry,
            ActivityRecord {
                kind: ActivityKind::Prompt,
                data,
            },
        );
        Ok(())
    }
}

/// Withdraws an unanswered interaction when `prompt` returns or is dropped.
struct PendingPrompt<'a> {
    reporter: &'a ProgressReporter,
    id: &'a str,
    answered: bool,
}

impl Drop for PendingPrompt<'_> {
    fn drop(&mut self) {
        if !self.answered {
            self.reporter.withdraw_interaction(self.id);
        }
    }
}

/// A step of a run. Dropping it disposes it, see [`dispose`](Self::dispose).
pub struct ReportingStep {
    reporter: ProgressReporter,
    id: String,
}

impl ReportingStep {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> String {
        self.reporter
            .shared
            .registry()
            .steps
            .get(&self.id)
            .map(|s| s.title.clone())
            .unwrap_or_default()
    }

    pub fn completion_state(&self) -> CompletionState {
        self.reporter
            .step_state(&self.id)
            .unwrap_or(CompletionState::InProgress)
    }

    pub fn completion_text(&self) -> String {
        self.reporter
            .shared
            .registry()
            .steps
            .get(&self.id)
            .map(|s| s.completion_text.clone())
            .unwrap_or_default()
    }

    /// The worst state among the step's tasks. Without tasks, the step's own
    /// state once it is complete, and `Completed` before that.
    pub fn aggregated_state(&self) -> CompletionState {
        self.reporter
            .shared
            .registry()
            .steps
            .get(&self.id)
            .map(StepRecord::aggregated_state)
            .unwrap_or(CompletionState::Completed)
    }

    pub fn create_task(&self, status_text: impl Into<String>) -> Result<ReportingTask, ProgressError> {
        self.reporter.create_task_in(&self.id, status_text.into())
    }

    /// Complete the step. Its tasks are left as they are.
    pub fn complete(
        &self,
        completion_text: impl Into<String>,
        state: CompletionState,
    ) -> Result<(), ProgressError> {
        self.reporter
            .complete_step(&self.id, completion_text.into(), state)
    }

    pub fn succeed(&self, completion_text: impl Into<String>) -> Result<(), ProgressError> {
        self.complete(completion_text, CompletionState::Completed)
    }

    pub fn warn(&self, completion_text: impl Into<String>) -> Result<(), ProgressError> {
        self.complete(completion_text, CompletionState::CompletedWithWarning)
    }

    pub fn fail(&self, completion_text: impl Into<String>) -> Result<(), ProgressError> {
        self.complete(completion_text, CompletionState::CompletedWithError)
    }

    pub fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        enable_markdown: bool,
    ) -> Result<(), ProgressError> {
        self.reporter
            .log(&self.id, level, message.into(), enable_markdown)
    }

    /// If the step is still in progress: complete its unfinished tasks as
    /// `Completed`, then complete the step with its title as text and its
    /// [`aggregated_state`](Self::aggregated_state). Otherwise does nothing.
    pub fn dispose(&self) {
        self.reporter.dispose_step(&self.id);
    }
}

impl Drop for ReportingStep {
    fn drop(&mut self) {
        self.dispose();
        self.reporter.release_step(&self.id);
    }
}

impl std::fmt::Debug for ReportingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportingStep").field("id", &self.id).finish()
    }
}

/// A task within a step. Dropping it disposes it, see [`dispose`](Self::dispose).
pub struct ReportingTask {
    reporter: ProgressReporter,
    /// Looked up in the reporter; the step owns the task, not the other way round.
    step_id: String,
    id: String,
}

impl ReportingTask {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn completion_state(&self) -> CompletionState {
        self.reporter
            .task_state(&self.step_id, &self.id)
            .unwrap_or(CompletionState::InProgress)
    }

    pub fn status_text(&self) -> String {
        self.with_record(|t| t.status_text.clone())
    }

    pub fn completion_message(&self) -> String {
        self.with_record(|t| t.completion_message.clone())
    }

    fn with_record(&self, f: impl FnOnce(&TaskRecord) -> String) -> String {
        self.reporter
            .shared
            .registry()
            .steps
            .get(&self.step_id)
            .and_then(|s| s.tasks.iter().find(|t| t.id == self.id))
            .map(f)
            .unwrap_or_default()
    }

    pub fn update(&self, status_text: impl Into<String>) -> Result<(), ProgressError> {
        self.reporter
            .update_task(&self.step_id, &self.id, status_text.into())
    }

    /// Complete the task. A `None` message is recorded as an empty string.
    pub fn complete(
        &self,
        state: CompletionState,
        message: Option<String>,
    ) -> Result<(), ProgressError> {
        self.reporter
            .complete_task(&self.step_id, &self.id, state, message)
    }

    pub fn succeed(&self, message: impl Into<String>) -> Result<(), ProgressError> {
        self.complete(CompletionState::Completed, Some(message.into()))
    }

    pub fn warn(&self, message: impl Into<String>) -> Result<(), ProgressError> {
        self.complete(CompletionState::CompletedWithWarning, Some(message.into()))
    }

    pub fn fail(&self, message: impl Into<String>) -> Result<(), ProgressError> {
        self.complete(CompletionState::CompletedWithError, Some(message.into()))
    }

    /// Complete the task as `Completed`, with its status text as message, if
    /// it is still in progress. Otherwise does nothing.
    pub fn dispose(&self) {
        self.reporter.dispose_task(&self.step_id, &self.id);
    }
}

impl Drop for ReportingTask {
    fn drop(&mut self) {
        self.dispose();
        self.reporter.release_step(&self.step_id);
    }
}

impl std::fmt::Debug for ReportingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportingTask")
            .field("step_id", &self.step_id)
            .field("id", &self.id)
            .finish()
    }
}

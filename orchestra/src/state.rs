use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use orchestra_progress::{Interaction, ProgressReporter, ReportingStep, ReportingTask};
use orchestra_state::DeploymentStateStore;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{application::with_reporting, interrupt::InterruptState, options::Options};

#[derive(Subcommand, Debug)]
pub enum StateCommand {
    /// Print the deployment state as JSON
    Show {
        /// Only print this section, e.g. `Azure:Deployments`
        #[arg(long)]
        section: Option<String>,
    },

    /// Set a value in a section, creating the section if needed
    Set {
        section: String,
        key: String,
        /// Parsed as JSON if possible, otherwise stored as a string
        value: String,
    },

    /// Remove a section, including its nested sections
    Delete { section: String },

    /// Remove all deployment state for the application and environment
    Clear {
        /// Do not ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },

    /// Print the location of the state file
    Path,
}

pub async fn run(
    interrupt_state: &InterruptState,
    options: &Options,
    command: &StateCommand,
) -> Result<()> {
    let storage = options.storage()?;
    if let StateCommand::Path = command {
        println!("{}", storage.path().display());
        return Ok(());
    }
    let store = DeploymentStateStore::new(Arc::new(storage));
    let store = &store;

    with_reporting(interrupt_state, options, false, |reporter| async move {
        let context = StateContext {
            store,
            reporter: &reporter,
            cancel: interrupt_state.token(),
        };
        match command {
            StateCommand::Show { section } => {
                let value = show(&context, section.as_deref()).await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            StateCommand::Set {
                section,
                key,
                value,
            } => {
                set(&context, section, key, parse_value(value)).await?;
            }
            StateCommand::Delete { section } => {
                delete(&context, section).await?;
            }
            StateCommand::Clear { yes } => {
                clear(&context, *yes).await?;
            }
            // Printed without a store
            StateCommand::Path => {}
        }
        interrupt_state.check_interrupted()
    })
    .await
}

/// A command line value: JSON if it parses, otherwise the literal string.
pub(crate) fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

pub(crate) struct StateContext<'a> {
    pub store: &'a DeploymentStateStore,
    pub reporter: &'a ProgressReporter,
    pub cancel: &'a CancellationToken,
}

fn finish_step<T>(step: &ReportingStep, result: &Result<T>, done: &str) -> Result<()> {
    match result {
        Ok(_) => step.succeed(done)?,
        Err(e) => step.fail(format!("{:#}", e))?,
    }
    Ok(())
}

fn finish_step_on_error<T>(step: &ReportingStep, result: &Result<T>) -> Result<()> {
    if let Err(e) = result {
        step.fail(format!("{:#}", e))?;
    }
    Ok(())
}

fn finish_task<T>(task: &ReportingTask, result: &Result<T>, done: String) -> Result<()> {
    match result {
        Ok(_) => task.succeed(done)?,
        Err(e) => task.fail(format!("{:#}", e))?,
    }
    Ok(())
}

pub(crate) async fn show(context: &StateContext<'_>, section: Option<&str>) -> Result<Value> {
    let step = context.reporter.create_step("Reading deployment state");
    let result = async {
        match section {
            None => Ok::<_, anyhow::Error>(Value::Object(
                context.store.snapshot_cancellable(context.cancel).await?,
            )),
            Some(name) => {
                let section = context
                    .store
                    .acquire_section_cancellable(name, context.cancel)
                    .await
                    .with_context(|| format!("reading section '{}'", name))?;
                Ok(Value::Object(section.snapshot().await))
            }
        }
    }
    .await;
    finish_step(&step, &result, "Read deployment state")?;
    result
}

/// Returns the section's new version.
pub(crate) async fn set(
    context: &StateContext<'_>,
    section: &str,
    key: &str,
    value: Value,
) -> Result<u64> {
    let step = context
        .reporter
        .create_step(format!("Updating section {}", section));
    let task = step.create_task(format!("Setting {}", key))?;
    let result = async {
        let acquired = context
            .store
            .acquire_section_cancellable(section, context.cancel)
            .await
            .with_context(|| format!("acquiring section '{}'", section))?;
        let previous = acquired
            .with_data(|data| data.insert(key.to_owned(), value))
            .await;
        context
            .store
            .save_section_cancellable(&acquired, context.cancel)
            .await
            .with_context(|| format!("saving section '{}'", section))?;
        Ok::<_, anyhow::Error>((acquired.version(), previous))
    }
    .await;
    let done = match &result {
        Ok((_, Some(previous))) => format!("replaced {}", previous),
        _ => "added".to_owned(),
    };
    finish_task(&task, &result, done)?;
    finish_step(&step, &result, &format!("Updated section {}", section))?;
    result.map(|(version, _)| version)
}

pub(crate) async fn delete(context: &StateContext<'_>, section: &str) -> Result<()> {
    let step = context
        .reporter
        .create_step(format!("Deleting section {}", section));
    let result = async {
        let acquired = context
            .store
            .acquire_section_cancellable(section, context.cancel)
            .await
            .with_context(|| format!("acquiring section '{}'", section))?;
        context
            .store
            .delete_section_cancellable(&acquired, context.cancel)
            .await
            .with_context(|| format!("deleting section '{}'", section))?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    finish_step(&step, &result, &format!("Deleted section {}", section))?;
    result
}

/// Returns whether the state was cleared.
pub(crate) async fn clear(context: &StateContext<'_>, confirmed: bool) -> Result<bool> {
    let step = context.reporter.create_step("Clearing deployment state");
    let confirmed = if confirmed {
        true
    } else {
        let interaction = Interaction::confirm(
            "Clear deployment state",
            format!("Remove all state in {}?", context.store.describe()),
        );
        let answer = context
            .reporter
            .prompt(Some(&step), interaction, context.cancel)
            .await
            .context("asking for confirmation");
        finish_step_on_error(&step, &answer)?;
        answer?.confirmed()
    };
    if !confirmed {
        step.warn("Kept deployment state")?;
        return Ok(false);
    }
    let result = context
        .store
        .clear_all_state_cancellable(context.cancel)
        .await
        .context("clearing deployment state");
    finish_step(&step, &result, "Cleared deployment state")?;
    result.map(|()| true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_progress::{ActivityKind, CompletionState};
    use orchestra_state::{FileStateStorage, MemoryStateStorage};
    use serde_json::json;

    fn memory_store() -> DeploymentStateStore {
        DeploymentStateStore::new(Arc::new(MemoryStateStorage::new()))
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("3"), json!(3));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("{\"a\": [1]}"), json!({"a": [1]}));
        assert_eq!(parse_value("westus"), json!("westus"));
        assert_eq!(parse_value(""), json!(""));
    }

    #[tokio::test]
    async fn test_set_then_show() {
        let store = memory_store();
        let reporter = ProgressReporter::null();
        let cancel = CancellationToken::new();
        let context = StateContext {
            store: &store,
            reporter: &reporter,
            cancel: &cancel,
        };

        assert_eq!(
            set(&context, "Azure:Deployments", "web", json!({"state": "ok"}))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            set(&context, "Parameters", "replicas", json!(3)).await.unwrap(),
            1
        );
        assert_eq!(
            set(&context, "Parameters", "replicas", json!(4)).await.unwrap(),
            2
        );

        assert_eq!(
            show(&context, None).await.unwrap(),
            json!({
                "Azure": {"Deployments": {"web": {"state": "ok"}}},
                "Parameters": {"replicas": 4}
            })
        );
        assert_eq!(
            show(&context, Some("Azure")).await.unwrap(),
            json!({"Deployments": {"web": {"state": "ok"}}})
        );
        assert_eq!(
            show(&context, Some("Missing")).await.unwrap(),
            json!({})
        );
        assert_eq!(reporter.aggregated_completion_state(), CompletionState::Completed);
    }

    #[tokio::test]
    async fn test_invalid_section_fails_step() {
        let store = memory_store();
        let reporter = ProgressReporter::null();
        let cancel = CancellationToken::new();
        let context = StateContext {
            store: &store,
            reporter: &reporter,
            cancel: &cancel,
        };
        let err = set(&context, "Azure::Deployments", "k", json!(1))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("acquiring section"));
        assert_eq!(
            reporter.aggregated_completion_state(),
            CompletionState::CompletedWithError
        );
    }

    #[tokio::test]
    async fn test_delete_section() {
        let store = memory_store();
        let reporter = ProgressReporter::null();
        let cancel = CancellationToken::new();
        let context = StateContext {
            store: &store,
            reporter: &reporter,
            cancel: &cancel,
        };
        set(&context, "Azure:Deployments", "web", json!(1))
            .await
            .unwrap();
        set(&context, "Azure:Keys", "k", json!(2)).await.unwrap();
        delete(&context, "Azure:Deployments").await.unwrap();
        assert_eq!(
            show(&context, None).await.unwrap(),
            json!({"Azure": {"Keys": {"k": 2}}})
        );
    }

    #[tokio::test]
    async fn test_cancelled_command_fails() {
        let store = memory_store();
        let reporter = ProgressReporter::null();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let context = StateContext {
            store: &store,
            reporter: &reporter,
            cancel: &cancel,
        };
        assert!(set(&context, "Parameters", "k", json!(1)).await.is_err());
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_confirmed() {
        let store = memory_store();
        let reporter = ProgressReporter::null();
        let cancel = CancellationToken::new();
        let context = StateContext {
            store: &store,
            reporter: &reporter,
            cancel: &cancel,
        };
        set(&context, "Parameters", "k", json!(1)).await.unwrap();
        assert!(clear(&context, true).await.unwrap());
        assert_eq!(show(&context, None).await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_clear_declined_at_prompt() {
        let store = memory_store();
        let (reporter, mut stream) = ProgressReporter::new();
        let cancel = CancellationToken::new();
        let context = StateContext {
            store: &store,
            reporter: &reporter,
            cancel: &cancel,
        };
        set(&context, "Parameters", "k", json!(1)).await.unwrap();
        stream.drain();

        let clearing = clear(&context, false);
        let answering = async {
            loop {
                let record = stream.next().await.unwrap();
                if record.kind == ActivityKind::Prompt {
                    reporter
                        .complete_interaction(&record.data.id, vec!["no".to_owned()])
                        .unwrap();
                    break;
                }
            }
        };
        let (cleared, ()) = tokio::join!(clearing, answering);
        assert!(!cleared.unwrap());
        assert_eq!(
            show(&context, None).await.unwrap(),
            json!({"Parameters": {"k": 1}})
        );
        assert_eq!(
            reporter.aggregated_completion_state(),
            CompletionState::CompletedWithWarning
        );
    }

    #[tokio::test]
    async fn test_clear_cancelled_at_prompt_fails_step() {
        let store = memory_store();
        let (reporter, mut stream) = ProgressReporter::new();
        let cancel = CancellationToken::new();
        let context = StateContext {
            store: &store,
            reporter: &reporter,
            cancel: &cancel,
        };
        set(&context, "Parameters", "k", json!(1)).await.unwrap();
        stream.drain();

        cancel.cancel();
        let err = clear(&context, false).await.unwrap_err();
        assert!(format!("{:#}", err).contains("asking for confirmation"));
        assert_eq!(
            reporter.aggregated_completion_state(),
            CompletionState::CompletedWithError
        );
        let mut step_states = Vec::new();
        while let Some(record) = stream.try_next() {
            if record.kind == ActivityKind::Step {
                step_states.push(record.data.completion_state);
            }
        }
        assert_eq!(step_states.last(), Some(&CompletionState::CompletedWithError));
        assert!(!step_states.contains(&CompletionState::Completed));
        assert_eq!(
            store.snapshot().await.unwrap(),
            json!({"Parameters": {"k": 1}}).as_object().unwrap().clone()
        );
    }

    #[tokio::test]
    async fn test_state_survives_new_store() {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            FileStateStorage::for_application(Some(dir.path()), "/srv/shop", "Production").unwrap();
        let reporter = ProgressReporter::null();
        let cancel = CancellationToken::new();
        {
            let store = DeploymentStateStore::new(Arc::new(storage.clone()));
            let context = StateContext {
                store: &store,
                reporter: &reporter,
                cancel: &cancel,
            };
            set(&context, "Parameters", "region", parse_value("westus"))
                .await
                .unwrap();
        }
        let store = DeploymentStateStore::new(Arc::new(storage));
        let context = StateContext {
            store: &store,
            reporter: &reporter,
            cancel: &cancel,
        };
        assert_eq!(
            show(&context, Some("Parameters")).await.unwrap(),
            json!({"region": "westus"})
        );
    }
}

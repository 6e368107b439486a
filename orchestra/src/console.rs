//! Renders the activity stream on stderr and answers prompts from stdin.

use std::io::{BufRead as _, Write as _};

use anyhow::Result;
use crossterm::style::Stylize as _;
use orchestra_progress::{
    ActivityKind, ActivityRecord, ActivityStream, CompletionState, LogLevel, ProgressError,
    ProgressReporter,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub(crate) struct Console {
    color: bool,
}

fn symbol(state: CompletionState) -> &'static str {
    match state {
        CompletionState::InProgress => "…",
        CompletionState::Completed => "✔",
        CompletionState::CompletedWithWarning => "⚠",
        CompletionState::CompletedWithError => "✖",
    }
}

impl Console {
    pub(crate) fn new(color: bool) -> Self {
        Console { color }
    }

    fn paint(&self, text: String, state: CompletionState) -> String {
        if !self.color {
            return text;
        }
        match state {
            CompletionState::InProgress => text.bold().to_string(),
            CompletionState::Completed => text.green().to_string(),
            CompletionState::CompletedWithWarning => text.yellow().to_string(),
            CompletionState::CompletedWithError => text.red().to_string(),
        }
    }

    /// The line to print for `record`, if any.
    pub(crate) fn format(&self, record: &ActivityRecord) -> Option<String> {
        let data = &record.data;
        let state = data.completion_state;
        match record.kind {
            ActivityKind::Step if !data.is_complete => {
                Some(self.paint(format!("==> {}", data.status_text), state))
            }
            ActivityKind::Step => Some(self.paint(
                format!("{} {}", symbol(state), data.status_text),
                state,
            )),
            ActivityKind::Task if !data.is_complete => Some(format!("    {}", data.status_text)),
            ActivityKind::Task => {
                let line = match data.completion_message.as_deref() {
                    Some(message) if !message.is_empty() && message != data.status_text => {
                        format!("    {} {}: {}", symbol(state), data.status_text, message)
                    }
                    _ => format!("    {} {}", symbol(state), data.status_text),
                };
                Some(self.paint(line, state))
            }
            ActivityKind::Log => {
                let level = data.log_level.unwrap_or(LogLevel::Info);
                let level_name = format!("{:?}", level).to_lowercase();
                let line = format!("    [{}] {}", level_name, data.status_text);
                Some(match level {
                    LogLevel::Warning => self.paint(line, CompletionState::CompletedWithWarning),
                    LogLevel::Error => self.paint(line, CompletionState::CompletedWithError),
                    _ => line,
                })
            }
            ActivityKind::Prompt if !data.is_complete => {
                let title = data.title.as_deref().unwrap_or("Input required");
                Some(self.paint(format!("? {}: {}", title, data.status_text), state))
            }
            ActivityKind::Prompt if data.is_warning => Some(self.paint(
                format!("    {} prompt cancelled", symbol(state)),
                state,
            )),
            ActivityKind::Prompt => None,
            ActivityKind::PublishComplete => Some(self.paint(
                format!("{} {}", symbol(state), data.status_text),
                state,
            )),
        }
    }

    /// Print activities until the run is published as complete or the stream
    /// ends. Open prompts are answered from stdin.
    pub(crate) async fn render(
        self,
        reporter: ProgressReporter,
        mut stream: ActivityStream,
        cancel: CancellationToken,
    ) -> Result<()> {
        while let Some(record) = stream.next().await {
            if let Some(line) = self.format(&record) {
                eprintln!("{}", line);
            }
            match record.kind {
                ActivityKind::Prompt if !record.data.is_complete => {
                    answer_prompt(&reporter, &record, &cancel).await?;
                }
                ActivityKind::PublishComplete => break,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Read one line from stdin on a separate thread. `None` at end of input.
///
/// A detached thread, because a blocking stdin read can not be interrupted
/// and would keep the runtime from shutting down.
async fn read_line() -> Result<Option<String>> {
    let (sender, receiver) = oneshot::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        let result = std::io::stdin().lock().read_line(&mut line).map(|n| {
            if n == 0 {
                None
            } else {
                Some(line.trim_end_matches(['\r', '\n']).to_owned())
            }
        });
        let _ = sender.send(result);
    });
    Ok(receiver.await??)
}

async fn answer_prompt(
    reporter: &ProgressReporter,
    record: &ActivityRecord,
    cancel: &CancellationToken,
) -> Result<()> {
    let data = &record.data;
    loop {
        let mut answers = Vec::with_capacity(data.inputs.len());
        for input in &data.inputs {
            eprint!("  {}: ", input.label);
            std::io::stderr().flush()?;
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                line = read_line() => line?,
            };
            match line {
                Some(line) => answers.push(line),
                None => {
                    eprintln!();
                    eprintln!("no more input; cancelling");
                    cancel.cancel();
                    return Ok(());
                }
            }
        }
        match reporter.complete_interaction(&data.id, answers) {
            Ok(()) => return Ok(()),
            Err(ProgressError::InvalidAnswer { input, reason }) => {
                eprintln!("  invalid answer for {}: {}", input, reason);
            }
            // Withdrawn in the meantime
            Err(ProgressError::UnknownInteraction(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

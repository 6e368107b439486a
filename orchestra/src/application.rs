use crate::console::Console;
use crate::interrupt::InterruptState;
use crate::options::Options;
use anyhow::Result;
use orchestra_progress::{CompletionState, ProgressReporter};
use std::future::Future;
use std::process::exit;

/// Create the single-threaded tokio runtime used by the CLI.
///
/// Panics if the runtime cannot be created.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to initialize tokio runtime")
}

/// Handle a Result, printing the error and exiting with code 1 on failure.
pub fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("orchestra error: {:?}", e);
            exit(1);
        }
    }
}

/// Run `f` with a progress reporter whose activities are rendered on stderr.
///
/// When `f` returns, the run is published as complete: with the aggregated
/// state of its steps on success, or as failed on error.
pub async fn with_reporting<F, Fut, R>(
    interrupt_state: &InterruptState,
    options: &Options,
    is_deploy: bool,
    f: F,
) -> Result<R>
where
    F: FnOnce(ProgressReporter) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let (reporter, stream) = ProgressReporter::new();
    let console = Console::new(options.use_color());
    let renderer = tokio::spawn(console.render(
        reporter.clone(),
        stream,
        interrupt_state.token().clone(),
    ));

    let result = f(reporter.clone()).await;

    let state = match &result {
        Ok(_) => None,
        Err(_) => Some(CompletionState::CompletedWithError),
    };
    reporter.complete_publish(None, state, is_deploy);
    drop(reporter);

    let render_result = renderer
        .await
        .map_err(anyhow::Error::from)
        .and_then(|r| r);
    and_cleanup(result, render_result)
}

/// Combine a primary result with a cleanup result, preserving both errors if both fail.
pub fn and_cleanup<T>(primary: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (primary, cleanup) {
        (Ok(r), Ok(())) => Ok(r),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e1), Err(e2)) => Err(e1.context(format!("Additionally, cleanup failed: {}", e2))),
    }
}

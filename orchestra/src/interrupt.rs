use std::{error::Error, fmt::Display};

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

/// Ctrl-C state, shared by everything that can stop early.
#[derive(Clone, Debug)]
pub struct InterruptState {
    token: CancellationToken,
}

#[derive(Clone, Debug)]
pub struct InterruptedError {}
impl Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted")
    }
}
impl Error for InterruptedError {}

impl InterruptState {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn set_interrupted(&self) {
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancelled when the process is interrupted.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn check_interrupted(&self) -> anyhow::Result<()> {
        if self.is_interrupted() {
            Err(InterruptedError {}.into())
        } else {
            Ok(())
        }
    }
}

fn set_process_interrupt_handler(interrupted: &InterruptState) -> anyhow::Result<()> {
    let interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted.set_interrupted();
    })
    .context("setting interrupt handler")
}

pub fn set_up_process_interrupt_handler() -> anyhow::Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    set_process_interrupt_handler(&interrupt_state)?;
    Ok(interrupt_state)
}

use std::{io::IsTerminal as _, path::PathBuf};

use anyhow::{Context, Result};
use clap::{ColorChoice, Parser};
use orchestra_state::FileStateStorage;

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// The application whose deployment state to use [default: the current directory]
    #[arg(long, global = true)]
    pub app_path: Option<PathBuf>,

    /// The deployment environment
    #[arg(long, global = true, default_value = "Production")]
    pub environment: String,

    /// Where state files are kept [default: ~/.orchestra]
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,
}

impl Options {
    /// The application path as an absolute path string. State is keyed by
    /// this string, so `.` and the full path must agree.
    pub fn app_path(&self) -> Result<String> {
        let cwd = std::env::current_dir().context("getting current directory")?;
        let path = match &self.app_path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => cwd.join(p),
            None => cwd,
        };
        let path = std::fs::canonicalize(&path).unwrap_or(path);
        Ok(path.to_string_lossy().to_string())
    }

    pub fn storage(&self) -> Result<FileStateStorage> {
        let app_path = self.app_path()?;
        FileStateStorage::for_application(self.state_dir.as_deref(), &app_path, &self.environment)
            .with_context(|| format!("locating state for environment '{}'", self.environment))
    }

    /// Whether to emit ANSI colors on stderr.
    pub fn use_color(&self) -> bool {
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::stderr().is_terminal(),
        }
    }
}

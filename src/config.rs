//! Runtime settings resolved from the merged command line.
//!
//! Layering is done by `ortho_config` in [`crate::cli::merge_with_config`]:
//! defaults, then discovered configuration files (`POLYFLOW_CONFIG_PATH`,
//! the user configuration directory, `polyflow.yml` in the project), then
//! `POLYFLOW_*` environment variables, then flags. This module validates the
//! merged values and turns them into [`Settings`].
//!
//! ```yaml
//! jobs: 4
//! state_dir: .cache/polyflow
//! progress: true
//! interpreters:
//!   python: python3.12 -X utf8
//!   r: Rscript --vanilla --no-environ
//! ```

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use miette::Diagnostic;
use ortho_config::OrthoError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::Cli;
use crate::engine::{MAX_JOBS, default_jobs};
use crate::output_mode::OutputMode;
use crate::runtime::Interpreters;
use crate::runtime::process::{Interpreter, InvalidInterpreter};

/// Name used for configuration discovery.
pub const APP_NAME: &str = "polyflow";
/// Project-level configuration file name.
pub const CONFIG_FILE: &str = "polyflow.yml";
/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "POLYFLOW_CONFIG_PATH";
/// Prefix shared by every configuration environment variable.
pub const ENV_PREFIX: &str = "POLYFLOW_";
/// Default state directory, relative to the project directory.
pub const DEFAULT_STATE_DIR: &str = ".polyflow";

/// Errors raised while loading configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    /// A configuration layer could not be loaded or merged.
    #[error("cannot load configuration")]
    #[diagnostic(
        code(polyflow::config::merge),
        help("check the configuration files and POLYFLOW_* environment variables")
    )]
    Merge {
        /// Failure reported by the layer composer.
        #[source]
        source: Arc<OrthoError>,
    },

    /// The merged job count is outside the accepted range.
    #[error("jobs must be between 1 and {MAX_JOBS}, got {value}")]
    #[diagnostic(code(polyflow::config::jobs))]
    InvalidJobs {
        /// Merged value.
        value: usize,
    },

    /// An interpreter command could not be split into words.
    #[error("invalid {language} interpreter")]
    #[diagnostic(code(polyflow::config::interpreter))]
    InvalidInterpreter {
        /// Language the command is for.
        language: &'static str,
        /// Parse failure.
        #[source]
        source: InvalidInterpreter,
    },
}

impl From<Arc<OrthoError>> for ConfigError {
    fn from(source: Arc<OrthoError>) -> Self {
        Self::Merge { source }
    }
}

/// Interpreter command lines as written in configuration.
///
/// Unset entries keep the built-in command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterCommands {
    /// Shell command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Python command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    /// R command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<String>,
}

impl InterpreterCommands {
    /// Split each configured command and fill the rest with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidInterpreter`] for a command that cannot
    /// be split with shell quoting rules.
    pub fn resolve(&self) -> Result<Interpreters, ConfigError> {
        let mut interpreters = Interpreters::default();
        let commands = [
            ("shell", &self.shell, &mut interpreters.shell),
            ("python", &self.python, &mut interpreters.python),
            ("r", &self.r, &mut interpreters.r),
        ];
        for (language, raw, slot) in commands {
            if let Some(raw) = raw {
                *slot = raw
                    .parse::<Interpreter>()
                    .map_err(|source| ConfigError::InvalidInterpreter { language, source })?;
            }
        }
        Ok(interpreters)
    }
}

/// Validated settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Worker threads.
    pub jobs: usize,
    /// State directory holding the store, logs, and plan.
    pub state_dir: Utf8PathBuf,
    /// Interpreter commands.
    pub interpreters: Interpreters,
    /// Show progress output.
    pub progress: bool,
    /// Explicit accessible setting; `None` means auto-detect.
    pub accessible: Option<bool>,
}

impl Settings {
    /// Validate the merged `cli` values.
    ///
    /// A relative state directory is taken relative to the project directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the job count is out of range or an
    /// interpreter command is malformed.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let jobs = match cli.jobs {
            Some(value) if !(1..=MAX_JOBS).contains(&value) => {
                return Err(ConfigError::InvalidJobs { value });
            }
            Some(value) => value,
            None => default_jobs(),
        };
        let state_dir = cli
            .state_dir
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_STATE_DIR));
        let settings = Self {
            jobs,
            state_dir: resolve(&cli.project_dir(), &state_dir),
            interpreters: cli.interpreters.resolve()?,
            progress: cli.progress.unwrap_or(true),
            accessible: cli.accessible,
        };
        tracing::debug!(?settings, "resolved configuration");
        Ok(settings)
    }

    /// Output mode after auto-detection.
    #[must_use]
    pub fn output_mode(&self) -> OutputMode {
        OutputMode::detect(self.accessible)
    }
}

/// `path` relative to `base` unless it is already absolute.
pub(crate) fn resolve(base: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;

    fn settings(args: &[&str]) -> Result<Settings, ConfigError> {
        Settings::from_cli(&Cli::try_parse_from(args).expect("parse"))
    }

    #[test]
    fn defaults_apply_without_layers() {
        let settings = settings(&["polyflow"]).expect("settings");
        assert_eq!(settings.state_dir, Utf8PathBuf::from("./.polyflow"));
        assert_eq!(settings.interpreters, Interpreters::default());
        assert!(settings.progress);
        assert_eq!(settings.accessible, None);
        assert!((1..=MAX_JOBS).contains(&settings.jobs));
    }

    #[rstest]
    #[case(&["polyflow", "-C", "work", "--state-dir", "cache"], "work/cache")]
    #[case(&["polyflow", "-C", "work", "--state-dir", "/abs/state"], "/abs/state")]
    fn state_dir_is_relative_to_the_project(#[case] args: &[&str], #[case] expected: &str) {
        assert_eq!(
            settings(args).expect("settings").state_dir,
            Utf8PathBuf::from(expected)
        );
    }

    #[rstest]
    #[case(0)]
    #[case(MAX_JOBS + 1)]
    fn merged_job_counts_are_checked(#[case] value: usize) {
        let cli = Cli {
            jobs: Some(value),
            ..Cli::default()
        };
        assert!(matches!(
            Settings::from_cli(&cli),
            Err(ConfigError::InvalidJobs { value: got }) if got == value
        ));
    }

    #[test]
    fn interpreter_commands_are_split() {
        let commands = InterpreterCommands {
            python: Some("python3.12 -X utf8".into()),
            ..InterpreterCommands::default()
        };
        let interpreters = commands.resolve().expect("interpreters");
        assert_eq!(interpreters.python.program(), "python3.12");
        assert_eq!(interpreters.python.args(), ["-X", "utf8"]);
        assert_eq!(interpreters.shell, Interpreters::default().shell);
    }

    #[test]
    fn malformed_interpreter_commands_are_rejected() {
        let commands = InterpreterCommands {
            shell: Some("'unterminated".into()),
            ..InterpreterCommands::default()
        };
        assert!(matches!(
            commands.resolve(),
            Err(ConfigError::InvalidInterpreter { language: "shell", .. })
        ));
    }
}

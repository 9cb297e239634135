//! Command line interface definition using clap.
//!
//! This module defines the [`Cli`] structure and its subcommands, and merges
//! the parsed flags with configuration files and the environment through
//! `ortho_config`.

use camino::{Utf8Path, Utf8PathBuf};
use clap::parser::ValueSource;
use clap::{ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use ortho_config::declarative::LayerComposition;
use ortho_config::figment::{Figment, providers::Env};
use ortho_config::uncased::Uncased;
use ortho_config::{
    ConfigDiscovery, MergeComposer, OrthoConfig, OrthoError, OrthoMergeExt, OrthoResult,
    sanitize_value,
};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::config::{self, APP_NAME, CONFIG_ENV_VAR, CONFIG_FILE, ENV_PREFIX, InterpreterCommands};
use crate::language::Language;
use crate::manifest::DEFAULT_MANIFEST;

mod parsing;

use parsing::{parse_date, parse_jobs};

/// Build polyglot data pipelines with content-addressed caching.
#[derive(Debug, Parser, Serialize, Deserialize, OrthoConfig)]
#[command(author, version, about, long_about = None)]
#[ortho_config(prefix = "POLYFLOW")]
pub struct Cli {
    /// Path to the pipeline manifest.
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_MANIFEST)]
    #[ortho_config(default = default_manifest_path())]
    pub file: Utf8PathBuf,

    /// Run as if started in this directory.
    ///
    /// This affects manifest lookup, the state directory, and config
    /// discovery.
    #[arg(short = 'C', long, value_name = "DIR")]
    pub directory: Option<Utf8PathBuf>,

    /// Number of derivations evaluated in parallel (1 to 64).
    #[arg(short, long, value_name = "N", value_parser = parse_jobs)]
    pub jobs: Option<usize>,

    /// Enable verbose diagnostic logging.
    #[arg(short, long)]
    #[ortho_config(default = false)]
    pub verbose: bool,

    /// Configuration file, read in addition to the discovered ones.
    ///
    /// `OrthoConfig` merging ignores this field; it only feeds discovery.
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config: Option<Utf8PathBuf>,

    /// Directory holding the artifact store and build logs.
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<Utf8PathBuf>,

    /// Force accessible output mode on or off (overrides auto-detection).
    #[arg(long)]
    pub accessible: Option<bool>,

    /// Force progress output on or off.
    #[arg(long)]
    pub progress: Option<bool>,

    /// Interpreter command lines, set from configuration files or
    /// `POLYFLOW_INTERPRETERS__<LANGUAGE>`.
    #[arg(skip)]
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub interpreters: InterpreterCommands,

    /// Subcommand to execute; defaults to `build` when omitted.
    ///
    /// `OrthoConfig` merging ignores this field; CLI parsing supplies it.
    #[serde(skip)]
    #[command(subcommand)]
    #[ortho_config(skip_cli)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Apply the default command if none was specified.
    #[must_use]
    pub fn with_default_command(mut self) -> Self {
        if self.command.is_none() {
            self.command = Some(Commands::Build(BuildArgs::default()));
        }
        self
    }

    /// Project directory: `-C` when given, otherwise the current directory.
    #[must_use]
    pub fn project_dir(&self) -> Utf8PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("."))
    }

    /// Manifest path resolved against the project directory.
    #[must_use]
    pub fn manifest_path(&self) -> Utf8PathBuf {
        config::resolve(&self.project_dir(), &self.file)
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            file: default_manifest_path(),
            directory: None,
            jobs: None,
            verbose: false,
            config: None,
            state_dir: None,
            accessible: None,
            progress: None,
            interpreters: InterpreterCommands::default(),
            command: None,
        }
        .with_default_command()
    }
}

/// Arguments accepted by the `build` command.
#[derive(Debug, Args, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct BuildArgs {
    /// Resolve fingerprints and write `plan.json` without evaluating anything.
    #[arg(long)]
    pub plan_only: bool,
}

/// Available top-level commands.
#[derive(Debug, Subcommand, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Commands {
    /// Build every derivation that is not already cached.
    Build(BuildArgs),

    /// Show each derivation's fingerprint and whether it is cached.
    Inspect,

    /// List recorded builds, newest first.
    Log,

    /// Print a derivation's artifact from a recorded build.
    Read {
        /// Derivation name.
        name: String,
        /// Build to read from, by id or unique id fragment; defaults to the
        /// newest build that produced `name`.
        #[arg(long = "log", value_name = "SELECTOR")]
        log: Option<String>,
        /// Write the bytes to this file instead of stdout.
        #[arg(short, long, value_name = "FILE")]
        output: Option<Utf8PathBuf>,
    },

    /// Print a derivation's latest artifact converted to another language.
    Load {
        /// Derivation name.
        name: String,
        /// Target language; defaults to the derivation's own.
        #[arg(long, value_enum)]
        language: Option<Language>,
    },

    /// Print the dependency graph in DOT format.
    Graph,

    /// Print the lineage of a derivation.
    Trace {
        /// Derivation name.
        name: String,
    },

    /// Write every artifact of a recorded build into a directory.
    Export {
        /// Destination directory.
        dir: Utf8PathBuf,
        /// Build to export; defaults to the newest.
        #[arg(long = "log", value_name = "SELECTOR")]
        log: Option<String>,
    },

    /// Drop old build records and unreferenced artifacts.
    Gc {
        /// Keep builds started at or after this time (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_name = "WHEN", value_parser = parse_date)]
        keep_since: Option<OffsetDateTime>,
        /// Report what would be removed without removing it.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Return the default manifest filename when none is provided.
fn default_manifest_path() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_MANIFEST)
}

/// Parse CLI arguments from `iter`.
///
/// Returns both the parsed CLI struct and the `ArgMatches` required for
/// configuration merging.
///
/// # Errors
///
/// Returns a `clap::Error` when parsing fails.
pub fn parse_from<I, T>(iter: I) -> Result<(Cli, ArgMatches), clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut command = Cli::command();
    let matches = command.try_get_matches_from_mut(iter)?;
    // Clone matches before from_arg_matches_mut consumes the values.
    let mut matches_for_parse = matches.clone();
    let cli = Cli::from_arg_matches_mut(&mut matches_for_parse)
        .map_err(|err| err.with_cmd(&command))?;
    Ok((cli, matches))
}

/// Return the prefixed environment provider for CLI configuration.
fn env_provider() -> Env {
    Env::prefixed(ENV_PREFIX)
}

/// Build configuration discovery rooted in the project directory.
///
/// An explicit `--config` file must exist.
fn config_discovery(
    directory: Option<&Utf8Path>,
    explicit: Option<&Utf8Path>,
) -> ConfigDiscovery {
    let mut builder = ConfigDiscovery::builder(APP_NAME)
        .env_var(CONFIG_ENV_VAR)
        .project_file_name(CONFIG_FILE);
    if let Some(dir) = directory {
        builder = builder
            .clear_project_roots()
            .add_project_root(dir.as_std_path());
    }
    if let Some(path) = explicit {
        let base = directory.unwrap_or_else(|| Utf8Path::new("."));
        builder = builder.add_required_path(config::resolve(base, path).into_std_path_buf());
    }
    builder.build()
}

/// Return `true` when no CLI overrides were supplied.
///
/// The merge pipeline treats an empty JSON object as "no overrides".
fn is_empty_value(value: &serde_json::Value) -> bool {
    matches!(value, serde_json::Value::Object(map) if map.is_empty())
}

/// Values given explicitly on the command line, as a JSON object.
///
/// Flags left at their clap defaults are dropped so they cannot mask values
/// from files or the environment.
fn cli_overrides_from_matches(cli: &Cli, matches: &ArgMatches) -> OrthoResult<serde_json::Value> {
    let mut map = match sanitize_value(cli)? {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(Arc::new(OrthoError::Validation {
                key: String::from("cli"),
                message: format!(
                    "expected parsed CLI values to serialize to an object, got {other:?}"
                ),
            }));
        }
    };

    map.remove("interpreters");
    for field in [
        "file",
        "directory",
        "jobs",
        "verbose",
        "state_dir",
        "accessible",
        "progress",
    ] {
        if matches.value_source(field) != Some(ValueSource::CommandLine) {
            map.remove(field);
        }
    }

    Ok(serde_json::Value::Object(map))
}

/// Merge configuration layers over the parsed CLI values.
///
/// Layers apply in order: defaults, discovered files, `POLYFLOW_*`
/// environment variables, then flags given on the command line.
///
/// # Errors
///
/// Returns an [`ortho_config::OrthoError`] if layer composition or merging
/// fails.
pub fn merge_with_config(cli: &Cli, matches: &ArgMatches) -> OrthoResult<Cli> {
    let command = cli.command.clone();
    let mut errors = Vec::new();
    let mut composer = MergeComposer::with_capacity(4);

    match sanitize_value(&Cli::default()) {
        Ok(value) => composer.push_defaults(value),
        Err(err) => errors.push(err),
    }

    let discovery = config_discovery(cli.directory.as_deref(), cli.config.as_deref());
    let mut file_layers = discovery.compose_layers();
    errors.append(&mut file_layers.required_errors);
    if file_layers.value.is_empty() {
        errors.append(&mut file_layers.optional_errors);
    }
    for layer in file_layers.value {
        composer.push_layer(layer);
    }

    let env_provider = env_provider()
        .map(|key| Uncased::new(key.as_str().to_ascii_uppercase()))
        .split("__");
    match Figment::from(env_provider)
        .extract::<serde_json::Value>()
        .into_ortho_merge()
    {
        Ok(value) => composer.push_environment(value),
        Err(err) => errors.push(err),
    }

    match cli_overrides_from_matches(cli, matches) {
        Ok(value) if !is_empty_value(&value) => composer.push_cli(value),
        Ok(_) => {}
        Err(err) => errors.push(err),
    }

    let composition = LayerComposition::new(composer.layers(), errors);
    let mut merged = composition.into_merge_result(Cli::merge_from_layers)?;
    merged.command = command;
    merged.config.clone_from(&cli.config);
    tracing::debug!(?merged, "merged configuration layers");
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use rstest::{fixture, rstest};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Project {
        _dir: TempDir,
        root: Utf8PathBuf,
    }

    #[fixture]
    fn project() -> Project {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).expect("utf8");
        Project { _dir: dir, root }
    }

    fn merged(args: &[&str]) -> OrthoResult<Cli> {
        let (cli, matches) = parse_from(args).expect("parse");
        merge_with_config(&cli, &matches)
    }

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn build_is_the_default_command() {
        let cli = Cli::try_parse_from(["polyflow"])
            .expect("parse")
            .with_default_command();
        assert_eq!(cli.command, Some(Commands::Build(BuildArgs::default())));
        assert_eq!(cli.manifest_path(), Utf8PathBuf::from("./Pipeline.yml"));
    }

    #[test]
    fn only_command_line_flags_become_overrides() {
        let (cli, matches) = parse_from([
            "polyflow",
            "-C",
            "work",
            "-j",
            "3",
            "--state-dir",
            "cache",
            "--progress",
            "false",
            "build",
            "--plan-only",
        ])
        .expect("parse");
        assert_eq!(cli.manifest_path(), Utf8PathBuf::from("work/Pipeline.yml"));
        assert_eq!(
            cli.command,
            Some(Commands::Build(BuildArgs { plan_only: true }))
        );
        let overrides = cli_overrides_from_matches(&cli, &matches).expect("overrides");
        assert_eq!(
            overrides,
            json!({"directory": "work", "jobs": 3, "state_dir": "cache", "progress": false})
        );
    }

    #[test]
    fn layers_merge_in_precedence_order() {
        let mut composer = MergeComposer::new();
        composer.push_defaults(sanitize_value(&Cli::default()).expect("defaults"));
        composer.push_file(
            json!({
                "jobs": 2,
                "state_dir": "from-file",
                "progress": false,
                "interpreters": {"python": "python3.12 -X utf8"}
            }),
            None,
        );
        composer.push_environment(json!({"jobs": 3, "state_dir": "from-env"}));
        composer.push_cli(json!({"jobs": 5}));

        let cli = Cli::merge_from_layers(composer.layers()).expect("merge");
        assert_eq!(cli.jobs, Some(5));
        assert_eq!(cli.state_dir, Some(Utf8PathBuf::from("from-env")));
        assert_eq!(cli.progress, Some(false));
        assert_eq!(cli.file, Utf8PathBuf::from(DEFAULT_MANIFEST));

        let settings = Settings::from_cli(&cli).expect("settings");
        assert_eq!(settings.interpreters.python.program(), "python3.12");
        assert!(!settings.progress);
    }

    #[rstest]
    fn explicit_config_file_is_merged(project: Project) {
        fs::write(project.root.join("custom.yml"), "jobs: 7\nstate_dir: cache\n")
            .expect("write config");
        let cli = merged(&["polyflow", "-C", project.root.as_str(), "--config", "custom.yml"])
            .expect("merge");
        assert_eq!(cli.jobs, Some(7));
        assert_eq!(cli.state_dir, Some(Utf8PathBuf::from("cache")));
        assert_eq!(cli.config, Some(Utf8PathBuf::from("custom.yml")));
    }

    #[rstest]
    fn flags_beat_config_files(project: Project) {
        fs::write(project.root.join("custom.yml"), "jobs: 7\n").expect("write config");
        let cli = merged(&[
            "polyflow",
            "-C",
            project.root.as_str(),
            "--config",
            "custom.yml",
            "-j",
            "2",
        ])
        .expect("merge");
        assert_eq!(cli.jobs, Some(2));
    }

    #[rstest]
    fn missing_explicit_config_is_an_error(project: Project) {
        assert!(
            merged(&["polyflow", "-C", project.root.as_str(), "--config", "missing.yml"]).is_err()
        );
    }

    #[rstest]
    #[case(&["polyflow", "-j", "0"])]
    #[case(&["polyflow", "-j", "100"])]
    #[case(&["polyflow", "load", "a", "--language", "julia"])]
    #[case(&["polyflow", "gc", "--keep-since", "someday"])]
    #[case(&["polyflow", "read"])]
    fn invalid_arguments_are_rejected(#[case] args: &[&str]) {
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn read_accepts_a_build_selector() {
        let cli = Cli::try_parse_from(["polyflow", "read", "c", "--log", "20250101"])
            .expect("parse");
        assert_eq!(
            cli.command,
            Some(Commands::Read {
                name: "c".into(),
                log: Some("20250101".into()),
                output: None,
            })
        );
    }
}

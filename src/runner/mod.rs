//! CLI execution and command dispatch logic.
//!
//! This module keeps `main` minimal by providing a single entry point that
//! resolves configuration, opens the engine state, and runs the requested
//! command. Results go to the supplied writer; progress goes to stderr.

mod error;

pub use error::RunnerError;

use std::io::{self, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};

use crate::build_log::NodeStatus;
use crate::cli::{BuildArgs, Cli, Commands};
use crate::config::Settings;
use crate::derivation::Pipeline;
use crate::engine::{BuildOptions, BuildReport, CancellationToken, Engine, GcOptions};
use crate::graph::Dag;
use crate::language::Language;
use crate::manifest;
use crate::output_mode::OutputMode;
use crate::status::{AccessibleReporter, IndicatifReporter, SilentReporter, StatusReporter};

/// Build the appropriate [`StatusReporter`] for the resolved output mode and
/// progress preference.
fn make_reporter(mode: OutputMode, progress_enabled: bool) -> Box<dyn StatusReporter> {
    match (mode, progress_enabled) {
        (OutputMode::Accessible, _) => Box::new(AccessibleReporter::new()),
        (OutputMode::Standard, true) => Box::new(IndicatifReporter::new()),
        (OutputMode::Standard, false) => Box::new(SilentReporter),
    }
}

/// Execute the parsed [`Cli`], writing results to stdout.
///
/// # Errors
///
/// Returns an error if configuration, the manifest, or the engine fails, or
/// a build finishes incomplete.
pub fn run(cli: &Cli, cancel: &CancellationToken) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run_with(cli, cancel, &mut out)
}

/// Execute the parsed [`Cli`], writing results to `out`.
///
/// # Errors
///
/// See [`run`].
pub fn run_with(cli: &Cli, cancel: &CancellationToken, out: &mut dyn Write) -> Result<()> {
    let project = cli.project_dir();
    let command = cli
        .command
        .clone()
        .unwrap_or_else(|| Commands::Build(BuildArgs::default()));
    debug!(?command, project = %project, "dispatching command");

    match command {
        Commands::Graph => {
            let dag = load_dag(cli)?;
            out.write_all(dag.to_dot().as_bytes())?;
            Ok(())
        }
        Commands::Trace { name } => {
            let dag = load_dag(cli)?;
            let lineage = dag.trace(&name)?;
            writeln!(out, "{}", lineage.name)?;
            writeln!(out, "  ancestors: {}", join_or_none(&lineage.ancestors))?;
            writeln!(out, "  descendants: {}", join_or_none(&lineage.descendants))?;
            Ok(())
        }
        other => {
            let settings = Settings::from_cli(cli)?;
            let engine = open_engine(&settings)?;
            dispatch(cli, &engine, &settings, other, cancel, out)
        }
    }
}

fn dispatch(
    cli: &Cli,
    engine: &Engine,
    settings: &Settings,
    command: Commands,
    cancel: &CancellationToken,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        Commands::Build(args) => {
            let pipeline = load_pipeline(cli)?;
            let options = BuildOptions {
                build: !args.plan_only,
                jobs: settings.jobs,
                cancel: cancel.clone(),
            };
            let report = engine.build(&pipeline, &options)?;
            write_report(out, &report)?;
            ensure_complete(&report)
        }
        Commands::Inspect => {
            let pipeline = load_pipeline(cli)?;
            for line in engine.inspect(&pipeline)? {
                let state = if line.is_cached() { "cached" } else { "stale" };
                writeln!(
                    out,
                    "{}\t{}\t{}\t{state}",
                    line.name,
                    line.language,
                    line.fingerprint.short()
                )?;
            }
            Ok(())
        }
        Commands::Log => {
            let history = engine.history()?;
            if history.is_empty() {
                writeln!(out, "no builds recorded")?;
            }
            for summary in &history {
                let when = summary
                    .timestamp
                    .format(&Rfc3339)
                    .context("formatting build timestamp")?;
                writeln!(out, "{}\t{when}\t{}", summary.id, summary.outcome)?;
            }
            Ok(())
        }
        Commands::Read { name, log, output } => {
            let retrieved = engine
                .read(&name, log.as_deref())
                .with_context(|| format!("reading '{name}'"))?;
            match output {
                Some(path) => {
                    let path = resolve(cli, &path);
                    std::fs::write(&path, retrieved.artifact.bytes())
                        .with_context(|| format!("writing {path}"))?;
                    info!(%path, build = %retrieved.build_id, "artifact written");
                }
                None => write_bytes(out, retrieved.artifact.bytes())?,
            }
            Ok(())
        }
        Commands::Load { name, language } => {
            let retrieved = engine
                .load(&name, language)
                .with_context(|| load_context(&name, language))?;
            write_bytes(out, retrieved.artifact.bytes())
        }
        Commands::Export { dir, log } => {
            let dir = resolve(cli, &dir);
            let report = engine
                .export(&dir, log.as_deref())
                .with_context(|| format!("exporting to {dir}"))?;
            writeln!(
                out,
                "exported build {} ({} files) to {dir}",
                report.build_id,
                report.files.len()
            )?;
            Ok(())
        }
        Commands::Gc {
            keep_since,
            dry_run,
        } => {
            let report = engine.gc(GcOptions {
                keep_since,
                dry_run,
            })?;
            let verb = if report.dry_run { "would remove" } else { "removed" };
            writeln!(
                out,
                "{verb} {} build(s) and {} artifact(s); {} artifact(s) retained",
                report.removed_entries.len(),
                report.removed_artifacts.len(),
                report.retained_artifacts
            )?;
            Ok(())
        }
        Commands::Graph | Commands::Trace { .. } => Ok(()),
    }
}

fn open_engine(settings: &Settings) -> Result<Engine> {
    let reporter = make_reporter(settings.output_mode(), settings.progress);
    let engine = Engine::open(settings.state_dir.clone(), &settings.interpreters)
        .with_context(|| format!("opening state directory {}", settings.state_dir))?;
    Ok(engine.with_reporter(reporter))
}

fn manifest_path(cli: &Cli) -> Result<Utf8PathBuf> {
    let path = cli.manifest_path();
    if path.is_file() {
        return Ok(path);
    }
    let manifest_name = path.file_name().unwrap_or(manifest::DEFAULT_MANIFEST).to_owned();
    let directory = match &cli.directory {
        Some(dir) => format!("directory '{dir}'"),
        None => "the current directory".to_owned(),
    };
    Err(RunnerError::ManifestNotFound {
        manifest_name,
        directory,
        path,
    }
    .into())
}

fn load_pipeline(cli: &Cli) -> Result<Pipeline> {
    let path = manifest_path(cli)?;
    manifest::load_pipeline(&path).with_context(|| format!("loading manifest {path}"))
}

fn load_dag(cli: &Cli) -> Result<Dag> {
    let pipeline = load_pipeline(cli)?;
    Ok(Dag::from_pipeline(&pipeline)?)
}

fn resolve(cli: &Cli, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        cli.project_dir().join(path)
    }
}

fn load_context(name: &str, language: Option<Language>) -> String {
    language.map_or_else(
        || format!("loading '{name}'"),
        |language| format!("loading '{name}' as {language}"),
    )
}

fn join_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_owned()
    } else {
        names.join(", ")
    }
}

fn write_bytes(out: &mut dyn Write, bytes: &[u8]) -> Result<()> {
    out.write_all(bytes)?;
    if !bytes.ends_with(b"\n") {
        out.write_all(b"\n")?;
    }
    Ok(())
}

fn write_report(out: &mut dyn Write, report: &BuildReport) -> Result<()> {
    for node in &report.nodes {
        writeln!(
            out,
            "{}\t{}\t{}",
            node.name,
            node.status,
            node.fingerprint.short()
        )?;
        if let Some(error) = &node.error {
            writeln!(out, "  {error}")?;
        }
    }
    match (&report.log_id, report.outcome) {
        (Some(id), Some(outcome)) => writeln!(out, "build {id}: {outcome}")?,
        _ => writeln!(
            out,
            "plan: {} pending, {} cached",
            report.count(NodeStatus::Pending),
            report.count(NodeStatus::Reused)
        )?,
    }
    Ok(())
}

fn ensure_complete(report: &BuildReport) -> Result<()> {
    match report.outcome {
        Some(outcome) if !report.is_complete() => Err(RunnerError::BuildIncomplete {
            outcome,
            failed: report.count(NodeStatus::Failed),
            blocked: report.count(NodeStatus::Blocked),
            cancelled: report.count(NodeStatus::Cancelled),
        }
        .into()),
        _ => Ok(()),
    }
}

//! Application entry point.
//!
//! Parses command-line arguments, merges configuration layers, wires Ctrl-C to
//! cancellation, and delegates execution to [`runner::run`].

use std::io::{self, Write};
use std::process::ExitCode;

use polyflow::cli::{self, merge_with_config};
use polyflow::config::ConfigError;
use polyflow::engine::{CancellationToken, EngineError};
use polyflow::graph::GraphError;
use polyflow::manifest::ManifestError;
use polyflow::runner::{self, RunnerError};
use tracing::Level;
use tracing_subscriber::fmt;

fn main() -> ExitCode {
    let (cli, matches) = match cli::parse_from(std::env::args_os()) {
        Ok(parsed) => parsed,
        Err(err) => err.exit(),
    };
    let max_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::ERROR
    };
    fmt().with_max_level(max_level).with_writer(io::stderr).init();

    let cli = match merge_with_config(&cli, &matches) {
        Ok(merged) => merged.with_default_command(),
        Err(source) => {
            tracing::error!(error = %source, "configuration merge failed");
            report(ConfigError::from(source).into());
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_token.cancel()) {
        tracing::warn!(error = %err, "cannot install Ctrl-C handler");
    }

    match runner::run(&cli, &cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "runner failed");
            report(err);
            ExitCode::FAILURE
        }
    }
}

/// Render known diagnostics with `miette`, everything else with its cause chain.
fn report(err: anyhow::Error) {
    let rendered = match diagnostic(err) {
        Ok(report) => format!("{report:?}"),
        Err(other) => format!("Error: {other:?}"),
    };
    drop(writeln!(io::stderr(), "{rendered}"));
}

fn diagnostic(err: anyhow::Error) -> Result<miette::Report, anyhow::Error> {
    let err = match err.downcast::<ManifestError>() {
        Ok(diag) => return Ok(miette::Report::new(diag)),
        Err(err) => err,
    };
    let err = match err.downcast::<ConfigError>() {
        Ok(diag) => return Ok(miette::Report::new(diag)),
        Err(err) => err,
    };
    let err = match err.downcast::<GraphError>() {
        Ok(diag) => return Ok(miette::Report::new(diag)),
        Err(err) => err,
    };
    let err = match err.downcast::<EngineError>() {
        Ok(diag) => return Ok(miette::Report::new(diag)),
        Err(err) => err,
    };
    err.downcast::<RunnerError>().map(miette::Report::new)
}

//! Error types for the runner module.
//!
//! This submodule isolates derive-macro-affected code to scope lint suppressions
//! narrowly. The `unused_assignments` lint fires in some Rust versions due to
//! thiserror/miette derive macro expansion.

// Scoped suppression for version-dependent lint false positives from
// miette/thiserror derive macros. `#[expect]` fails where the lint does not
// fire, so `#[allow]` is used.
#![allow(
    clippy::allow_attributes,
    clippy::allow_attributes_without_reason,
    unused_assignments
)]

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

use crate::build_log::Outcome;

/// Errors raised during command execution.
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    /// The manifest file does not exist at the expected path.
    #[error("no {manifest_name} found in {directory}")]
    #[diagnostic(
        code(polyflow::runner::manifest_not_found),
        help("create a {manifest_name}, pass --file, or run with -C <DIR>")
    )]
    ManifestNotFound {
        /// Name of the expected manifest file.
        manifest_name: String,
        /// Directory that was searched.
        directory: String,
        /// The path that was attempted.
        path: Utf8PathBuf,
    },

    /// The build finished without every derivation available.
    #[error("build {outcome}: {failed} failed, {blocked} blocked, {cancelled} cancelled")]
    #[diagnostic(code(polyflow::runner::build_incomplete))]
    BuildIncomplete {
        /// Recorded outcome.
        outcome: Outcome,
        /// Derivations whose evaluation failed.
        failed: usize,
        /// Derivations skipped because an upstream failed.
        blocked: usize,
        /// Derivations never dispatched.
        cancelled: usize,
    },
}

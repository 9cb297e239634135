//! Language runtimes that evaluate derivation bodies.
//!
//! A [`Runtime`] receives the body and the materialised upstream values, each
//! already in the runtime's native format, and returns a native artifact.
//! `jinja` is evaluated in-process; the other languages spawn an interpreter
//! in a scratch directory (see [`process`]).

pub mod jinja;
pub mod process;

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use miette::Diagnostic;
use thiserror::Error;

use crate::artifact::Artifact;
use crate::language::Language;

pub use jinja::JinjaRuntime;
pub use process::{Interpreter, ScriptRuntime, ShellRuntime};

/// Errors raised while evaluating a body.
#[derive(Debug, Error, Diagnostic)]
pub enum RuntimeError {
    /// No runtime is registered for the language.
    #[error("no runtime registered for language '{0}'")]
    #[diagnostic(code(polyflow::runtime::unavailable))]
    Unavailable(Language),

    /// The body failed to evaluate.
    #[error("evaluation failed: {0}")]
    #[diagnostic(code(polyflow::runtime::evaluation))]
    Evaluation(String),

    /// The interpreter could not be started.
    #[error("failed to start '{program}'")]
    #[diagnostic(
        code(polyflow::runtime::spawn),
        help("install the interpreter or configure its command in polyflow.yml")
    )]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// The interpreter exited unsuccessfully.
    #[error("'{program}' exited with {}: {stderr}", .status.map_or_else(|| "a signal".to_owned(), |code| format!("status {code}")))]
    #[diagnostic(code(polyflow::runtime::exit))]
    Exit {
        /// Program that ran.
        program: String,
        /// Exit code, absent when killed by a signal.
        status: Option<i32>,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// The interpreter's output could not be decoded.
    #[error("unparsable output: {0}")]
    #[diagnostic(code(polyflow::runtime::output))]
    Output(String),

    /// An import reader is not known to the runtime.
    #[error("unknown reader '{0}'")]
    #[diagnostic(code(polyflow::runtime::unknown_reader))]
    UnknownReader(String),

    /// Preparing the scratch directory or reading a file failed.
    #[error("I/O failed at '{path}'")]
    #[diagnostic(code(polyflow::runtime::io))]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
}

/// An upstream value bound under its derivation name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Name the value is bound to.
    pub name: String,
    /// Value in the consuming runtime's native format.
    pub artifact: Artifact,
}

/// What to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation<'a> {
    /// Evaluate source text.
    Expr(&'a str),
    /// Read a file relative to the pipeline root.
    Import {
        /// File path relative to the root.
        path: &'a Utf8Path,
        /// Reader to apply; runtimes choose a default by extension.
        reader: Option<&'a str>,
    },
}

/// Everything a runtime needs to evaluate one derivation.
#[derive(Debug, Clone, Copy)]
pub struct EvalRequest<'a> {
    /// Derivation name, for diagnostics.
    pub derivation: &'a str,
    /// Body to evaluate.
    pub body: Evaluation<'a>,
    /// Upstream values.
    pub inputs: &'a [Binding],
    /// Pipeline root directory.
    pub root: &'a Utf8Path,
    /// Extra files, relative to `root`, to expose in the working directory.
    pub extra_files: &'a [Utf8PathBuf],
}

/// A language runtime.
pub trait Runtime: Send + Sync {
    /// Language this runtime evaluates.
    fn language(&self) -> Language;

    /// Evaluate a body and return the native artifact.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when evaluation fails.
    fn evaluate(&self, request: &EvalRequest<'_>) -> Result<Artifact, RuntimeError>;
}

/// Runtimes by language.
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    runtimes: BTreeMap<Language, Arc<dyn Runtime>>,
}

impl std::fmt::Debug for RuntimeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.runtimes.keys()).finish()
    }
}

/// Interpreter commands for the process-backed languages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreters {
    /// Shell command; the body is appended as the final argument.
    pub shell: Interpreter,
    /// Python command; the wrapper script path is appended.
    pub python: Interpreter,
    /// R command; the wrapper script path is appended.
    pub r: Interpreter,
}

impl Default for Interpreters {
    fn default() -> Self {
        Self {
            shell: Interpreter::new("sh", ["-c"]),
            python: Interpreter::new("python3", [] as [&str; 0]),
            r: Interpreter::new("Rscript", ["--vanilla"]),
        }
    }
}

impl RuntimeRegistry {
    /// A registry with no runtimes.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in runtimes using `interpreters` for process languages.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Evaluation`] when a wrapper template fails to
    /// compile.
    pub fn with_defaults(interpreters: &Interpreters) -> Result<Self, RuntimeError> {
        let mut registry = Self::empty();
        registry.register(Arc::new(JinjaRuntime::new()));
        registry.register(Arc::new(ShellRuntime::new(interpreters.shell.clone())));
        registry.register(Arc::new(ScriptRuntime::python(interpreters.python.clone())?));
        registry.register(Arc::new(ScriptRuntime::r(interpreters.r.clone())?));
        Ok(registry)
    }

    /// Register (or replace) the runtime for its language.
    pub fn register(&mut self, runtime: Arc<dyn Runtime>) {
        self.runtimes.insert(runtime.language(), runtime);
    }

    /// Runtime for `language`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Unavailable`] when none is registered.
    pub fn get(&self, language: Language) -> Result<&dyn Runtime, RuntimeError> {
        self.runtimes
            .get(&language)
            .map(|runtime| &**runtime)
            .ok_or(RuntimeError::Unavailable(language))
    }
}

/// Reject import paths that could leave the pipeline root.
pub(crate) fn contained(root: &Utf8Path, path: &Utf8Path) -> Result<Utf8PathBuf, RuntimeError> {
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, camino::Utf8Component::ParentDir));
    if escapes {
        return Err(RuntimeError::Io {
            path: path.to_owned(),
            source: io::Error::new(
                io::ErrorKind::PermissionDenied,
                "path must stay inside the pipeline directory",
            ),
        });
    }
    Ok(root.join(path))
}

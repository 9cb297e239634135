//! Interpreter-backed runtimes.
//!
//! Each evaluation runs in a fresh scratch directory that holds copies of the
//! derivation's extra files (at their paths relative to the pipeline root) and
//! one file per input under `.polyflow/inputs/`.
//!
//! - [`ShellRuntime`] runs the body with the shell interpreter. Each input's
//!   file path is exported in an environment variable named after the input
//!   and stdout becomes the artifact, byte for byte.
//! - [`ScriptRuntime`] renders a wrapper script from a template. The wrapper
//!   loads every input from its JSON file, evaluates the expression (or calls
//!   the reader on the import path), and prints the JSON result.

use std::fmt;
use std::fs;
use std::io;
use std::process::{Command, Output, Stdio};
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use minijinja::{Environment, context};
use serde::Serialize;
use shell_quote::{QuoteRefExt, Sh};
use tempfile::TempDir;

use crate::artifact::{Artifact, Format};
use crate::language::Language;

use super::{EvalRequest, Evaluation, Runtime, RuntimeError, contained};

const PYTHON_WRAPPER: &str = include_str!("../../templates/python_wrapper.py.j2");
const R_WRAPPER: &str = include_str!("../../templates/r_wrapper.R.j2");
const WRAPPER: &str = "wrapper";

/// Program and leading arguments used to start an interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    program: String,
    args: Vec<String>,
}

impl Interpreter {
    /// Build an interpreter command from its parts.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Executable name or path.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments placed before the body or script path.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Error returned when an interpreter command line cannot be split.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid interpreter command '{0}'")]
pub struct InvalidInterpreter(pub String);

impl FromStr for Interpreter {
    type Err = InvalidInterpreter;

    /// Split a command line with POSIX shell quoting rules.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = shlex::split(s)
            .filter(|words| !words.is_empty())
            .ok_or_else(|| InvalidInterpreter(s.to_owned()))?
            .into_iter();
        let program = words.next().ok_or_else(|| InvalidInterpreter(s.to_owned()))?;
        Ok(Self::new(program, words))
    }
}

impl fmt::Display for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words =
            std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        match shlex::try_join(words) {
            Ok(joined) => f.write_str(&joined),
            Err(_) => write!(f, "{} {}", self.program, self.args.join(" ")),
        }
    }
}

/// Scratch working directory for one evaluation.
struct Scratch {
    _guard: TempDir,
    path: Utf8PathBuf,
    root: Utf8PathBuf,
}

impl Scratch {
    fn prepare(request: &EvalRequest<'_>) -> Result<Self, RuntimeError> {
        let guard = tempfile::Builder::new()
            .prefix("polyflow-")
            .tempdir()
            .map_err(io_error(Utf8Path::new("<tempdir>")))?;
        let path = Utf8Path::from_path(guard.path())
            .map(Utf8Path::to_owned)
            .ok_or_else(|| RuntimeError::Io {
                path: Utf8PathBuf::from("<tempdir>"),
                source: io::Error::new(io::ErrorKind::InvalidData, "path is not UTF-8"),
            })?;
        let root = request
            .root
            .canonicalize_utf8()
            .map_err(io_error(request.root))?;
        for relative in request.extra_files {
            let source = contained(&root, relative)?;
            let target = path.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            fs::copy(&source, &target).map_err(io_error(&source))?;
        }
        Ok(Self {
            _guard: guard,
            path,
            root,
        })
    }

    /// Write each input to `.polyflow/inputs/<name><suffix>`.
    fn write_inputs(
        &self,
        request: &EvalRequest<'_>,
        suffix: &str,
    ) -> Result<Vec<(String, Utf8PathBuf)>, RuntimeError> {
        let dir = self.path.join(".polyflow").join("inputs");
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        request
            .inputs
            .iter()
            .map(|binding| {
                let file = dir.join(format!("{}{suffix}", binding.name));
                fs::write(&file, binding.artifact.bytes()).map_err(io_error(&file))?;
                Ok((binding.name.clone(), file))
            })
            .collect()
    }
}

fn io_error(path: &Utf8Path) -> impl FnOnce(io::Error) -> RuntimeError + '_ {
    move |source| RuntimeError::Io {
        path: path.to_owned(),
        source,
    }
}

fn run(
    mut cmd: Command,
    interpreter: &Interpreter,
    derivation: &str,
) -> Result<Vec<u8>, RuntimeError> {
    tracing::debug!(derivation, program = interpreter.program(), "spawning interpreter");
    let Output {
        status,
        stdout,
        stderr,
    } = cmd.output().map_err(|source| RuntimeError::Spawn {
        program: interpreter.program().to_owned(),
        source,
    })?;
    let stderr = String::from_utf8_lossy(&stderr).trim().to_owned();
    if status.success() {
        if !stderr.is_empty() {
            tracing::debug!(derivation, %stderr, "interpreter stderr");
        }
        Ok(stdout)
    } else {
        Err(RuntimeError::Exit {
            program: interpreter.program().to_owned(),
            status: status.code(),
            stderr,
        })
    }
}

/// Runs `shell` derivations.
#[derive(Debug, Clone)]
pub struct ShellRuntime {
    interpreter: Interpreter,
}

impl ShellRuntime {
    /// Create the runtime; the body is appended to `interpreter`'s arguments.
    #[must_use]
    pub const fn new(interpreter: Interpreter) -> Self {
        Self { interpreter }
    }
}

impl Runtime for ShellRuntime {
    fn language(&self) -> Language {
        Language::Shell
    }

    fn evaluate(&self, request: &EvalRequest<'_>) -> Result<Artifact, RuntimeError> {
        let scratch = Scratch::prepare(request)?;
        let inputs = scratch.write_inputs(request, "")?;
        let body = match request.body {
            Evaluation::Expr(source) => source.to_owned(),
            Evaluation::Import { path, reader } => {
                let absolute = contained(&scratch.root, path)?;
                let quoted: Vec<u8> = absolute.as_str().quoted(Sh);
                format!(
                    "{} {}",
                    reader.unwrap_or("cat"),
                    String::from_utf8_lossy(&quoted)
                )
            }
        };
        let mut cmd = self.interpreter.command();
        cmd.arg(&body).current_dir(&scratch.path);
        for (name, file) in &inputs {
            cmd.env(name, file);
        }
        let stdout = run(cmd, &self.interpreter, request.derivation)?;
        Ok(Artifact::new(Format::Native(Language::Shell), stdout))
    }
}

/// One input as the wrapper sees it: both fields are quoted literals.
#[derive(Serialize)]
struct WrapperInput {
    key: String,
    path: String,
}

/// Runs `python` or `r` derivations through a rendered wrapper script.
pub struct ScriptRuntime {
    language: Language,
    interpreter: Interpreter,
    env: Environment<'static>,
    script_name: &'static str,
    default_reader: &'static str,
}

impl fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("language", &self.language)
            .field("interpreter", &self.interpreter)
            .finish_non_exhaustive()
    }
}

impl ScriptRuntime {
    /// Python runtime started with `interpreter`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Evaluation`] when the wrapper template is
    /// invalid.
    pub fn python(interpreter: Interpreter) -> Result<Self, RuntimeError> {
        Self::new(
            Language::Python,
            interpreter,
            PYTHON_WRAPPER,
            "polyflow_wrapper.py",
            "_polyflow_read",
        )
    }

    /// R runtime started with `interpreter`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Evaluation`] when the wrapper template is
    /// invalid.
    pub fn r(interpreter: Interpreter) -> Result<Self, RuntimeError> {
        Self::new(
            Language::R,
            interpreter,
            R_WRAPPER,
            "polyflow_wrapper.R",
            ".polyflow_read",
        )
    }

    fn new(
        language: Language,
        interpreter: Interpreter,
        template: &'static str,
        script_name: &'static str,
        default_reader: &'static str,
    ) -> Result<Self, RuntimeError> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template(WRAPPER, template)
            .map_err(|err| RuntimeError::Evaluation(err.to_string()))?;
        Ok(Self {
            language,
            interpreter,
            env,
            script_name,
            default_reader,
        })
    }

    /// Render the wrapper script for `request`, given input file paths.
    fn render(
        &self,
        request: &EvalRequest<'_>,
        root: &Utf8Path,
        inputs: &[(String, Utf8PathBuf)],
    ) -> Result<String, RuntimeError> {
        let inputs: Vec<WrapperInput> = inputs
            .iter()
            .map(|(name, path)| {
                Ok(WrapperInput {
                    key: literal(name)?,
                    path: literal(path.as_str())?,
                })
            })
            .collect::<Result<_, RuntimeError>>()?;
        let (expr, import_path, reader, modules) = match request.body {
            Evaluation::Expr(source) => (Some(source), None, None, Vec::new()),
            Evaluation::Import { path, reader } => {
                let absolute = contained(root, path)?;
                let reader = reader.unwrap_or(self.default_reader);
                let modules = match (self.language, reader.rsplit_once('.')) {
                    (Language::Python, Some((module, _))) if !module.is_empty() => {
                        vec![module.to_owned()]
                    }
                    _ => Vec::new(),
                };
                (None, Some(literal(absolute.as_str())?), Some(reader), modules)
            }
        };
        let template = self
            .env
            .get_template(WRAPPER)
            .map_err(|err| RuntimeError::Evaluation(err.to_string()))?;
        template
            .render(context! { inputs, expr, import_path, reader, modules })
            .map_err(|err| RuntimeError::Evaluation(err.to_string()))
    }
}

/// Quote `text` as a string literal valid in both Python and R.
fn literal(text: &str) -> Result<String, RuntimeError> {
    serde_json::to_string(text).map_err(|err| RuntimeError::Evaluation(err.to_string()))
}

impl Runtime for ScriptRuntime {
    fn language(&self) -> Language {
        self.language
    }

    fn evaluate(&self, request: &EvalRequest<'_>) -> Result<Artifact, RuntimeError> {
        let scratch = Scratch::prepare(request)?;
        let inputs = scratch.write_inputs(request, ".json")?;
        let script = self.render(request, &scratch.root, &inputs)?;
        let script_path = scratch.path.join(".polyflow").join(self.script_name);
        if let Some(parent) = script_path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        fs::write(&script_path, script).map_err(io_error(&script_path))?;

        let mut cmd = self.interpreter.command();
        cmd.arg(&script_path).current_dir(&scratch.path);
        let stdout = run(cmd, &self.interpreter, request.derivation)?;
        let value: serde_json::Value = serde_json::from_slice(&stdout)
            .map_err(|err| RuntimeError::Output(format!("expected JSON on stdout: {err}")))?;
        Artifact::from_json(Format::Native(self.language), &value)
            .map_err(|err| RuntimeError::Output(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Binding;
    use rstest::rstest;

    #[rstest]
    #[case("python3", "python3", &[])]
    #[case("Rscript --vanilla", "Rscript", &["--vanilla"])]
    #[case("'my shell' -c", "my shell", &["-c"])]
    fn parses_interpreter_commands(
        #[case] raw: &str,
        #[case] program: &str,
        #[case] args: &[&str],
    ) {
        let interpreter: Interpreter = raw.parse().expect("interpreter");
        assert_eq!(interpreter.program(), program);
        assert_eq!(interpreter.args(), args);
    }

    #[rstest]
    #[case("")]
    #[case("'unterminated")]
    fn rejects_bad_interpreter_commands(#[case] raw: &str) {
        assert!(raw.parse::<Interpreter>().is_err());
    }

    fn request<'a>(body: Evaluation<'a>, inputs: &'a [Binding]) -> EvalRequest<'a> {
        EvalRequest {
            derivation: "node",
            body,
            inputs,
            root: Utf8Path::new("."),
            extra_files: &[],
        }
    }

    #[test]
    fn python_wrapper_binds_inputs_and_expression() {
        let runtime = ScriptRuntime::python(Interpreter::new("python3", [] as [&str; 0]))
            .expect("runtime");
        let inputs = [("a".to_owned(), Utf8PathBuf::from("/tmp/in/a.json"))];
        let script = runtime
            .render(
                &request(Evaluation::Expr("[x * 2 for x in a]"), &[]),
                Utf8Path::new("/root"),
                &inputs,
            )
            .expect("render");
        assert!(script.contains(r#"with open("/tmp/in/a.json", encoding="utf-8")"#), "{script}");
        assert!(
            script.contains(r#"    _polyflow_inputs["a"] = _polyflow_json.load(_polyflow_handle)"#),
            "{script}"
        );
        assert!(script.contains("globals().update(_polyflow_inputs)"), "{script}");
        assert!(script.contains("[x * 2 for x in a]"), "{script}");
        assert!(
            script.contains("_polyflow_json.dump(_polyflow_result, _polyflow_sys.stdout)"),
            "{script}"
        );
    }

    #[test]
    fn python_import_imports_reader_module() {
        let runtime = ScriptRuntime::python(Interpreter::new("python3", [] as [&str; 0]))
            .expect("runtime");
        let body = Evaluation::Import {
            path: Utf8Path::new("data/raw.csv"),
            reader: Some("pandas.read_csv"),
        };
        let script = runtime
            .render(&request(body, &[]), Utf8Path::new("/root"), &[])
            .expect("render");
        assert!(script.contains("import pandas\n"), "{script}");
        assert!(
            script.contains(r#"_polyflow_result = pandas.read_csv("/root/data/raw.csv")"#),
            "{script}"
        );
    }

    #[test]
    fn r_wrapper_assigns_inputs_by_name() {
        let runtime =
            ScriptRuntime::r(Interpreter::new("Rscript", [] as [&str; 0])).expect("runtime");
        let inputs = [("_raw".to_owned(), Utf8PathBuf::from("/tmp/in/_raw.json"))];
        let script = runtime
            .render(&request(Evaluation::Expr("1"), &[]), Utf8Path::new("/p"), &inputs)
            .expect("render");
        assert!(
            script.contains(
                r#"assign("_raw", jsonlite::fromJSON("/tmp/in/_raw.json", simplifyVector = TRUE))"#
            ),
            "{script}"
        );
    }

    #[test]
    fn r_wrapper_uses_default_reader() {
        let runtime =
            ScriptRuntime::r(Interpreter::new("Rscript", [] as [&str; 0])).expect("runtime");
        let body = Evaluation::Import {
            path: Utf8Path::new("x.json"),
            reader: None,
        };
        let script = runtime
            .render(&request(body, &[]), Utf8Path::new("/p"), &[])
            .expect("render");
        assert!(
            script.contains(r#".polyflow_result <- .polyflow_read("/p/x.json")"#),
            "{script}"
        );
    }

    #[cfg(unix)]
    mod shell {
        use super::*;

        fn runtime() -> ShellRuntime {
            ShellRuntime::new(Interpreter::new("sh", ["-c"]))
        }

        #[test]
        fn stdout_is_the_artifact() {
            let artifact = runtime()
                .evaluate(&request(Evaluation::Expr("printf 'hi'"), &[]))
                .expect("shell");
            assert_eq!(artifact.bytes(), b"hi");
            assert_eq!(artifact.format(), &Format::Native(Language::Shell));
        }

        #[test]
        fn inputs_are_exported_as_file_paths() {
            let inputs = [Binding {
                name: "a".into(),
                artifact: Artifact::new(Format::Native(Language::Shell), b"1 2 3".to_vec()),
            }];
            let artifact = runtime()
                .evaluate(&request(Evaluation::Expr(r#"cat "$a""#), &inputs))
                .expect("shell");
            assert_eq!(artifact.bytes(), b"1 2 3");
        }

        #[test]
        fn failures_carry_status_and_stderr() {
            let err = runtime()
                .evaluate(&request(Evaluation::Expr("echo nope >&2; exit 3"), &[]))
                .expect_err("failure");
            assert!(matches!(
                err,
                RuntimeError::Exit { status: Some(3), ref stderr, .. } if stderr == "nope"
            ));
        }

        #[test]
        fn missing_interpreter_is_a_spawn_error() {
            let runtime = ShellRuntime::new(Interpreter::new("polyflow-no-such-shell", ["-c"]));
            let err = runtime
                .evaluate(&request(Evaluation::Expr("true"), &[]))
                .expect_err("spawn");
            assert!(matches!(err, RuntimeError::Spawn { .. }));
        }
    }
}

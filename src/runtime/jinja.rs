//! In-process `MiniJinja` expression runtime.
//!
//! Inputs are bound as template variables built from their JSON values and the
//! expression result is serialised back to canonical JSON. Undefined names are
//! errors. Besides the `MiniJinja` builtins two arithmetic filters are
//! available so list transforms can be written with `map`:
//!
//! ```text
//! a | map('mul', 2)
//! a | map('add', 1) | sum
//! ```

use std::collections::BTreeMap;

use cap_std::{ambient_authority, fs_utf8::Dir};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};

use crate::artifact::{Artifact, Format};
use crate::language::Language;

use super::{EvalRequest, Evaluation, Runtime, RuntimeError};

/// Evaluates `jinja` derivations.
pub struct JinjaRuntime {
    env: Environment<'static>,
}

impl Default for JinjaRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl JinjaRuntime {
    /// Create the runtime with the arithmetic filters registered.
    #[must_use]
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("mul", mul);
        env.add_filter("add", add);
        Self { env }
    }

    fn eval_expr(
        &self,
        source: &str,
        request: &EvalRequest<'_>,
    ) -> Result<serde_json::Value, RuntimeError> {
        let mut context = BTreeMap::new();
        for binding in request.inputs {
            let value = binding.artifact.to_json().map_err(|err| {
                RuntimeError::Evaluation(format!("input '{}' is not JSON: {err}", binding.name))
            })?;
            context.insert(binding.name.as_str(), value);
        }
        let expr = self
            .env
            .compile_expression(source)
            .map_err(|err| RuntimeError::Evaluation(err.to_string()))?;
        let value = expr
            .eval(&context)
            .map_err(|err| RuntimeError::Evaluation(err.to_string()))?;
        serde_json::to_value(&value).map_err(|err| RuntimeError::Output(err.to_string()))
    }
}

impl Runtime for JinjaRuntime {
    fn language(&self) -> Language {
        Language::Jinja
    }

    fn evaluate(&self, request: &EvalRequest<'_>) -> Result<Artifact, RuntimeError> {
        let value = match request.body {
            Evaluation::Expr(source) => self.eval_expr(source, request)?,
            Evaluation::Import { path, reader } => read_import(request.root, path, reader)?,
        };
        Artifact::from_json(Format::Native(Language::Jinja), &value)
            .map_err(|err| RuntimeError::Output(err.to_string()))
    }
}

fn read_import(
    root: &camino::Utf8Path,
    path: &camino::Utf8Path,
    reader: Option<&str>,
) -> Result<serde_json::Value, RuntimeError> {
    let io_err = |source| RuntimeError::Io {
        path: path.to_owned(),
        source,
    };
    let reader = reader.unwrap_or_else(|| match path.extension() {
        Some("json") => "json",
        Some("yaml" | "yml") => "yaml",
        _ => "text",
    });
    let dir = Dir::open_ambient_dir(root, ambient_authority()).map_err(io_err)?;
    let text = dir.read_to_string(path).map_err(io_err)?;
    match reader {
        "json" => {
            serde_json::from_str(&text).map_err(|err| RuntimeError::Output(err.to_string()))
        }
        "yaml" => {
            serde_saphyr::from_str(&text).map_err(|err| RuntimeError::Output(err.to_string()))
        }
        "text" => Ok(serde_json::Value::String(text)),
        "lines" => Ok(serde_json::Value::Array(
            text.lines()
                .map(|line| serde_json::Value::String(line.to_owned()))
                .collect(),
        )),
        other => Err(RuntimeError::UnknownReader(other.to_owned())),
    }
}

#[derive(Clone, Copy)]
enum Op {
    Mul,
    Add,
}

fn mul(value: &Value, factor: &Value) -> Result<Value, Error> {
    arithmetic(Op::Mul, value, factor)
}

fn add(value: &Value, operand: &Value) -> Result<Value, Error> {
    arithmetic(Op::Add, value, operand)
}

#[expect(
    clippy::float_arithmetic,
    reason = "filters mirror template arithmetic on non-integer numbers"
)]
fn arithmetic(op: Op, lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    let name = match op {
        Op::Mul => "mul",
        Op::Add => "add",
    };
    if let (Ok(a), Ok(b)) = (i64::try_from(lhs.clone()), i64::try_from(rhs.clone())) {
        let result = match op {
            Op::Mul => a.checked_mul(b),
            Op::Add => a.checked_add(b),
        };
        return result.map(Value::from).ok_or_else(|| {
            Error::new(ErrorKind::InvalidOperation, format!("{name} overflowed"))
        });
    }
    match (f64::try_from(lhs.clone()), f64::try_from(rhs.clone())) {
        (Ok(a), Ok(b)) => Ok(Value::from(match op {
            Op::Mul => a * b,
            Op::Add => a + b,
        })),
        _ => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("{name} expects numbers, got {} and {}", lhs.kind(), rhs.kind()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Binding;
    use camino::{Utf8Path, Utf8PathBuf};
    use rstest::rstest;
    use serde_json::{Value as Json, json};
    use std::fs;
    use tempfile::TempDir;

    fn eval(source: &str, inputs: &[Binding]) -> Result<Json, RuntimeError> {
        let request = EvalRequest {
            derivation: "test",
            body: Evaluation::Expr(source),
            inputs,
            root: Utf8Path::new("."),
            extra_files: &[],
        };
        JinjaRuntime::new()
            .evaluate(&request)
            .map(|artifact| artifact.to_json().expect("json"))
    }

    fn bind(name: &str, value: &Json) -> Binding {
        Binding {
            name: name.into(),
            artifact: Artifact::from_json(Format::Native(Language::Jinja), value).expect("json"),
        }
    }

    #[rstest]
    #[case("[1, 2, 3]", json!([1, 2, 3]))]
    #[case("{'k': 'v'}", json!({"k": "v"}))]
    #[case("1.5 * 3", json!(4.5))]
    fn evaluates_literals(#[case] source: &str, #[case] expected: Json) {
        assert_eq!(eval(source, &[]).expect("eval"), expected);
    }

    #[rstest]
    #[case("a | map('mul', 2) | list", json!([2, 4, 6]))]
    #[case("a | map('add', 1) | sum", json!(9))]
    #[case("a | sum", json!(6))]
    fn binds_inputs(#[case] source: &str, #[case] expected: Json) {
        let inputs = [bind("a", &json!([1, 2, 3]))];
        assert_eq!(eval(source, &inputs).expect("eval"), expected);
    }

    #[test]
    fn undefined_names_fail() {
        assert!(matches!(
            eval("missing + 1", &[]),
            Err(RuntimeError::Evaluation(_))
        ));
    }

    #[rstest]
    #[case("data.json", None, "{\"x\": [1]}", json!({"x": [1]}))]
    #[case("data.yml", None, "x: 1\n", json!({"x": 1}))]
    #[case("notes.txt", Some("lines"), "a\nb\n", json!(["a", "b"]))]
    #[case("notes.txt", None, "a\n", json!("a\n"))]
    fn imports_use_readers(
        #[case] file: &str,
        #[case] reader: Option<&str>,
        #[case] contents: &str,
        #[case] expected: Json,
    ) {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).expect("utf8 path");
        fs::write(root.join(file), contents).expect("write import");
        let request = EvalRequest {
            derivation: "raw",
            body: Evaluation::Import {
                path: Utf8Path::new(file),
                reader,
            },
            inputs: &[],
            root: &root,
            extra_files: &[],
        };
        let artifact = JinjaRuntime::new().evaluate(&request).expect("import");
        assert_eq!(artifact.to_json().expect("json"), expected);
    }
}

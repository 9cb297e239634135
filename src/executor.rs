//! Cross-language execution of a single derivation.
//!
//! The executor receives the upstream artifacts of a node, materialises each
//! one in the node's language, evaluates the body, and applies the node's
//! serializer hook. It never touches the store; the scheduler resolves inputs
//! and persists results.
//!
//! Materialisation picks the first applicable rule for each input:
//!
//! 1. the consumer declares a deserializer hook for it: the hook's codec
//!    decodes the artifact, which must carry the codec's interchange tag;
//! 2. the artifact is already native to the consumer: bound unchanged;
//! 3. otherwise the converter registered for `(artifact format, language)`.

use camino::Utf8Path;
use miette::Diagnostic;
use thiserror::Error;

use crate::artifact::Artifact;
use crate::codec::CodecRegistry;
use crate::convert::{ConversionError, ConverterRegistry};
use crate::derivation::{Body, Derivation};
use crate::fingerprint::resolve_extra_files;
use crate::runtime::{Binding, EvalRequest, Evaluation, RuntimeError, RuntimeRegistry};

/// Node-scoped execution failures.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecutionError {
    /// The body could not be evaluated.
    #[error("derivation '{derivation}' failed to evaluate")]
    #[diagnostic(code(polyflow::execution::runtime_evaluation))]
    RuntimeEvaluation {
        /// Failing derivation.
        derivation: String,
        /// Runtime failure.
        #[source]
        #[diagnostic_source]
        source: RuntimeError,
    },

    /// An input or the result could not be converted.
    #[error("derivation '{derivation}' could not convert {}", .input.as_deref().map_or_else(|| "its result".to_owned(), |name| format!("input '{name}'")))]
    #[diagnostic(code(polyflow::execution::conversion))]
    Conversion {
        /// Failing derivation.
        derivation: String,
        /// Input being materialised, absent for the serializer step.
        input: Option<String>,
        /// Conversion failure.
        #[source]
        #[diagnostic_source]
        source: ConversionError,
    },
}

/// Runs derivations using the registered runtimes, converters, and hooks.
#[derive(Debug, Clone, Copy)]
pub struct Executor<'a> {
    runtimes: &'a RuntimeRegistry,
    converters: &'a ConverterRegistry,
    codecs: &'a CodecRegistry,
}

impl<'a> Executor<'a> {
    /// Borrow the registries used to execute nodes.
    #[must_use]
    pub const fn new(
        runtimes: &'a RuntimeRegistry,
        converters: &'a ConverterRegistry,
        codecs: &'a CodecRegistry,
    ) -> Self {
        Self {
            runtimes,
            converters,
            codecs,
        }
    }

    /// Bring an upstream artifact into `consumer`'s native format.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Conversion`] when no rule applies or the
    /// applicable rule fails.
    pub fn materialise(
        &self,
        consumer: &Derivation,
        input: &str,
        artifact: &Artifact,
    ) -> Result<Artifact, ExecutionError> {
        let language = consumer.language();
        let converted = match consumer.deserializers().for_input(input) {
            Some(hook) => self.codecs.decode(hook, artifact, language),
            None => self.converters.convert(artifact, language),
        };
        converted.map_err(|source| ExecutionError::Conversion {
            derivation: consumer.name().to_owned(),
            input: Some(input.to_owned()),
            source,
        })
    }

    /// Execute `derivation` with its upstream artifacts keyed by name.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError`] when materialisation, evaluation, or
    /// serialization fails.
    pub fn execute(
        &self,
        derivation: &Derivation,
        root: &Utf8Path,
        upstream: &[(String, Artifact)],
    ) -> Result<Artifact, ExecutionError> {
        let bindings = upstream
            .iter()
            .map(|(name, artifact)| {
                Ok(Binding {
                    name: name.clone(),
                    artifact: self.materialise(derivation, name, artifact)?,
                })
            })
            .collect::<Result<Vec<_>, ExecutionError>>()?;

        let native = match derivation.body() {
            Body::Convert { from } => bindings
                .into_iter()
                .find(|binding| binding.name == *from)
                .map(|binding| binding.artifact)
                .ok_or_else(|| {
                    evaluation_error(
                        derivation,
                        RuntimeError::Evaluation(format!("upstream '{from}' was not provided")),
                    )
                })?,
            Body::Expr { source } => {
                self.evaluate(derivation, root, Evaluation::Expr(source), &bindings)?
            }
            Body::Import { path, reader } => self.evaluate(
                derivation,
                root,
                Evaluation::Import {
                    path,
                    reader: reader.as_deref(),
                },
                &bindings,
            )?,
        };

        match derivation.serializer() {
            Some(hook) => self
                .codecs
                .encode(hook, &native)
                .map_err(|source| ExecutionError::Conversion {
                    derivation: derivation.name().to_owned(),
                    input: None,
                    source,
                }),
            None => Ok(native),
        }
    }

    fn evaluate(
        &self,
        derivation: &Derivation,
        root: &Utf8Path,
        body: Evaluation<'_>,
        inputs: &[Binding],
    ) -> Result<Artifact, ExecutionError> {
        let runtime = self
            .runtimes
            .get(derivation.language())
            .map_err(|err| evaluation_error(derivation, err))?;
        let extra_files = resolve_extra_files(root, derivation).map_err(|err| {
            evaluation_error(derivation, RuntimeError::Evaluation(err.to_string()))
        })?;
        let request = EvalRequest {
            derivation: derivation.name(),
            body,
            inputs,
            root,
            extra_files: &extra_files,
        };
        runtime
            .evaluate(&request)
            .map_err(|err| evaluation_error(derivation, err))
    }
}

fn evaluation_error(derivation: &Derivation, source: RuntimeError) -> ExecutionError {
    ExecutionError::RuntimeEvaluation {
        derivation: derivation.name().to_owned(),
        source,
    }
}

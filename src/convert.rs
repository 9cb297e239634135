//! Conversion of artifacts between language-native formats.
//!
//! Converters are keyed by `(source format, target language)`. The defaults
//! cover every pair of built-in languages plus interchange JSON, treating JSON
//! as the common value model:
//!
//! - JSON-native languages (`jinja`, `python`, `r`) exchange canonical JSON,
//!   so converting between them validates and re-tags the bytes.
//! - Shell output is text. Output that parses as JSON is taken as that value;
//!   anything else becomes a JSON string of the trimmed text.
//! - Values handed to shell are written as raw text when they are strings and
//!   as compact JSON otherwise.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::artifact::{Artifact, Format};
use crate::language::Language;

/// Errors raised while converting or decoding artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum ConversionError {
    /// No converter handles the pair.
    #[error("no converter from {from} to {to}")]
    #[diagnostic(
        code(polyflow::convert::no_converter),
        help("declare a serializer on the producer and a matching deserializer on the consumer")
    )]
    NoConverter {
        /// Format of the artifact.
        from: Format,
        /// Language requested.
        to: Language,
    },

    /// A deserializer hook received an artifact its codec cannot read.
    #[error("hook '{hook}' expects {expected} but the upstream artifact is {produced}")]
    #[diagnostic(
        code(polyflow::convert::format_mismatch),
        help("the upstream must declare serializer '{hook}'")
    )]
    FormatMismatch {
        /// Hook identifier.
        hook: String,
        /// Format the upstream produced.
        produced: Format,
        /// Format the hook decodes.
        expected: Format,
    },

    /// The artifact bytes do not match their format.
    #[error("malformed {format} artifact: {reason}")]
    #[diagnostic(code(polyflow::convert::malformed))]
    Malformed {
        /// Declared format.
        format: Format,
        /// What was wrong.
        reason: String,
    },

    /// A hook identifier is not registered.
    #[error("unknown serialization hook '{hook}'")]
    #[diagnostic(
        code(polyflow::convert::unknown_hook),
        help("available hooks: json, text, lines")
    )]
    UnknownHook {
        /// Hook identifier.
        hook: String,
    },
}

impl ConversionError {
    pub(crate) fn malformed(format: &Format, reason: impl fmt::Display) -> Self {
        Self::Malformed {
            format: format.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Function converting an artifact into a target language's native format.
pub type ConvertFn = dyn Fn(&Artifact) -> Result<Artifact, ConversionError> + Send + Sync;

/// Registry of converters keyed by `(source format, target language)`.
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    converters: HashMap<(Format, Language), Arc<ConvertFn>>,
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .converters
            .keys()
            .map(|(from, to)| format!("{from} -> {to}"))
            .collect();
        keys.sort();
        f.debug_struct("ConverterRegistry")
            .field("converters", &keys)
            .finish()
    }
}

impl ConverterRegistry {
    /// A registry with no converters.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry holding the built-in converters.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let sources = Language::ALL
            .iter()
            .map(|lang| Format::Native(*lang))
            .chain([Format::json()]);
        for from in sources {
            for to in Language::ALL {
                if from == Format::Native(to) {
                    continue;
                }
                registry.register(from.clone(), to, move |artifact: &Artifact| {
                    let value = to_value(artifact)?;
                    from_value(&value, to)
                });
            }
        }
        registry
    }

    /// Register (or replace) the converter for `(from, to)`.
    pub fn register<F>(&mut self, from: Format, to: Language, convert: F)
    where
        F: Fn(&Artifact) -> Result<Artifact, ConversionError> + Send + Sync + 'static,
    {
        self.converters.insert((from, to), Arc::new(convert));
    }

    /// Whether a converter exists for the pair.
    #[must_use]
    pub fn supports(&self, from: &Format, to: Language) -> bool {
        *from == Format::Native(to) || self.converters.contains_key(&(from.clone(), to))
    }

    /// Convert `artifact` into the native format of `to`.
    ///
    /// Artifacts already native to `to` are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::NoConverter`] when the pair is unregistered,
    /// or the converter's own error.
    pub fn convert(&self, artifact: &Artifact, to: Language) -> Result<Artifact, ConversionError> {
        if *artifact.format() == Format::Native(to) {
            return Ok(artifact.clone());
        }
        let converter = self
            .converters
            .get(&(artifact.format().clone(), to))
            .ok_or_else(|| ConversionError::NoConverter {
                from: artifact.format().clone(),
                to,
            })?;
        let converted = converter(artifact)?;
        tracing::debug!(from = %artifact.format(), to = %to, "converted artifact");
        Ok(converted)
    }
}

/// Interpret an artifact as a JSON value.
///
/// # Errors
///
/// Returns [`ConversionError::Malformed`] when the bytes do not decode.
pub fn to_value(artifact: &Artifact) -> Result<Value, ConversionError> {
    let format = artifact.format();
    match format {
        Format::Native(Language::Shell) => {
            let text = utf8(artifact)?;
            let trimmed = text.trim();
            Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_owned())))
        }
        Format::Native(_) => artifact
            .to_json()
            .map_err(|err| ConversionError::malformed(format, err)),
        Format::Interchange(name) => match name.as_str() {
            "json" => artifact
                .to_json()
                .map_err(|err| ConversionError::malformed(format, err)),
            "text" => Ok(Value::String(utf8(artifact)?.to_owned())),
            "lines" => Ok(Value::Array(
                utf8(artifact)?
                    .lines()
                    .map(|line| Value::String(line.to_owned()))
                    .collect(),
            )),
            _ => Err(ConversionError::malformed(
                format,
                "no JSON interpretation for this interchange format",
            )),
        },
    }
}

/// Encode a JSON value in the native format of `lang`.
///
/// # Errors
///
/// Returns [`ConversionError::Malformed`] when the value cannot be encoded.
pub fn from_value(value: &Value, lang: Language) -> Result<Artifact, ConversionError> {
    let format = Format::Native(lang);
    if lang.is_json_native() {
        return Artifact::from_json(format.clone(), value)
            .map_err(|err| ConversionError::malformed(&format, err));
    }
    Ok(Artifact::new(format, shell_text(value).into_bytes()))
}

/// Text form of a value as seen by shell: strings verbatim, anything else as
/// compact JSON.
pub(crate) fn shell_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn utf8(artifact: &Artifact) -> Result<&str, ConversionError> {
    std::str::from_utf8(artifact.bytes())
        .map_err(|err| ConversionError::malformed(artifact.format(), err))
}

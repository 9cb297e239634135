//! Derivation model.
//!
//! A [`Derivation`] is one named pipeline step: a language, a [`Body`], the
//! upstream names it declares, optional serialization hooks, and any extra
//! files the body needs. A [`Pipeline`] is the ordered list of derivations
//! submitted together, anchored at a root directory against which relative
//! paths resolve.
//!
//! # Examples
//!
//! ```
//! use polyflow::derivation::{Derivation, Pipeline};
//! use polyflow::language::Language;
//!
//! let pipeline = Pipeline::new(".")
//!     .with(Derivation::expr("a", Language::Jinja, "[1, 2, 3]"))
//!     .with(Derivation::expr("b", Language::Jinja, "a | sum"));
//! assert_eq!(pipeline.derivations().len(), 2);
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::Serialize;

use crate::ast::{BodySpec, HookSpec, PipelineManifest};
use crate::language::Language;

/// What a derivation computes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Body {
    /// Literal source expression in the derivation's language.
    Expr {
        /// Expression text, hashed verbatim.
        source: String,
    },
    /// Materialise an external file with a reader function.
    Import {
        /// Path relative to the pipeline root.
        path: Utf8PathBuf,
        /// Reader function; runtimes fall back to a default when absent.
        reader: Option<String>,
    },
    /// Convert a prior derivation's value into this derivation's language.
    Convert {
        /// Name of the converted derivation.
        from: String,
    },
}

impl Body {
    /// Short tag distinguishing the body variants.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Expr { .. } => "expr",
            Self::Import { .. } => "import",
            Self::Convert { .. } => "convert",
        }
    }
}

/// Deserializer hooks attached to a consuming derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Deserializers {
    /// Hook applied to inputs without a specific entry.
    pub default: Option<String>,
    /// Hooks keyed by upstream name.
    pub per_input: IndexMap<String, String>,
}

impl Deserializers {
    /// Hook to use for the named input, if any.
    #[must_use]
    pub fn for_input(&self, input: &str) -> Option<&str> {
        self.per_input
            .get(input)
            .or(self.default.as_ref())
            .map(String::as_str)
    }

    /// Whether no hook is declared at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.per_input.is_empty()
    }
}

impl From<HookSpec> for Deserializers {
    fn from(spec: HookSpec) -> Self {
        match spec {
            HookSpec::All(hook) => Self {
                default: Some(hook),
                per_input: IndexMap::new(),
            },
            HookSpec::PerInput(per_input) => Self {
                default: None,
                per_input,
            },
        }
    }
}

/// A named pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Derivation {
    name: String,
    language: Language,
    body: Body,
    inputs: Vec<String>,
    serializer: Option<String>,
    deserializers: Deserializers,
    extra_files: Vec<String>,
    description: Option<String>,
}

impl Derivation {
    fn with_body(name: impl Into<String>, language: Language, body: Body) -> Self {
        Self {
            name: name.into(),
            language,
            body,
            inputs: Vec::new(),
            serializer: None,
            deserializers: Deserializers::default(),
            extra_files: Vec::new(),
            description: None,
        }
    }

    /// Derivation evaluating `source` in `language`.
    #[must_use]
    pub fn expr(name: impl Into<String>, language: Language, source: impl Into<String>) -> Self {
        Self::with_body(
            name,
            language,
            Body::Expr {
                source: source.into(),
            },
        )
    }

    /// Source derivation reading `path` with `reader`.
    #[must_use]
    pub fn import(
        name: impl Into<String>,
        language: Language,
        path: impl Into<Utf8PathBuf>,
        reader: Option<&str>,
    ) -> Self {
        Self::with_body(
            name,
            language,
            Body::Import {
                path: path.into(),
                reader: reader.map(str::to_owned),
            },
        )
    }

    /// Derivation converting the value of `from` into `language`.
    #[must_use]
    pub fn convert(name: impl Into<String>, language: Language, from: impl Into<String>) -> Self {
        Self::with_body(name, language, Body::Convert { from: from.into() })
    }

    /// Declare additional upstream names.
    #[must_use]
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Attach a serializer hook.
    #[must_use]
    pub fn with_serializer(mut self, hook: impl Into<String>) -> Self {
        self.serializer = Some(hook.into());
        self
    }

    /// Attach deserializer hooks.
    #[must_use]
    pub fn with_deserializers(mut self, hooks: impl Into<Deserializers>) -> Self {
        self.deserializers = hooks.into();
        self
    }

    /// Declare extra files or glob patterns.
    #[must_use]
    pub fn with_extra_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_files.extend(files.into_iter().map(Into::into));
        self
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Unique name of the derivation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime the body is evaluated in.
    #[must_use]
    pub const fn language(&self) -> Language {
        self.language
    }

    /// The body.
    #[must_use]
    pub const fn body(&self) -> &Body {
        &self.body
    }

    /// Explicitly declared upstream names.
    #[must_use]
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Serializer hook identifier.
    #[must_use]
    pub fn serializer(&self) -> Option<&str> {
        self.serializer.as_deref()
    }

    /// Deserializer hooks.
    #[must_use]
    pub const fn deserializers(&self) -> &Deserializers {
        &self.deserializers
    }

    /// Extra files or glob patterns.
    #[must_use]
    pub fn extra_files(&self) -> &[String] {
        &self.extra_files
    }

    /// Optional description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// An ordered list of derivations sharing a root directory.
#[derive(Debug, Clone, Serialize)]
pub struct Pipeline {
    root: Utf8PathBuf,
    derivations: Vec<Derivation>,
}

impl Pipeline {
    /// Create an empty pipeline rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            derivations: Vec::new(),
        }
    }

    /// Append a derivation.
    #[must_use]
    pub fn with(mut self, derivation: Derivation) -> Self {
        self.derivations.push(derivation);
        self
    }

    /// Append a derivation in place.
    pub fn push(&mut self, derivation: Derivation) {
        self.derivations.push(derivation);
    }

    /// Lower a parsed manifest into a pipeline rooted at `root`.
    #[must_use]
    pub fn from_manifest(manifest: PipelineManifest, root: impl Into<Utf8PathBuf>) -> Self {
        let mut pipeline = Self::new(root);
        for spec in manifest.derivations {
            let body = match spec.body {
                BodySpec::Expr { expr } => Body::Expr { source: expr },
                BodySpec::Import { import } => Body::Import {
                    path: import.path,
                    reader: import.reader,
                },
                BodySpec::Convert { convert } => Body::Convert { from: convert },
            };
            let mut derivation = Derivation::with_body(spec.name, spec.language, body)
                .with_inputs(spec.inputs.to_vec())
                .with_extra_files(spec.extra_files.to_vec());
            derivation.serializer = spec.serializer;
            derivation.deserializers = spec.deserializer.map(Into::into).unwrap_or_default();
            derivation.description = spec.description;
            pipeline.push(derivation);
        }
        pipeline
    }

    /// Root directory for relative paths.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Derivations in declaration order.
    #[must_use]
    pub fn derivations(&self) -> &[Derivation] {
        &self.derivations
    }

    /// Look up a derivation by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Derivation> {
        self.derivations.iter().find(|d| d.name == name)
    }
}

//! Pipeline manifest Abstract Syntax Tree structures.
//!
//! These types mirror the YAML schema of a `Pipeline.yml` file. They are a
//! faithful, serde-friendly view of the document; validation and reference
//! resolution happen later when the manifest is lowered into a
//! [`crate::derivation::Pipeline`].
//!
//! ```rust
//! use polyflow::ast::{BodySpec, PipelineManifest};
//!
//! let json = serde_json::json!({
//!     "polyflow_version": "1.0.0",
//!     "derivations": [
//!         { "name": "a", "language": "jinja", "expr": "[1, 2, 3]" }
//!     ]
//! });
//! let manifest: PipelineManifest = serde_json::from_value(json).expect("parse");
//! assert!(matches!(manifest.derivations[0].body, BodySpec::Expr { .. }));
//! ```

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use semver::Version;
use serde::{Deserialize, Serialize, de::Deserializer};

use crate::language::Language;

/// Top-level manifest parsed from a `Pipeline.yml`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineManifest {
    /// Semantic version of the manifest format.
    pub polyflow_version: Version,

    /// Optional free-form description of the pipeline.
    #[serde(default)]
    pub description: Option<String>,

    /// Ordered derivation declarations.
    pub derivations: Vec<DerivationSpec>,
}

/// A single derivation declaration.
#[derive(Debug, Deserialize, Serialize)]
pub struct DerivationSpec {
    /// Unique identifier of the derivation.
    pub name: String,

    /// Runtime used to evaluate the body.
    pub language: Language,

    /// What the derivation computes.
    #[serde(flatten)]
    pub body: BodySpec,

    /// Upstream derivations bound into the body even when not referenced
    /// textually.
    #[serde(default)]
    pub inputs: StringOrList,

    /// Hook applied to the result before it is stored.
    #[serde(default)]
    pub serializer: Option<String>,

    /// Hook(s) applied to upstream artifacts before evaluation.
    #[serde(default)]
    pub deserializer: Option<HookSpec>,

    /// Additional files (or glob patterns) the body needs.
    #[serde(default)]
    pub extra_files: StringOrList,

    /// Human-readable summary. Not part of the fingerprint.
    #[serde(default)]
    pub description: Option<String>,
}

/// Body of a derivation.
///
/// The fields are flattened in the manifest, so exactly one of `expr`,
/// `import`, or `convert` must be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BodySpec {
    /// A source expression in the derivation's language.
    Expr {
        /// Expression text.
        expr: String,
    },
    /// Read an external file with a reader function.
    Import {
        /// File and reader to use.
        import: ImportSpec,
    },
    /// Convert another derivation's value into this derivation's language.
    Convert {
        /// Name of the derivation being converted.
        convert: String,
    },
}

impl<'de> Deserialize<'de> for BodySpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawBody {
            expr: Option<String>,
            import: Option<ImportSpec>,
            convert: Option<String>,
        }

        let raw = RawBody::deserialize(deserializer)?;
        match (raw.expr, raw.import, raw.convert) {
            (Some(expr), None, None) => Ok(Self::Expr { expr }),
            (None, Some(import), None) => Ok(Self::Import { import }),
            (None, None, Some(convert)) => Ok(Self::Convert { convert }),
            (None, None, None) => Err(serde::de::Error::custom(
                "missing one of expr, import, or convert",
            )),
            (expr, import, convert) => {
                let present: Vec<&str> = [
                    ("expr", expr.is_some()),
                    ("import", import.is_some()),
                    ("convert", convert.is_some()),
                ]
                .into_iter()
                .filter_map(|(name, is_present)| is_present.then_some(name))
                .collect();
                Err(serde::de::Error::custom(format!(
                    "fields {} are mutually exclusive",
                    present.join(", ")
                )))
            }
        }
    }
}

/// File import rule for source derivations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ImportSpec {
    /// Path relative to the pipeline root.
    pub path: Utf8PathBuf,
    /// Reader function; each runtime supplies a default when omitted.
    #[serde(default)]
    pub reader: Option<String>,
}

/// Deserializer hooks: one for every input, or one per named input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HookSpec {
    /// Apply the same hook to every upstream artifact.
    All(String),
    /// Apply hooks to specific inputs only.
    PerInput(IndexMap<String, String>),
}

/// A helper for fields that accept either a single string or a list of
/// strings.
///
/// ```yaml
/// # Scalar
/// inputs: raw
/// # Sequence
/// inputs:
///   - raw
///   - lookup
/// ```
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum StringOrList {
    /// No value provided.
    #[default]
    Empty,
    /// A single string item.
    String(String),
    /// A list of string items.
    List(Vec<String>),
}

impl StringOrList {
    /// Flatten into an owned list.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Empty => Vec::new(),
            Self::String(s) => vec![s.clone()],
            Self::List(items) => items.clone(),
        }
    }
}

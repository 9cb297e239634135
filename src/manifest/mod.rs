//! Manifest loading.
//!
//! A `Pipeline.yml` is parsed in two passes: YAML into a generic document,
//! then the document into [`PipelineManifest`]. Syntax errors keep their
//! source location so `miette` can point at the offending line; schema errors
//! name the manifest and the field. Only manifests whose `polyflow_version`
//! has major version 1 are accepted.

mod diagnostics;

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use miette::Diagnostic;
use semver::Version;
use thiserror::Error;

use crate::ast::PipelineManifest;
use crate::derivation::Pipeline;

pub use diagnostics::{ManifestName, ManifestSource, map_data_error, map_yaml_error};

/// Default manifest file name.
pub const DEFAULT_MANIFEST: &str = "Pipeline.yml";

/// Major manifest version understood by this release.
pub const SUPPORTED_MAJOR: u64 = 1;

/// Errors raised while loading a manifest.
#[derive(Debug, Error, Diagnostic)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("cannot read manifest '{path}'")]
    #[diagnostic(
        code(polyflow::manifest::read),
        help("run polyflow from the pipeline directory or pass --file")
    )]
    Read {
        /// Path that was attempted.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// The manifest is not valid YAML or does not match the schema.
    #[error("manifest parse error")]
    #[diagnostic(code(polyflow::manifest::parse))]
    Parse {
        /// Located diagnostic.
        #[source]
        #[diagnostic_source]
        source: Box<dyn Diagnostic + Send + Sync + 'static>,
    },

    /// The manifest declares a version this release cannot read.
    #[error("unsupported polyflow_version {version}")]
    #[diagnostic(
        code(polyflow::manifest::unsupported_version),
        help("this release reads manifests with polyflow_version 1.x")
    )]
    UnsupportedVersion {
        /// Declared version.
        version: Version,
    },
}

/// Parse manifest text, naming it `name` in diagnostics.
///
/// # Errors
///
/// Returns [`ManifestError`] when parsing fails or the version is
/// unsupported.
pub fn from_str_named(yaml: &str, name: &ManifestName) -> Result<PipelineManifest, ManifestError> {
    let doc: serde_json::Value =
        serde_saphyr::from_str(yaml).map_err(|err| ManifestError::Parse {
            source: map_yaml_error(err, &ManifestSource::from(yaml), name),
        })?;
    let manifest: PipelineManifest =
        serde_json::from_value(doc).map_err(|err| ManifestError::Parse {
            source: map_data_error(err, name),
        })?;
    if manifest.polyflow_version.major != SUPPORTED_MAJOR {
        return Err(ManifestError::UnsupportedVersion {
            version: manifest.polyflow_version,
        });
    }
    tracing::debug!(
        manifest = %name,
        derivations = manifest.derivations.len(),
        "parsed manifest"
    );
    Ok(manifest)
}

/// Parse manifest text.
///
/// # Errors
///
/// See [`from_str_named`].
pub fn from_str(yaml: &str) -> Result<PipelineManifest, ManifestError> {
    from_str_named(yaml, &ManifestName::new(DEFAULT_MANIFEST))
}

/// Read and parse the manifest at `path`.
///
/// # Errors
///
/// Returns [`ManifestError::Read`] when the file cannot be read, otherwise
/// see [`from_str_named`].
pub fn from_path(path: &Utf8Path) -> Result<PipelineManifest, ManifestError> {
    let data = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_owned(),
        source,
    })?;
    from_str_named(&data, &ManifestName::new(path.as_str()))
}

/// Load the pipeline at `path`, rooted at the manifest's directory.
///
/// # Errors
///
/// See [`from_path`].
pub fn load_pipeline(path: &Utf8Path) -> Result<Pipeline, ManifestError> {
    let manifest = from_path(path)?;
    let root = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_owned(),
        _ => Utf8PathBuf::from("."),
    };
    Ok(Pipeline::from_manifest(manifest, root))
}

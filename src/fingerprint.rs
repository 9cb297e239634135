//! Fingerprint computation.
//!
//! A node's fingerprint is a SHA-256 digest over its own definition and the
//! fingerprints of its upstream nodes, making the scheme Merkle-style: editing
//! one derivation changes its fingerprint and that of every node downstream of
//! it, while unrelated branches keep theirs.
//!
//! Every variable-length field is written with a `len:` prefix so adjacent
//! fields cannot run together. Source text is hashed verbatim; two bodies that
//! differ only in formatting produce different fingerprints.
//!
//! The derivation name and description are not hashed. Upstreams are hashed
//! as `(binding name, fingerprint)` pairs sorted by name, so swapping which
//! derivation is bound under which name is still detected.
//!
//! # Examples
//!
//! ```
//! use polyflow::derivation::{Derivation, Pipeline};
//! use polyflow::fingerprint::FingerprintEngine;
//! use polyflow::graph::Dag;
//! use polyflow::language::Language;
//!
//! let pipeline = Pipeline::new(".")
//!     .with(Derivation::expr("a", Language::Jinja, "[1, 2, 3]"));
//! let dag = Dag::from_pipeline(&pipeline).expect("dag");
//! let fingerprints = FingerprintEngine::new(&dag).compute().expect("hash");
//! assert_eq!(fingerprints.get(0).map(|fp| fp.as_str().len()), Some(64));
//! ```

use std::io::{self, Read};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use miette::Diagnostic;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::artifact::Fingerprint;
use crate::derivation::{Body, Derivation};
use crate::graph::{Dag, Node, NodeId};

/// Errors raised while fingerprinting.
#[derive(Debug, Error, Diagnostic)]
pub enum FingerprintError {
    /// A file that feeds the fingerprint could not be read.
    #[error("cannot hash '{path}' for derivation '{derivation}'")]
    #[diagnostic(
        code(polyflow::fingerprint::hash_computation),
        help("files must exist and live inside the pipeline directory")
    )]
    HashComputation {
        /// Derivation declaring the file.
        derivation: String,
        /// Path relative to the pipeline root.
        path: Utf8PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// A glob pattern in `extra_files` matched nothing.
    #[error("pattern '{pattern}' for derivation '{derivation}' matched no files")]
    #[diagnostic(code(polyflow::fingerprint::no_matches))]
    NoMatches {
        /// Derivation declaring the pattern.
        derivation: String,
        /// The pattern.
        pattern: String,
    },

    /// A glob pattern in `extra_files` is malformed.
    #[error("invalid pattern '{pattern}' for derivation '{derivation}'")]
    #[diagnostic(code(polyflow::fingerprint::invalid_pattern))]
    InvalidPattern {
        /// Derivation declaring the pattern.
        derivation: String,
        /// The pattern.
        pattern: String,
        /// Parser failure.
        #[source]
        source: glob::PatternError,
    },
}

/// Fingerprints for every node of a [`Dag`], indexed by [`NodeId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprints(Vec<Fingerprint>);

impl Fingerprints {
    /// Fingerprint of the given node.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Fingerprint> {
        self.0.get(id)
    }

    /// Iterate over `(node id, fingerprint)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Fingerprint)> {
        self.0.iter().enumerate()
    }
}

/// Computes fingerprints for a graph, memoising each node once.
pub struct FingerprintEngine<'a> {
    dag: &'a Dag,
    root: Option<Dir>,
}

impl<'a> FingerprintEngine<'a> {
    /// Prepare an engine for `dag`.
    #[must_use]
    pub const fn new(dag: &'a Dag) -> Self {
        Self { dag, root: None }
    }

    /// Fingerprint every node in build order.
    ///
    /// # Errors
    ///
    /// Returns [`FingerprintError`] when an import or extra file cannot be
    /// read or a pattern is invalid or matches nothing.
    pub fn compute(mut self) -> Result<Fingerprints, FingerprintError> {
        let dag = self.dag;
        let mut computed: Vec<Option<Fingerprint>> = vec![None; dag.len()];
        for node in dag.build_order() {
            let upstream = upstream_pairs(dag, node, &computed);
            let fingerprint = self.hash_node(node.derivation(), &upstream)?;
            tracing::debug!(
                derivation = node.name(),
                fingerprint = fingerprint.short(),
                "fingerprinted derivation"
            );
            if let Some(slot) = computed.get_mut(node.id()) {
                *slot = Some(fingerprint);
            }
        }
        let all = computed
            .into_iter()
            .map(|fp| {
                fp.unwrap_or_else(|| {
                    debug_assert!(false, "every node is visited in build order");
                    Fingerprint::new_unchecked(String::new())
                })
            })
            .collect();
        Ok(Fingerprints(all))
    }

    fn hash_node(
        &mut self,
        derivation: &Derivation,
        upstream: &[(&str, &Fingerprint)],
    ) -> Result<Fingerprint, FingerprintError> {
        let mut hasher = Sha256::new();
        hasher.update(b"lang");
        update_with_len(&mut hasher, derivation.language().tag().as_bytes());
        self.hash_body(&mut hasher, derivation)?;
        hash_optional_string(&mut hasher, derivation.serializer());
        Self::hash_deserializers(&mut hasher, derivation);
        self.hash_extra_files(&mut hasher, derivation)?;

        hasher.update(b"up");
        update_with_len(&mut hasher, upstream.len().to_string().as_bytes());
        for (name, fp) in upstream {
            update_with_len(&mut hasher, name.as_bytes());
            update_with_len(&mut hasher, fp.as_str().as_bytes());
        }
        Ok(Fingerprint::new_unchecked(format!("{:x}", hasher.finalize())))
    }

    fn hash_body(
        &mut self,
        hasher: &mut Sha256,
        derivation: &Derivation,
    ) -> Result<(), FingerprintError> {
        hasher.update(derivation.body().kind().as_bytes());
        match derivation.body() {
            Body::Expr { source } => update_with_len(hasher, source.as_bytes()),
            Body::Import { path, reader } => {
                update_with_len(hasher, path.as_str().as_bytes());
                hash_optional_string(hasher, reader.as_deref());
                let digest = self.hash_file(derivation, path)?;
                update_with_len(hasher, digest.as_bytes());
            }
            Body::Convert { from } => update_with_len(hasher, from.as_bytes()),
        }
        Ok(())
    }

    fn hash_deserializers(hasher: &mut Sha256, derivation: &Derivation) {
        let hooks = derivation.deserializers();
        hash_optional_string(hasher, hooks.default.as_deref());
        let mut per_input: Vec<(&String, &String)> = hooks.per_input.iter().collect();
        per_input.sort_unstable();
        update_with_len(hasher, per_input.len().to_string().as_bytes());
        for (input, hook) in per_input {
            update_with_len(hasher, input.as_bytes());
            update_with_len(hasher, hook.as_bytes());
        }
    }

    fn hash_extra_files(
        &mut self,
        hasher: &mut Sha256,
        derivation: &Derivation,
    ) -> Result<(), FingerprintError> {
        let files = resolve_extra_files(self.dag.root(), derivation)?;
        hasher.update(b"files");
        update_with_len(hasher, files.len().to_string().as_bytes());
        for path in &files {
            let digest = self.hash_file(derivation, path)?;
            update_with_len(hasher, path.as_str().as_bytes());
            update_with_len(hasher, digest.as_bytes());
        }
        Ok(())
    }

    fn hash_file(
        &mut self,
        derivation: &Derivation,
        path: &Utf8Path,
    ) -> Result<String, FingerprintError> {
        let failure = |source: io::Error| FingerprintError::HashComputation {
            derivation: derivation.name().to_owned(),
            path: path.to_owned(),
            source,
        };
        let dir = self.root_dir().map_err(failure)?;
        hash_stream(dir, path).map_err(failure)
    }

    fn root_dir(&mut self) -> io::Result<&Dir> {
        if self.root.is_none() {
            let root = if self.dag.root().as_str().is_empty() {
                Utf8Path::new(".")
            } else {
                self.dag.root()
            };
            self.root = Some(Dir::open_ambient_dir(root, ambient_authority())?);
        }
        self.root
            .as_ref()
            .ok_or_else(|| io::Error::other("pipeline root unavailable"))
    }
}

/// Upstream `(binding name, fingerprint)` pairs sorted by name.
fn upstream_pairs<'n>(
    dag: &'n Dag,
    node: &Node,
    computed: &'n [Option<Fingerprint>],
) -> Vec<(&'n str, &'n Fingerprint)> {
    let mut pairs: Vec<(&str, &Fingerprint)> = node
        .upstream()
        .iter()
        .filter_map(|&id| {
            let name = dag.node(id)?.name();
            let fp = computed.get(id)?.as_ref()?;
            Some((name, fp))
        })
        .collect();
    pairs.sort_unstable();
    pairs
}

/// Expand `extra_files` into sorted paths relative to `root`.
///
/// Entries without glob metacharacters are taken literally; patterns must
/// match at least one file.
pub(crate) fn resolve_extra_files(
    root: &Utf8Path,
    derivation: &Derivation,
) -> Result<Vec<Utf8PathBuf>, FingerprintError> {
    let mut files = Vec::new();
    for entry in derivation.extra_files() {
        if !entry.contains(['*', '?', '[']) {
            files.push(Utf8PathBuf::from(entry));
            continue;
        }
        let pattern = root.join(entry);
        let matches = glob::glob(pattern.as_str()).map_err(|source| {
            FingerprintError::InvalidPattern {
                derivation: derivation.name().to_owned(),
                pattern: entry.clone(),
                source,
            }
        })?;
        let before = files.len();
        for path in matches.flatten() {
            let Ok(path) = Utf8PathBuf::try_from(path) else {
                continue;
            };
            if !path.is_file() {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(root) {
                files.push(relative.to_owned());
            }
        }
        if files.len() == before {
            return Err(FingerprintError::NoMatches {
                derivation: derivation.name().to_owned(),
                pattern: entry.clone(),
            });
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn hash_stream(dir: &Dir, path: &Utf8Path) -> io::Result<String> {
    let mut file = dir.open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        let chunk = buffer.get(..read).unwrap_or_else(|| {
            debug_assert!(false, "read beyond buffer capacity: {read} bytes");
            buffer.as_slice()
        });
        hasher.update(chunk);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_optional_string(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        Some(v) => {
            hasher.update(b"1");
            update_with_len(hasher, v.as_bytes());
        }
        None => hasher.update(b"0"),
    }
}

fn update_with_len(hasher: &mut Sha256, bytes: &[u8]) {
    let len = bytes.len();
    hasher.update(format!("{len}:").as_bytes());
    hasher.update(bytes);
}

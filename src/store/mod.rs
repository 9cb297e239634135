//! Content-addressed artifact storage.
//!
//! A [`Store`] maps fingerprints to immutable artifacts. Entries are only ever
//! added: `put` on an existing fingerprint keeps the first write, and removal
//! happens solely through explicit garbage collection. The engine receives the
//! store as a trait object so tests can use [`MemoryStore`] while the CLI uses
//! the durable [`FsStore`].

mod fs;
mod memory;

use std::io;

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

use crate::artifact::{Artifact, ArtifactRef, Fingerprint};

pub use fs::FsStore;
pub use memory::MemoryStore;

/// Errors raised by store implementations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// No artifact is stored under the fingerprint.
    #[error("no artifact stored for fingerprint {0}")]
    #[diagnostic(code(polyflow::store::not_found))]
    NotFound(Fingerprint),

    /// Reading or writing the durable medium failed.
    #[error("store I/O failed at '{path}'")]
    #[diagnostic(code(polyflow::store::io))]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// Stored metadata could not be decoded.
    #[error("corrupt store entry at '{path}': {reason}")]
    #[diagnostic(
        code(polyflow::store::corrupt),
        help("remove the entry so it is rebuilt on the next run")
    )]
    Corrupt {
        /// Path of the entry.
        path: Utf8PathBuf,
        /// What was wrong.
        reason: String,
    },
}

/// Immutable, content-addressed artifact storage.
///
/// Implementations must be safe to share between worker threads.
pub trait Store: Send + Sync {
    /// Persist `artifact` under `fingerprint`.
    ///
    /// Re-putting an existing fingerprint is a no-op returning the existing
    /// reference; the stored bytes are never replaced.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn put(&self, fingerprint: &Fingerprint, artifact: &Artifact)
    -> Result<ArtifactRef, StoreError>;

    /// Load the artifact stored under `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when nothing is stored, or another
    /// variant when reading fails.
    fn get(&self, fingerprint: &Fingerprint) -> Result<Artifact, StoreError>;

    /// Reference to the stored artifact, if present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lookup fails.
    fn locate(&self, fingerprint: &Fingerprint) -> Result<Option<ArtifactRef>, StoreError>;

    /// Every stored fingerprint, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when listing fails.
    fn fingerprints(&self) -> Result<Vec<Fingerprint>, StoreError>;

    /// Delete an entry. Only garbage collection calls this.
    ///
    /// Returns whether an entry was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when deletion fails.
    fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError>;

    /// Whether an artifact exists for `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lookup fails.
    fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        Ok(self.locate(fingerprint)?.is_some())
    }
}

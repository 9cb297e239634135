//! In-memory store used by tests and plan-only tooling.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::artifact::{Artifact, ArtifactRef, Fingerprint};

use super::{Store, StoreError};

/// Store backed by a map guarded by a mutex. Contents vanish on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<Fingerprint, Artifact>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Fingerprint, Artifact>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn reference(fingerprint: &Fingerprint, artifact: &Artifact) -> ArtifactRef {
    ArtifactRef {
        fingerprint: fingerprint.clone(),
        format: artifact.format().clone(),
        size: artifact.bytes().len() as u64,
        location: format!("memory:{fingerprint}"),
    }
}

impl Store for MemoryStore {
    fn put(
        &self,
        fingerprint: &Fingerprint,
        artifact: &Artifact,
    ) -> Result<ArtifactRef, StoreError> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(fingerprint) {
            if existing != artifact {
                tracing::warn!(
                    fingerprint = fingerprint.short(),
                    "ignoring differing artifact for stored fingerprint"
                );
            }
            return Ok(reference(fingerprint, existing));
        }
        entries.insert(fingerprint.clone(), artifact.clone());
        Ok(reference(fingerprint, artifact))
    }

    fn get(&self, fingerprint: &Fingerprint) -> Result<Artifact, StoreError> {
        self.lock()
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(fingerprint.clone()))
    }

    fn locate(&self, fingerprint: &Fingerprint) -> Result<Option<ArtifactRef>, StoreError> {
        Ok(self
            .lock()
            .get(fingerprint)
            .map(|artifact| reference(fingerprint, artifact)))
    }

    fn fingerprints(&self) -> Result<Vec<Fingerprint>, StoreError> {
        Ok(self.lock().keys().cloned().collect())
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        Ok(self.lock().remove(fingerprint).is_some())
    }
}

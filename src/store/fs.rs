//! Durable store on the local filesystem.
//!
//! Entries are sharded by the first two hex characters of the fingerprint:
//!
//! ```text
//! <root>/<fp[0..2]>/<fp>/artifact
//! <root>/<fp[0..2]>/<fp>/meta.json
//! ```
//!
//! Each entry is assembled in a temporary directory under `<root>` and
//! renamed into place, so readers observe either a complete entry or nothing.
//! Losing a rename race to another writer is not an error: the first entry
//! stays.

use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::artifact::{Artifact, ArtifactRef, Fingerprint, Format};

use super::{Store, StoreError};

const ARTIFACT_FILE: &str = "artifact";
const META_FILE: &str = "meta.json";
const DEFAULT_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    fingerprint: Fingerprint,
    format: Format,
    size: u64,
}

/// Store rooted at a directory on disk.
#[derive(Debug)]
pub struct FsStore {
    root: Utf8PathBuf,
    cache: Mutex<LruCache<Fingerprint, Artifact>>,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the root cannot be created.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            cache: Mutex::new(LruCache::new(capacity(DEFAULT_CACHE_CAPACITY))),
        })
    }

    /// Bound the in-memory read cache to `entries` artifacts (minimum one).
    #[must_use]
    pub fn with_cache_capacity(self, entries: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity(entries))),
            ..self
        }
    }

    /// Directory holding the entries.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn entry_dir(&self, fingerprint: &Fingerprint) -> Utf8PathBuf {
        let hex = fingerprint.as_str();
        let shard = hex.get(..2).unwrap_or(hex);
        self.root.join(shard).join(hex)
    }

    fn lock_cache(&self) -> MutexGuard<'_, LruCache<Fingerprint, Artifact>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_meta(&self, fingerprint: &Fingerprint) -> Result<Option<Meta>, StoreError> {
        let path = self.entry_dir(fingerprint).join(META_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let meta: Meta = serde_json::from_str(&text).map_err(|err| StoreError::Corrupt {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        if &meta.fingerprint != fingerprint {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("metadata names fingerprint {}", meta.fingerprint),
            });
        }
        Ok(Some(meta))
    }

    fn reference(&self, meta: Meta) -> ArtifactRef {
        let location = self.entry_dir(&meta.fingerprint).join(ARTIFACT_FILE);
        ArtifactRef {
            fingerprint: meta.fingerprint,
            format: meta.format,
            size: meta.size,
            location: location.into_string(),
        }
    }

    fn write_entry(
        &self,
        fingerprint: &Fingerprint,
        artifact: &Artifact,
    ) -> Result<(), StoreError> {
        let io_err = |path: &Utf8Path| {
            let path = path.to_owned();
            move |source: io::Error| StoreError::Io { path, source }
        };
        let staging = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempdir_in(&self.root)
            .map_err(io_err(&self.root))?;
        let staging_path = Utf8Path::from_path(staging.path())
            .map(Utf8Path::to_owned)
            .ok_or_else(|| StoreError::Corrupt {
                path: self.root.clone(),
                reason: "staging directory path is not UTF-8".to_owned(),
            })?;

        let meta = Meta {
            fingerprint: fingerprint.clone(),
            format: artifact.format().clone(),
            size: artifact.bytes().len() as u64,
        };
        let artifact_path = staging_path.join(ARTIFACT_FILE);
        fs::write(&artifact_path, artifact.bytes()).map_err(io_err(&artifact_path))?;
        let meta_path = staging_path.join(META_FILE);
        let meta_json = serde_json::to_vec_pretty(&meta).map_err(|err| StoreError::Corrupt {
            path: meta_path.clone(),
            reason: err.to_string(),
        })?;
        fs::write(&meta_path, meta_json).map_err(io_err(&meta_path))?;

        let target = self.entry_dir(fingerprint);
        if let Some(shard) = target.parent() {
            fs::create_dir_all(shard).map_err(io_err(shard))?;
        }
        // On success the staging guard finds nothing left to clean up.
        if let Err(source) = fs::rename(&staging_path, &target)
            && !target.join(META_FILE).is_file()
        {
            return Err(StoreError::Io {
                path: target,
                source,
            });
        }
        drop(staging);
        Ok(())
    }
}

fn capacity(entries: usize) -> NonZeroUsize {
    NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN)
}

impl Store for FsStore {
    fn put(
        &self,
        fingerprint: &Fingerprint,
        artifact: &Artifact,
    ) -> Result<ArtifactRef, StoreError> {
        if let Some(existing) = self.read_meta(fingerprint)? {
            if existing.format != *artifact.format()
                || existing.size != artifact.bytes().len() as u64
            {
                tracing::warn!(
                    fingerprint = fingerprint.short(),
                    "ignoring differing artifact for stored fingerprint"
                );
            }
            return Ok(self.reference(existing));
        }
        self.write_entry(fingerprint, artifact)?;
        // A concurrent writer may have won the rename; report what is on disk.
        let stored = self
            .read_meta(fingerprint)?
            .ok_or_else(|| StoreError::NotFound(fingerprint.clone()))?;
        tracing::debug!(
            fingerprint = fingerprint.short(),
            size = stored.size,
            "stored artifact"
        );
        Ok(self.reference(stored))
    }

    fn get(&self, fingerprint: &Fingerprint) -> Result<Artifact, StoreError> {
        if let Some(hit) = self.lock_cache().get(fingerprint) {
            return Ok(hit.clone());
        }
        let meta = self
            .read_meta(fingerprint)?
            .ok_or_else(|| StoreError::NotFound(fingerprint.clone()))?;
        let path = self.entry_dir(fingerprint).join(ARTIFACT_FILE);
        let bytes = fs::read(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        if bytes.len() as u64 != meta.size {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("expected {} bytes, found {}", meta.size, bytes.len()),
            });
        }
        let artifact = Artifact::new(meta.format, bytes);
        self.lock_cache().put(fingerprint.clone(), artifact.clone());
        Ok(artifact)
    }

    fn locate(&self, fingerprint: &Fingerprint) -> Result<Option<ArtifactRef>, StoreError> {
        Ok(self.read_meta(fingerprint)?.map(|meta| self.reference(meta)))
    }

    fn fingerprints(&self) -> Result<Vec<Fingerprint>, StoreError> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|err| {
                let path = err
                    .path()
                    .and_then(Utf8Path::from_path)
                    .map_or_else(|| self.root.clone(), Utf8Path::to_owned);
                StoreError::Io {
                    path,
                    source: err.into(),
                }
            })?;
            if !entry.file_type().is_dir() || !entry.path().join(META_FILE).is_file() {
                continue;
            }
            if let Some(fp) = entry.file_name().to_str().and_then(Fingerprint::from_hex) {
                found.push(fp);
            }
        }
        found.sort();
        Ok(found)
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        self.lock_cache().pop(fingerprint);
        let dir = self.entry_dir(fingerprint);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path: dir, source }),
        }
    }
}

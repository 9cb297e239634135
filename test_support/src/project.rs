//! Temporary pipeline directories.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

/// A temporary directory holding a pipeline and its files.
///
/// The directory is removed when the value is dropped.
pub struct TempProject {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl TempProject {
    /// Create an empty project directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).expect("utf8 temp dir");
        Self { _dir: dir, root }
    }

    /// Create a project whose `Pipeline.yml` holds `manifest`.
    pub fn with_manifest(manifest: &str) -> Self {
        let project = Self::new();
        project.write("Pipeline.yml", manifest);
        project
    }

    /// The project directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Write `contents` to `path` under the root, creating parents.
    pub fn write(&self, path: &str, contents: &str) -> Utf8PathBuf {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&target, contents).expect("write file");
        target
    }

    /// Read `path` under the root as text.
    pub fn read(&self, path: &str) -> String {
        fs::read_to_string(self.root.join(path)).expect("read file")
    }
}

impl Default for TempProject {
    fn default() -> Self {
        Self::new()
    }
}

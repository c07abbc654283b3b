//! Stage completion ledger backed by zero-byte sentinel files.
//!
//! A marker lives next to the artifact its stage produced
//! (`v1.3.2.tar.gz` -> `v1.3.2.tar.gz.ok`, `build/cereal/1.3.2` ->
//! `build/cereal/1.3.2.configure.ok`). Only the path matters; markers are
//! never read. The store records that a stage reported success, nothing more:
//! it does not validate the artifact.

use std::io;
use std::path::{Path, PathBuf};

use depforge_schema::Stage;
use tempfile::NamedTempFile;

use crate::layout::append_suffix;

/// Identifies the marker for one stage of one target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarkerKey {
    artifact: PathBuf,
    stage: Stage,
}

impl MarkerKey {
    /// Marker for `stage`, vouching for the artifact at `artifact`.
    pub fn new(artifact: impl Into<PathBuf>, stage: Stage) -> Self {
        Self {
            artifact: artifact.into(),
            stage,
        }
    }

    /// Artifact the marker vouches for.
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Sentinel file path.
    pub fn path(&self) -> PathBuf {
        append_suffix(&self.artifact, self.stage.marker_suffix())
    }
}

/// Filesystem-backed marker store.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerStore;

impl MarkerStore {
    pub fn new() -> Self {
        Self
    }

    /// Whether the stage previously reported success.
    pub fn is_done(&self, key: &MarkerKey) -> bool {
        key.path().is_file()
    }

    /// Record success for a stage.
    ///
    /// Creates missing parent directories. The sentinel is written to a
    /// temporary file in the same directory and renamed into place, so a
    /// concurrent reader sees either no marker or a complete one.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or sentinel cannot be created.
    pub fn mark_done(&self, key: &MarkerKey) -> io::Result<()> {
        let path = key.path();
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "marker has no parent"))?;
        std::fs::create_dir_all(parent)?;

        if path.is_file() {
            return Ok(());
        }

        let tmp = NamedTempFile::new_in(parent)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Forget a stage's success. A missing marker is not an error.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the sentinel exists but cannot be removed.
    pub fn clear(&self, key: &MarkerKey) -> io::Result<()> {
        match std::fs::remove_file(key.path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn marker_path_appends_stage_suffix() {
        let key = MarkerKey::new("/w/build/zstd/1.5.5", Stage::Compile);
        assert_eq!(key.path(), PathBuf::from("/w/build/zstd/1.5.5.build.ok"));

        let key = MarkerKey::new("/w/download/zstd/1.5.5/zstd-1.5.5.tar.gz", Stage::Fetch);
        assert_eq!(
            key.path(),
            PathBuf::from("/w/download/zstd/1.5.5/zstd-1.5.5.tar.gz.ok")
        );
    }

    #[test]
    fn mark_done_creates_parents_and_is_zero_bytes() {
        let dir = tempdir().unwrap();
        let store = MarkerStore::new();
        let key = MarkerKey::new(dir.path().join("source/cereal/1.3.2"), Stage::Extract);

        assert!(!store.is_done(&key));
        store.mark_done(&key).unwrap();
        assert!(store.is_done(&key));
        assert_eq!(std::fs::metadata(key.path()).unwrap().len(), 0);
        // the artifact itself is not created
        assert!(!key.artifact().exists());
    }

    #[test]
    fn mark_done_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = MarkerStore::new();
        let key = MarkerKey::new(dir.path().join("build/a/1"), Stage::Install);
        store.mark_done(&key).unwrap();
        store.mark_done(&key).unwrap();
        assert!(store.is_done(&key));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("build/a"))
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "temp files left behind: {leftovers:?}");
    }

    #[test]
    fn stages_of_one_target_are_independent() {
        let dir = tempdir().unwrap();
        let store = MarkerStore::new();
        let build_dir = dir.path().join("build/a/1");
        store
            .mark_done(&MarkerKey::new(&build_dir, Stage::Configure))
            .unwrap();
        assert!(!store.is_done(&MarkerKey::new(&build_dir, Stage::Compile)));
    }

    #[test]
    fn clear_removes_marker_and_tolerates_absence() {
        let dir = tempdir().unwrap();
        let store = MarkerStore::new();
        let key = MarkerKey::new(dir.path().join("source/a/1"), Stage::Patch);

        store.clear(&key).unwrap();
        store.mark_done(&key).unwrap();
        store.clear(&key).unwrap();
        assert!(!store.is_done(&key));
    }
}

//! Paths derived from the working root.

use std::path::{Path, PathBuf};

use depforge_schema::RootKind;

use crate::target::Target;

/// Directory layout of a working root.
///
/// All derived paths are pure functions of the root and a target's
/// `name`/`version`, so two targets never share state directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    patch_root: PathBuf,
}

impl Layout {
    /// Layout rooted at `root`, with patches under `<root>/patch`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let patch_root = root.join("patch");
        Self { root, patch_root }
    }

    /// Use a different directory for `<name>_<version>.patch` files.
    pub fn with_patch_root(mut self, patch_root: impl Into<PathBuf>) -> Self {
        self.patch_root = patch_root.into();
        self
    }

    /// Working root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/download`, `<root>/source` or `<root>/build`.
    pub fn root_dir(&self, kind: RootKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// Per-target directory under a state root: `<root>/<kind>/<name>/<version>`.
    pub fn target_dir(&self, kind: RootKind, target: &Target) -> PathBuf {
        self.root_dir(kind).join(target.name()).join(target.version())
    }

    /// Shared install prefix: `<root>/install`
    pub fn install_prefix(&self) -> PathBuf {
        self.root.join("install")
    }

    /// Directory holding optional patch files.
    pub fn patch_root(&self) -> &Path {
        &self.patch_root
    }

    /// Downloaded archive: `<root>/download/<name>/<version>/<filename>`
    pub fn download_path(&self, target: &Target, filename: &str) -> PathBuf {
        self.target_dir(RootKind::Download, target).join(filename)
    }

    /// Extracted tree: `<root>/source/<name>/<version>`
    pub fn extract_dir(&self, target: &Target) -> PathBuf {
        self.target_dir(RootKind::Source, target)
    }

    /// Build directory: `<root>/build/<name>/<version>`
    pub fn build_dir(&self, target: &Target) -> PathBuf {
        self.target_dir(RootKind::Build, target)
    }

    /// Patch file by convention: `<patch_root>/<name>_<version>.patch`
    pub fn patch_file(&self, target: &Target) -> PathBuf {
        self.patch_root
            .join(format!("{}_{}.patch", target.name(), target.version()))
    }
}

/// Append a raw suffix to the final path component (`a/b` + `.ok` -> `a/b.ok`).
pub(crate) fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

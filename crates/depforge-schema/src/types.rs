//! Catalogue records and archive formats.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{Sha256Digest, Stage};

/// Archive format of a fetched source artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Gzip-compressed tar archive (`.tar.gz` / `.tgz`).
    TarGz,
    /// Zstandard-compressed tar archive (`.tar.zst` / `.tzst`).
    TarZst,
    /// Uncompressed tar archive (`.tar`).
    Tar,
    /// Zip archive (`.zip`).
    Zip,
}

impl ArchiveFormat {
    /// Every format, compressed tars ahead of plain `.tar` so suffix
    /// matching picks the longest extension.
    pub const ALL: [ArchiveFormat; 4] = [Self::TarZst, Self::TarGz, Self::Tar, Self::Zip];

    /// Recognised file extensions, without the leading dot. The first is
    /// the conventional one.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::TarGz => &["tar.gz", "tgz"],
            Self::TarZst => &["tar.zst", "tzst"],
            Self::Tar => &["tar"],
            Self::Zip => &["zip"],
        }
    }

    /// Format whose extension ends `file_name` (case-insensitive).
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let lower = file_name.to_ascii_lowercase();
        Self::ALL.into_iter().find(|format| {
            format.extensions().iter().any(|ext| {
                lower
                    .strip_suffix(ext)
                    .is_some_and(|stem| stem.ends_with('.'))
            })
        })
    }
}

/// One third-party source package as written in a catalogue file.
///
/// String fields other than `name`, `version` and `sha256` may contain
/// `{bucket}`, `{filename}`, `{name}` and `{version}` placeholders.
///
/// ```toml
/// [[target]]
/// name = "zstd"
/// version = "1.5.5"
/// sha256 = "9c4396cc829cfae319a6e2615202e82aad41372073482fce286fac78646d3ee4"
/// filename = "zstd-{version}.tar.gz"
/// url = "https://github.com/facebook/zstd/releases/download/v{version}/{filename}"
/// source_subdir = "zstd-{version}"
/// configure_subdir = "zstd-{version}/build/cmake"
/// configure_options = ["-DZSTD_BUILD_SHARED=OFF"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TargetSpec {
    /// Target name, used on the command line and in every derived path.
    pub name: String,

    /// Version string (release tag or commit).
    pub version: String,

    /// Expected SHA256 of the downloaded archive.
    pub sha256: Sha256Digest,

    /// Filename template for the downloaded archive.
    pub filename: String,

    /// Download URL template (`https://`, `http://`, `gs://` or `file://`).
    pub url: String,

    /// Template for the directory inside the archive that holds the sources.
    #[serde(default)]
    pub source_subdir: String,

    /// Template for the directory to configure from, when it differs from
    /// `source_subdir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configure_subdir: Option<String>,

    /// Options appended verbatim to the configure invocation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configure_options: Vec<String>,

    /// Stages to skip entirely for this target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip: Vec<Stage>,
}

/// Errors that can occur when loading a [`Catalogue`].
#[derive(thiserror::Error, Debug)]
pub enum CatalogueError {
    /// The document is not valid TOML or does not match the schema.
    #[error("Invalid catalogue: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required field is empty.
    #[error("Target '{target}': empty field '{field}'")]
    EmptyField {
        /// Name of the offending target (may be empty itself).
        target: String,
        /// Name of the empty field.
        field: &'static str,
    },

    /// Two entries share the same name and version.
    #[error("Duplicate target: {name} {version}")]
    Duplicate {
        /// Target name.
        name: String,
        /// Target version.
        version: String,
    },
}

/// An ordered list of [`TargetSpec`] entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Catalogue {
    /// Targets in declaration order; this is also execution order.
    #[serde(rename = "target", default)]
    pub targets: Vec<TargetSpec>,
}

impl Catalogue {
    /// Parse and validate a TOML catalogue.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::Parse`] for malformed documents (including
    /// invalid digests), [`CatalogueError::EmptyField`] when `name`, `version`,
    /// `filename` or `url` is empty, and [`CatalogueError::Duplicate`] when a
    /// `name`/`version` pair appears twice.
    pub fn from_toml(content: &str) -> Result<Self, CatalogueError> {
        let catalogue: Catalogue = toml::from_str(content)?;
        catalogue.validate()?;
        Ok(catalogue)
    }

    /// Check required fields and `name`/`version` uniqueness.
    ///
    /// # Errors
    ///
    /// See [`Catalogue::from_toml`].
    pub fn validate(&self) -> Result<(), CatalogueError> {
        let mut seen = HashSet::new();
        for spec in &self.targets {
            for (field, value) in [
                ("name", &spec.name),
                ("version", &spec.version),
                ("filename", &spec.filename),
                ("url", &spec.url),
            ] {
                if value.trim().is_empty() {
                    return Err(CatalogueError::EmptyField {
                        target: spec.name.clone(),
                        field,
                    });
                }
            }
            if !seen.insert((spec.name.as_str(), spec.version.as_str())) {
                return Err(CatalogueError::Duplicate {
                    name: spec.name.clone(),
                    version: spec.version.clone(),
                });
            }
        }
        Ok(())
    }
}

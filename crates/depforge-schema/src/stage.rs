//! The six pipeline stages and the state directories they write into.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One step of the per-target build pipeline, in execution order.
///
/// # Example
///
/// ```
/// use depforge_schema::Stage;
///
/// assert_eq!(Stage::ALL[0], Stage::Fetch);
/// assert_eq!("build".parse::<Stage>().unwrap(), Stage::Compile);
/// assert_eq!(Stage::Compile.marker_suffix(), ".build.ok");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Download the source archive and verify its digest.
    #[serde(alias = "download")]
    Fetch,
    /// Unpack the archive into the source tree.
    #[serde(alias = "source")]
    Extract,
    /// Apply the optional `<name>_<version>.patch` file.
    Patch,
    /// Run the native build tool's configure step.
    Configure,
    /// Compile the configured build directory.
    #[serde(alias = "build")]
    Compile,
    /// Install into the shared prefix.
    Install,
}

impl Stage {
    /// Every stage, in the order the pipeline runs them.
    pub const ALL: [Stage; 6] = [
        Stage::Fetch,
        Stage::Extract,
        Stage::Patch,
        Stage::Configure,
        Stage::Compile,
        Stage::Install,
    ];

    /// Position of the stage in [`Stage::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::Patch => "patch",
            Self::Configure => "configure",
            Self::Compile => "compile",
            Self::Install => "install",
        }
    }

    /// Suffix appended to the stage's artifact path to form its completion marker.
    pub fn marker_suffix(self) -> &'static str {
        match self {
            Self::Fetch => ".ok",
            Self::Extract => ".extract.ok",
            Self::Patch => ".patch.ok",
            Self::Configure => ".configure.ok",
            Self::Compile => ".build.ok",
            Self::Install => ".install.ok",
        }
    }

    /// State directory the stage's artifact and marker live under.
    pub fn root_kind(self) -> RootKind {
        match self {
            Self::Fetch => RootKind::Download,
            Self::Extract | Self::Patch => RootKind::Source,
            Self::Configure | Self::Compile | Self::Install => RootKind::Build,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stage name is not recognised.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown stage: {0}")]
pub struct StageParseError(pub String);

impl FromStr for Stage {
    type Err = StageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fetch" | "download" => Ok(Self::Fetch),
            "extract" | "source" => Ok(Self::Extract),
            "patch" => Ok(Self::Patch),
            "configure" => Ok(Self::Configure),
            "compile" | "build" => Ok(Self::Compile),
            "install" => Ok(Self::Install),
            _ => Err(StageParseError(s.to_string())),
        }
    }
}

/// Top-level state directory under the working root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    /// `download/`: fetched archives.
    Download,
    /// `source/`: extracted and patched source trees.
    Source,
    /// `build/`: configured build directories.
    Build,
}

impl RootKind {
    /// Directory name relative to the working root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Source => "source",
            Self::Build => "build",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_matches_index() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }

    #[test]
    fn parses_aliases() {
        assert_eq!("download".parse::<Stage>().unwrap(), Stage::Fetch);
        assert_eq!("Source".parse::<Stage>().unwrap(), Stage::Extract);
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn marker_roots() {
        assert_eq!(Stage::Fetch.root_kind(), RootKind::Download);
        assert_eq!(Stage::Patch.root_kind(), RootKind::Source);
        assert_eq!(Stage::Install.root_kind().dir_name(), "build");
    }
}

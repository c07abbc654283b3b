//! Run-level error type.
//!
//! Every variant is fatal: the pipeline stops at the first failure and the
//! completion markers written so far let the next invocation resume.

use std::path::PathBuf;

use depforge_schema::Stage;
use thiserror::Error;

use crate::builder::BuilderError;
use crate::expand::ExpandError;
use crate::io::{ExtractError, PatchError, TransportError};
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Unknown target '{name}' (available: {})", available.join(", "))]
    UnknownTarget {
        name: String,
        available: Vec<String>,
    },

    #[error("{target}: {source}")]
    Expand {
        target: String,
        #[source]
        source: ExpandError,
    },

    #[error("{target}: checksum mismatch for {}\n  expected: {expected}\n  actual:   {actual}", path.display())]
    Integrity {
        target: String,
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("{target}: failed to fetch {url}: {source}")]
    Fetch {
        target: String,
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("{target}: unsupported archive format: {}", path.display())]
    UnsupportedFormat { target: String, path: PathBuf },

    #[error("{target}: failed to extract {}: {source}", path.display())]
    Extract {
        target: String,
        path: PathBuf,
        #[source]
        source: ExtractError,
    },

    #[error("{target}: failed to apply {}: {source}", patch.display())]
    PatchApply {
        target: String,
        patch: PathBuf,
        #[source]
        source: PatchError,
    },

    #[error("{target}: configure failed: {source}")]
    Configure {
        target: String,
        #[source]
        source: BuilderError,
    },

    #[error("{target}: build failed: {source}")]
    Build {
        target: String,
        #[source]
        source: BuilderError,
    },

    #[error("{target}: install failed: {source}")]
    Install {
        target: String,
        #[source]
        source: BuilderError,
    },

    #[error("{target}: {stage} override failed: {source:#}")]
    Override {
        target: String,
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ForgeError {
    /// Stage the error was raised in, if it is tied to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Integrity { .. } | Self::Fetch { .. } => Some(Stage::Fetch),
            Self::UnsupportedFormat { .. } | Self::Extract { .. } => Some(Stage::Extract),
            Self::PatchApply { .. } => Some(Stage::Patch),
            Self::Configure { .. } => Some(Stage::Configure),
            Self::Build { .. } => Some(Stage::Compile),
            Self::Install { .. } => Some(Stage::Install),
            Self::Override { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Raw output of the build tool for configure/build/install failures.
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            Self::Configure { source, .. }
            | Self::Build { source, .. }
            | Self::Install { source, .. } => Some(source.output()),
            _ => None,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

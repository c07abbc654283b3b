//! depforge core: the staged fetch / extract / patch / configure / compile /
//! install pipeline for third-party source dependencies.
//!
//! Every stage is idempotent across runs through zero-byte completion markers
//! written next to the stage's artifact:
//!
//! ```text
//! <root>/
//! ├── download/<name>/<version>/<file>       # fetched archive
//! ├── download/<name>/<version>/<file>.ok
//! ├── source/<name>/<version>/               # extracted tree
//! ├── source/<name>/<version>.extract.ok
//! ├── source/<name>/<version>.patch.ok
//! ├── build/<name>/<version>/                # configured build dir
//! ├── build/<name>/<version>.{configure,build,install}.ok
//! ├── install/                               # shared prefix
//! └── patch/<name>_<version>.patch           # optional patches
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod expand;
pub mod io;
pub mod layout;
pub mod marker;
pub mod pipeline;
pub mod registry;
pub mod target;
pub mod verify;

pub use builder::{Builder, BuilderError, CMakeBuilder, ConfigureRequest};
pub use config::Settings;
pub use error::ForgeError;
pub use layout::Layout;
pub use marker::{MarkerKey, MarkerStore};
pub use io::{Extractor, Patcher, Transport, Transports};
pub use pipeline::{Delegates, Pipeline, RunSummary, StageOutcome, TargetReport};
pub use registry::{Registry, RegistryError, Run};
pub use target::{StageAction, StageContext, StageHook, Target};

pub use depforge_schema::{Sha256Digest, Stage};

/// User Agent string for outgoing HTTP requests
pub const USER_AGENT: &str = concat!("depforge/", env!("CARGO_PKG_VERSION"));

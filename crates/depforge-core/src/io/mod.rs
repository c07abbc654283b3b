//! IO modules - side effects (network, filesystem)

pub mod download;
pub mod extract;
pub mod patch;

pub use download::{Transport, TransportError, Transports};
pub use extract::{ArchiveExtractor, ExtractError, Extractor};
pub use patch::{DiffPatcher, PatchError, Patcher};

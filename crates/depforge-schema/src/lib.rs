//! Shared types for depforge: stage names, digests, archive formats and the
//! TOML catalogue format that describes third-party targets.

pub mod hash;
pub mod stage;
pub mod types;

// Re-exports
pub use hash::*;
pub use stage::*;
pub use types::*;

/// Magic bytes for ZSTD compression (Little Endian: 0xFD2FB528 -> 28 B5 2F FD)
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Magic bytes for gzip streams.
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Magic bytes for a zip local file header (`PK\x03\x04`).
pub const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

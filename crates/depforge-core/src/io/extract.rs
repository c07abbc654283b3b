//! Archive extraction module
//!
//! Handles tar.gz, tar.zst, plain tar and zip. The format comes from the file
//! extension, falling back to the leading magic bytes for archives whose
//! names say nothing (`a1b2c3`, `download?id=4`).

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use depforge_schema::{ArchiveFormat, GZIP_MAGIC, ZIP_MAGIC, ZSTD_MAGIC};
use thiserror::Error;
use tracing::debug;
use zip::ZipArchive;
use zstd::stream::Decoder as ZstdDecoder;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Archive error: {0}")]
    Archive(String),
}

/// Unpacks a fetched archive into a directory.
pub trait Extractor: Send + Sync {
    /// Extract `archive` so that its contents appear under `dest`.
    ///
    /// # Errors
    ///
    /// [`ExtractError::UnsupportedFormat`] for unknown formats, otherwise an
    /// IO or archive error.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError>;
}

/// [`Extractor`] for the formats in [`ArchiveFormat`].
///
/// Unpacks into a scratch directory next to `dest` and renames it into place,
/// replacing whatever was at `dest` before.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveExtractor;

impl Extractor for ArchiveExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError> {
        let format = detect_format(archive)?;
        let parent = dest
            .parent()
            .ok_or_else(|| ExtractError::Archive(format!("no parent for {}", dest.display())))?;
        fs::create_dir_all(parent)?;

        let scratch = tempfile::Builder::new()
            .prefix(".extract-")
            .tempdir_in(parent)?;
        let count = extract_as(format, archive, scratch.path())?;
        debug!(archive = %archive.display(), ?format, entries = count, "extracted");

        if dest.exists() {
            fs::remove_dir_all(dest)?;
        }
        fs::rename(scratch.path(), dest)?;
        Ok(())
    }
}

/// Extract with a known format. Returns the number of entries written.
pub fn extract_as(
    format: ArchiveFormat,
    archive_path: &Path,
    dest_dir: &Path,
) -> Result<usize, ExtractError> {
    let reader = BufReader::new(File::open(archive_path)?);
    match format {
        ArchiveFormat::TarGz => extract_tar(flate2::read::GzDecoder::new(reader), dest_dir),
        ArchiveFormat::TarZst => extract_tar(ZstdDecoder::new(reader)?, dest_dir),
        ArchiveFormat::Tar => extract_tar(reader, dest_dir),
        ArchiveFormat::Zip => extract_zip(archive_path, dest_dir),
    }
}

/// Extract a tar archive from a reader
fn extract_tar<R: Read>(reader: R, dest_dir: &Path) -> Result<usize, ExtractError> {
    fs::create_dir_all(dest_dir)?;

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    let mut count = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative_path: PathBuf = entry.path()?.components().collect();
        let absolute_path = dest_dir.join(&relative_path);

        // Sanitize path to prevent Zip Slip
        if !is_enclosed(&relative_path) {
            return Err(ExtractError::Archive(format!(
                "Invalid path in archive: {}",
                relative_path.display()
            )));
        }

        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&absolute_path)?;
            continue;
        }
        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&absolute_path)?;
        count += 1;
    }

    Ok(count)
}

fn is_enclosed(relative: &Path) -> bool {
    relative
        .components()
        .all(|c| matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir))
}

/// Extract a zip archive
fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<usize, ExtractError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| ExtractError::Archive(e.to_string()))?;

    fs::create_dir_all(dest_dir)?;
    let mut count = 0;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ExtractError::Archive(e.to_string()))?;
        let Some(relative_path) = file.enclosed_name() else {
            return Err(ExtractError::Archive(format!(
                "Invalid path in archive: {}",
                file.name()
            )));
        };

        let absolute_path = dest_dir.join(&relative_path);
        if file.is_dir() {
            fs::create_dir_all(&absolute_path)?;
            continue;
        }
        if let Some(p) = absolute_path.parent() {
            fs::create_dir_all(p)?;
        }

        let mut outfile = File::create(&absolute_path)?;
        io::copy(&mut file, &mut outfile)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&absolute_path, fs::Permissions::from_mode(mode))?;
        }
        count += 1;
    }

    Ok(count)
}

/// Detect archive format from the file extension, then from magic bytes.
///
/// # Errors
///
/// [`ExtractError::UnsupportedFormat`] when neither identifies a known format.
pub fn detect_format(path: &Path) -> Result<ArchiveFormat, ExtractError> {
    if let Some(format) = format_from_name(path) {
        return Ok(format);
    }
    sniff_format(path)?.ok_or_else(|| ExtractError::UnsupportedFormat(path.display().to_string()))
}

fn format_from_name(path: &Path) -> Option<ArchiveFormat> {
    path.file_name()
        .and_then(|name| ArchiveFormat::from_file_name(&name.to_string_lossy()))
}

fn sniff_format(path: &Path) -> io::Result<Option<ArchiveFormat>> {
    let mut header = [0u8; 262];
    let mut file = File::open(path)?;
    let mut read = 0;
    while read < header.len() {
        match file.read(&mut header[read..])? {
            0 => break,
            n => read += n,
        }
    }
    let header = &header[..read];

    let format = if header.starts_with(&GZIP_MAGIC) {
        Some(ArchiveFormat::TarGz)
    } else if header.starts_with(&ZSTD_MAGIC) {
        Some(ArchiveFormat::TarZst)
    } else if header.starts_with(&ZIP_MAGIC) {
        Some(ArchiveFormat::Zip)
    } else if header.get(257..262) == Some(b"ustar".as_slice()) {
        Some(ArchiveFormat::Tar)
    } else {
        None
    };
    Ok(format)
}

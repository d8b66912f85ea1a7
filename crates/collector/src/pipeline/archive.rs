//! Comic archive extraction and repackaging.
//!
//! Archives are read as zip containers (cbz/zip, and cbr/cb7 files that are
//! zips under another name). After translation each archive's pages are
//! written to a new archive whose extension comes from the configured
//! per-extension mapping.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const ARCHIVE_EXTENSIONS: [&str; 6] = ["cbz", "zip", "cbr", "rar", "cb7", "7z"];
const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "webp", "gif", "bmp"];

/// Output extension when the mapping has no entry.
pub const DEFAULT_OUTPUT_EXTENSION: &str = "cbz";

/// Errors from a single archive; the batch continues with the next one.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("invalid archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive holds no images")]
    Empty,
}

fn lower_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn is_archive(path: &Path) -> bool {
    lower_extension(path).is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_image(path: &Path) -> bool {
    lower_extension(path).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Extension the repackaged archive gets for an input archive.
pub fn output_extension(mapping: &BTreeMap<String, String>, archive: &Path) -> String {
    lower_extension(archive)
        .and_then(|ext| mapping.get(&ext).cloned())
        .unwrap_or_else(|| DEFAULT_OUTPUT_EXTENSION.to_string())
}

/// Extract the images of `archive` into `dest`, flattening nested folders.
/// Returns the extracted files sorted by their path inside the archive.
pub fn extract_images(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    fs::create_dir_all(dest)?;

    let mut names = Vec::new();
    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        // Entries escaping the archive root are ignored.
        if let Some(inner) = entry.enclosed_name() {
            if is_image(&inner) {
                names.push((inner, i));
            }
        }
    }
    names.sort();

    let mut extracted = Vec::with_capacity(names.len());
    for (n, (inner, i)) in names.into_iter().enumerate() {
        let mut entry = zip.by_index(i)?;
        let ext = lower_extension(&inner).unwrap_or_else(|| "png".to_string());
        let out_path = dest.join(format!("{:04}.{}", n, ext));
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        extracted.push(out_path);
    }

    if extracted.is_empty() {
        return Err(ArchiveError::Empty);
    }
    Ok(extracted)
}

/// Write every image directly under `images_dir` into a new archive at `out`.
pub fn package(images_dir: &Path, out: &Path) -> Result<usize, ArchiveError> {
    let mut images: Vec<PathBuf> = fs::read_dir(images_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    images.sort();
    if images.is_empty() {
        return Err(ArchiveError::Empty);
    }

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut zip = ZipWriter::new(File::create(out)?);
    // Page images are already compressed.
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for image in &images {
        let name = image
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("page.png")
            .to_string();
        zip.start_file(name.as_str(), options)?;
        zip.write_all(&fs::read(image)?)?;
    }
    zip.finish()?;
    Ok(images.len())
}

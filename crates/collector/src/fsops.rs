//! Filesystem helpers for chapter artifacts.
//!
//! Page files are written to a temporary sibling and renamed into place so a
//! crashed download never leaves a truncated page that a re-run would reuse.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use walkdir::WalkDir;

/// Errors that can occur while writing or removing artifacts.
#[derive(Debug, Error)]
pub enum FsError {
    /// Failed to write the temporary file.
    #[error("Failed to write {path}: {source}")]
    WriteFailed { path: PathBuf, source: io::Error },

    /// Failed to move the temporary file into place.
    #[error("Failed to move {path} into place: {source}")]
    RenameFailed { path: PathBuf, source: io::Error },

    /// Failed to delete a directory tree.
    #[error("Failed to remove {path}: {source}")]
    RemoveFailed { path: PathBuf, source: io::Error },
}

/// Temporary path used while `target` is being written: `<name>.part`.
pub fn partial_path(target: &Path) -> PathBuf {
    let mut partial = target.as_os_str().to_owned();
    partial.push(".part");
    PathBuf::from(partial)
}

/// Write `bytes` to `target` through a temporary sibling.
///
/// Parent directories are created. On failure the temporary file is removed
/// and `target` is left untouched.
pub async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), FsError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| FsError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let partial = partial_path(target);
    if let Err(source) = fs::write(&partial, bytes).await {
        let _ = fs::remove_file(&partial).await;
        return Err(FsError::WriteFailed {
            path: target.to_path_buf(),
            source,
        });
    }

    // Try to rename first (same filesystem), fall back to copy.
    if fs::rename(&partial, target).await.is_err() {
        let copied = fs::copy(&partial, target).await;
        let _ = fs::remove_file(&partial).await;
        copied.map_err(|source| FsError::RenameFailed {
            path: target.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Whether `path` is a regular file with at least one byte.
pub async fn is_nonempty_file(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Remove a directory tree. A missing directory is not an error.
pub async fn remove_tree(path: &Path) -> Result<bool, FsError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(FsError::RemoveFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Remove every empty directory under `root`, deepest first, including
/// `root` itself when it ends up empty. Returns how many were removed.
pub fn remove_empty_dirs(root: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        // remove_dir only succeeds on empty directories
        if std::fs::remove_dir(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

/// Files directly under `dir` sorted by name.
pub fn sorted_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

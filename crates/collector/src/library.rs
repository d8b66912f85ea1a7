//! Persisted title store.
//!
//! Titles added to the library are saved as one JSON document each in a
//! configured directory, named `{encoded title id}.json`.

use crate::models::Title;
use crate::paths::{decode_title_id, encode_title_id};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

/// Error type for library persistence
#[derive(Debug, Error)]
pub enum LibraryError {
    /// Filesystem failure
    #[error("Library I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Stored document could not be (de)serialized
    #[error("Library document {path} is invalid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persistent storage for title records.
#[async_trait]
pub trait TitleStore: Send + Sync {
    /// Load a title, `None` when it was never saved.
    async fn load(&self, title_id: &str) -> Result<Option<Title>, LibraryError>;

    /// Insert or replace a title.
    async fn save(&self, title: &Title) -> Result<(), LibraryError>;

    /// Ids of every stored title.
    async fn list(&self) -> Result<Vec<String>, LibraryError>;

    /// Delete a title. Returns whether it existed.
    async fn remove(&self, title_id: &str) -> Result<bool, LibraryError>;
}

/// JSON-file backed [`TitleStore`].
#[derive(Debug, Clone)]
pub struct JsonLibrary {
    dir: PathBuf,
}

impl JsonLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, title_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_title_id(title_id)))
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LibraryError + '_ {
    move |source| LibraryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl TitleStore for JsonLibrary {
    async fn load(&self, title_id: &str) -> Result<Option<Title>, LibraryError> {
        let path = self.file_for(title_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| LibraryError::Json { path, source })
    }

    async fn save(&self, title: &Title) -> Result<(), LibraryError> {
        fs::create_dir_all(&self.dir).await.map_err(io_err(&self.dir))?;

        let path = self.file_for(&title.id);
        let json = serde_json::to_string_pretty(title).map_err(|source| LibraryError::Json {
            path: path.clone(),
            source,
        })?;

        // Write to a sibling then rename so readers never see half a document.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).await.map_err(io_err(&path))
    }

    async fn list(&self) -> Result<Vec<String>, LibraryError> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(io_err(&self.dir)(e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.dir))? {
            let path = entry.path();
            // Only process .json files
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_title_id)
            {
                Some(id) => ids.push(id),
                None => warn!(path = %path.display(), "skipping library file with undecodable name"),
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, title_id: &str) -> Result<bool, LibraryError> {
        let path = self.file_for(title_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }
}

//! Skip manifest for images excluded from translation.
//!
//! Each run keeps an append-only `skipped.jsonl` with one record per skipped
//! image, next to a `skipped/` directory holding untouched copies of them.

use super::progress::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "skipped.jsonl";
pub const SKIPPED_DIR: &str = "skipped";

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub image: PathBuf,
    /// Stage that rejected the image.
    pub stage: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Append-only manifest that records each image at most once.
#[derive(Debug)]
pub struct SkipManifest {
    path: PathBuf,
    copies_dir: PathBuf,
    seen: HashSet<PathBuf>,
}

impl SkipManifest {
    /// Open (or start) the manifest in `run_dir`. Existing records are
    /// loaded so a resumed run does not duplicate them.
    pub fn open(run_dir: &Path) -> io::Result<Self> {
        let path = run_dir.join(MANIFEST_FILE);
        let mut seen = HashSet::new();
        if path.exists() {
            for line in BufReader::new(File::open(&path)?).lines() {
                if let Ok(record) = serde_json::from_str::<SkipRecord>(&line?) {
                    seen.insert(record.image);
                }
            }
        }
        Ok(Self {
            path,
            copies_dir: run_dir.join(SKIPPED_DIR),
            seen,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, image: &Path) -> bool {
        self.seen.contains(image)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Record `image` and copy it untouched into `skipped/`.
    ///
    /// Returns the copy's path, or `None` if the image was already recorded.
    pub fn record(&mut self, image: &Path, stage: Stage, reason: &str) -> io::Result<Option<PathBuf>> {
        if self.seen.contains(image) {
            return Ok(None);
        }

        fs::create_dir_all(&self.copies_dir)?;
        let name = image
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "image".into());
        let copy = self.copies_dir.join(name);
        fs::copy(image, &copy)?;

        let record = SkipRecord {
            image: image.to_path_buf(),
            stage: stage.as_str().to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;

        self.seen.insert(image.to_path_buf());
        Ok(Some(copy))
    }

    /// Every record on disk, in append order.
    pub fn read_records(&self) -> io::Result<Vec<SkipRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for line in BufReader::new(File::open(&self.path)?).lines() {
            let line = line?;
            let record = serde_json::from_str(&line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            records.push(record);
        }
        Ok(records)
    }
}

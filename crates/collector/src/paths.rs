//! Filesystem layout for downloaded and translated chapters.
//!
//! Title ids are arbitrary strings (often Korean, sometimes slash-bearing),
//! so the per-title directory name is a reversible URL-safe base64 encoding
//! of the id.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::path::{Path, PathBuf};

const PAGES_DIR: &str = "pages";
const TRANSLATED_DIR: &str = "translated";
const DEFAULT_PAGE_EXT: &str = "jpg";

/// Encode a title id into a single safe path component.
pub fn encode_title_id(title_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(title_id.as_bytes())
}

/// Inverse of [`encode_title_id`]. Returns `None` for names it did not produce.
pub fn decode_title_id(encoded: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// Extension of a page url, lowercased; `jpg` when the url has none.
pub fn page_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => DEFAULT_PAGE_EXT.to_string(),
    }
}

/// Directory layout rooted at the configured data dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn title_dir(&self, title_id: &str) -> PathBuf {
        self.root.join(encode_title_id(title_id))
    }

    pub fn chapter_dir(&self, title_id: &str, index: u32) -> PathBuf {
        self.title_dir(title_id).join(index.to_string())
    }

    /// `<root>/<encoded id>/<index>/pages`
    pub fn pages_dir(&self, title_id: &str, index: u32) -> PathBuf {
        self.chapter_dir(title_id, index).join(PAGES_DIR)
    }

    /// `<root>/<encoded id>/<index>/translated`
    pub fn translated_dir(&self, title_id: &str, index: u32) -> PathBuf {
        self.chapter_dir(title_id, index).join(TRANSLATED_DIR)
    }

    /// Local file for page `page` (0-based) fetched from `url`.
    pub fn page_file(&self, title_id: &str, index: u32, page: usize, url: &str) -> PathBuf {
        self.pages_dir(title_id, index)
            .join(format!("{:03}.{}", page, page_extension(url)))
    }

    /// Title ids that have a directory under the root.
    pub fn stored_titles(&self) -> std::io::Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.root.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(decode_title_id) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

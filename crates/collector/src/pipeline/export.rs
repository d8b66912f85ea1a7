//! Output trees of a pipeline run.
//!
//! ```text
//! <output>/<run timestamp>/
//!     translated_images/   always
//!     cleaned_images/      export.cleaned_images
//!     raw_texts/           export.raw_text
//!     translated_texts/    export.translated_text
//!     work/                scratch (archive extraction)
//! ```

use super::contracts::TextBlock;
use chrono::Utc;
use image::RgbImage;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use toonkor_collector_config::ExportConfig;

pub const TRANSLATED_IMAGES: &str = "translated_images";
pub const CLEANED_IMAGES: &str = "cleaned_images";
pub const RAW_TEXTS: &str = "raw_texts";
pub const TRANSLATED_TEXTS: &str = "translated_texts";
pub const WORK_DIR: &str = "work";

/// Directories of one run.
#[derive(Debug, Clone)]
pub struct RunDirs {
    pub root: PathBuf,
    options: ExportConfig,
}

impl RunDirs {
    /// Create a fresh timestamped run directory under `output_dir`.
    pub fn create(output_dir: &Path, options: &ExportConfig) -> io::Result<Self> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f").to_string();
        let mut root = output_dir.join(&stamp);
        let mut n = 1;
        while root.exists() {
            root = output_dir.join(format!("{}-{}", stamp, n));
            n += 1;
        }
        fs::create_dir_all(root.join(TRANSLATED_IMAGES))?;
        Ok(Self {
            root,
            options: options.clone(),
        })
    }

    pub fn translated_images(&self) -> PathBuf {
        self.root.join(TRANSLATED_IMAGES)
    }

    pub fn work(&self) -> PathBuf {
        self.root.join(WORK_DIR)
    }

    /// Write the artifacts of one image. `group` nests them (archive name)
    /// and `stem` names them. Returns the translated image path.
    pub fn export(
        &self,
        group: Option<&str>,
        stem: &str,
        translated: &RgbImage,
        cleaned: &RgbImage,
        blocks: &[TextBlock],
    ) -> Result<PathBuf, image::ImageError> {
        let target = |tree: &str, ext: &str| -> io::Result<PathBuf> {
            let mut dir = self.root.join(tree);
            if let Some(group) = group {
                dir = dir.join(group);
            }
            fs::create_dir_all(&dir)?;
            Ok(dir.join(format!("{}.{}", stem, ext)))
        };

        let image_path = target(TRANSLATED_IMAGES, "png")?;
        translated.save(&image_path)?;

        if self.options.cleaned_images {
            cleaned.save(target(CLEANED_IMAGES, "png")?)?;
        }
        if self.options.raw_text {
            fs::write(target(RAW_TEXTS, "txt")?, transcript(blocks, |b| &b.source_text))?;
        }
        if self.options.translated_text {
            fs::write(
                target(TRANSLATED_TEXTS, "txt")?,
                transcript(blocks, |b| &b.translation),
            )?;
        }
        Ok(image_path)
    }
}

fn transcript(blocks: &[TextBlock], text: impl Fn(&TextBlock) -> &String) -> String {
    let mut out = String::new();
    for block in blocks {
        out.push_str(text(block).trim());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn blocks() -> Vec<TextBlock> {
        vec![
            TextBlock {
                bbox: [0, 0, 4, 4],
                source_text: "안녕".into(),
                translation: "HELLO".into(),
            },
            TextBlock {
                bbox: [4, 4, 4, 4],
                source_text: " 뭐? ".into(),
                translation: "WHAT?".into(),
            },
        ]
    }

    #[test]
    fn test_only_translated_tree_by_default() {
        let temp_dir = TempDir::new().unwrap();
        let dirs = RunDirs::create(temp_dir.path(), &ExportConfig::default()).unwrap();
        let image = RgbImage::new(8, 8);

        let path = dirs.export(None, "000", &image, &image, &blocks()).unwrap();

        assert_eq!(path, dirs.translated_images().join("000.png"));
        assert!(path.exists());
        assert!(!dirs.root.join(RAW_TEXTS).exists());
        assert!(!dirs.root.join(CLEANED_IMAGES).exists());
    }

    #[test]
    fn test_optional_exports() {
        let temp_dir = TempDir::new().unwrap();
        let options = ExportConfig {
            raw_text: true,
            translated_text: true,
            cleaned_images: true,
        };
        let dirs = RunDirs::create(temp_dir.path(), &options).unwrap();
        let image = RgbImage::new(8, 8);

        dirs.export(Some("vol1"), "007", &image, &image, &blocks()).unwrap();

        let raw = fs::read_to_string(dirs.root.join("raw_texts/vol1/007.txt")).unwrap();
        assert_eq!(raw, "안녕\n뭐?\n");
        let translated =
            fs::read_to_string(dirs.root.join("translated_texts/vol1/007.txt")).unwrap();
        assert_eq!(translated, "HELLO\nWHAT?\n");
        assert!(dirs.root.join("cleaned_images/vol1/007.png").exists());
        assert!(dirs.root.join("translated_images/vol1/007.png").exists());
    }

    #[test]
    fn test_runs_get_distinct_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let a = RunDirs::create(temp_dir.path(), &ExportConfig::default()).unwrap();
        let b = RunDirs::create(temp_dir.path(), &ExportConfig::default()).unwrap();
        assert_ne!(a.root, b.root);
    }
}

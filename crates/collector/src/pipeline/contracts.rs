//! Contracts for the models driven by the pipeline.
//!
//! Detection, OCR, inpainting, translation and text rendering are external
//! collaborators. The pipeline only relies on the shapes below: images in as
//! RGB8, regions as `[x, y, width, height]` boxes, and failures reported as
//! [`StageError`].

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, RgbImage};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// `[x, y, width, height]` in pixels.
pub type BBox = [u32; 4];

/// Stage failure reported by a model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The model ran and failed
    #[error("{0}")]
    Failed(String),

    /// No implementation is configured for this model
    #[error("{0} is not configured")]
    Unavailable(&'static str),

    /// The model could not be built
    #[error("failed to load {model}: {reason}")]
    Load { model: String, reason: String },
}

impl StageError {
    pub fn failed(message: impl Into<String>) -> Self {
        StageError::Failed(message.into())
    }
}

/// One detected text region as it moves through the stages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextBlock {
    pub bbox: BBox,
    /// Recognized source text, filled by OCR.
    pub source_text: String,
    /// Filled by the translator.
    pub translation: String,
}

impl TextBlock {
    pub fn new(bbox: BBox) -> Self {
        Self {
            bbox,
            ..Self::default()
        }
    }
}

/// Context handed to the translator with each image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationHints {
    pub source_lang: String,
    pub target_lang: String,
    /// Free-form context from configuration.
    pub extra_context: String,
    /// File name of the page being translated.
    pub page: String,
    pub image_index: usize,
}

/// Block ready to be typeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderBlock {
    pub bbox: BBox,
    pub text: String,
    /// Best-fit size within the configured bounds.
    pub font_size: u32,
}

/// Typesetting options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderStyle {
    pub font: Option<PathBuf>,
    pub outline: bool,
    pub min_font_size: u32,
    pub max_font_size: u32,
}

pub trait TextDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BBox>, StageError>;
}

pub trait OcrEngine: Send + Sync {
    /// Fill `source_text` of every block.
    fn recognize(&self, image: &RgbImage, blocks: &mut [TextBlock]) -> Result<(), StageError>;
}

pub trait Inpainter: Send + Sync {
    /// Remove the text covered by `mask` (white = erase).
    fn inpaint(&self, image: &RgbImage, mask: &GrayImage) -> Result<DynamicImage, StageError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Fill `translation` of every block.
    async fn translate(
        &self,
        blocks: &mut [TextBlock],
        hints: &TranslationHints,
    ) -> Result<(), StageError>;
}

pub trait TextRenderer: Send + Sync {
    fn render(
        &self,
        image: &mut RgbImage,
        blocks: &[RenderBlock],
        style: &RenderStyle,
    ) -> Result<(), StageError>;
}

/// Builds model instances. Building is expensive; the pipeline caches
/// what this returns.
pub trait ModelFactory: Send + Sync {
    fn detector(&self, model_files: &[PathBuf], device: &str)
        -> Result<Arc<dyn TextDetector>, StageError>;

    fn ocr(&self, source_lang: &str) -> Result<Arc<dyn OcrEngine>, StageError>;

    fn inpainter(&self, kind: &str, device: &str) -> Result<Arc<dyn Inpainter>, StageError>;

    fn renderer(&self) -> Result<Arc<dyn TextRenderer>, StageError>;
}

/// Factory used when no model backend is linked in. Every build fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredModels;

impl ModelFactory for UnconfiguredModels {
    fn detector(&self, _: &[PathBuf], _: &str) -> Result<Arc<dyn TextDetector>, StageError> {
        Err(StageError::Unavailable("text detector"))
    }

    fn ocr(&self, _: &str) -> Result<Arc<dyn OcrEngine>, StageError> {
        Err(StageError::Unavailable("ocr engine"))
    }

    fn inpainter(&self, _: &str, _: &str) -> Result<Arc<dyn Inpainter>, StageError> {
        Err(StageError::Unavailable("inpainter"))
    }

    fn renderer(&self) -> Result<Arc<dyn TextRenderer>, StageError> {
        Err(StageError::Unavailable("text renderer"))
    }
}

#[async_trait]
impl Translator for UnconfiguredModels {
    async fn translate(&self, _: &mut [TextBlock], _: &TranslationHints) -> Result<(), StageError> {
        Err(StageError::Unavailable("translator"))
    }
}

/// Mask with every block's box painted white.
pub fn block_mask(width: u32, height: u32, blocks: &[TextBlock]) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for block in blocks {
        let [x, y, w, h] = block.bbox;
        let x_end = x.saturating_add(w).min(width);
        let y_end = y.saturating_add(h).min(height);
        for py in y.min(height)..y_end {
            for px in x.min(width)..x_end {
                mask.put_pixel(px, py, image::Luma([255]));
            }
        }
    }
    mask
}

/// Largest font size in `[min, max]` at which `text` fits `bbox`, assuming
/// glyphs ~0.6em wide and lines 1.2em tall. Falls back to `min`.
pub fn fit_font_size(bbox: BBox, text: &str, min: u32, max: u32) -> u32 {
    let [_, _, width, height] = bbox;
    let chars = text.chars().count().max(1) as f32;
    let (min, max) = (min.max(1), max.max(min.max(1)));
    (min..=max)
        .rev()
        .find(|&size| {
            let size = size as f32;
            let per_line = (width as f32 / (0.6 * size)).floor();
            let lines = (height as f32 / (1.2 * size)).floor();
            per_line >= 1.0 && lines >= 1.0 && per_line * lines >= chars
        })
        .unwrap_or(min)
}

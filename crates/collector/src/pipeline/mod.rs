//! Translation pipeline.
//!
//! A batch is the page set of one chapter. Every image runs through
//! detect, OCR, inpaint, translate, render and export in order. The
//! cancellation token is checked before each stage, never during one.
//!
//! Failures are handled per stage:
//! - detect, OCR and translate failures (and empty results) skip the image:
//!   it is copied untouched to `skipped/` and recorded in the skip manifest
//! - inpaint, render and export failures abort the whole batch
//!
//! Archive inputs are extracted into the run's work directory first and
//! repackaged once every image has been processed.

pub mod archive;
pub mod contracts;
pub mod export;
pub mod manifest;
pub mod model_cache;
pub mod progress;

use crate::bus::ProgressBus;
use crate::events::{PipelineRequest, PipelineResponse, PipelineStatus};
use crate::fsops;
use contracts::{
    block_mask, fit_font_size, Inpainter, ModelFactory, OcrEngine, RenderBlock, RenderStyle,
    StageError, TextBlock, TextDetector, TextRenderer, TranslationHints, Translator,
};
use export::RunDirs;
use image::RgbImage;
use manifest::SkipManifest;
use model_cache::{BuildCounts, ModelCache};
use progress::{ProgressReporter, Stage};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use toonkor_collector_config::PipelineConfig;
use tracing::{debug, info, instrument, warn};

/// Errors that abort a whole batch.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("model unavailable: {0}")]
    Model(#[source] StageError),

    #[error("{stage} failed on {}: {source}", image.display())]
    Stage {
        stage: Stage,
        image: PathBuf,
        #[source]
        source: StageError,
    },

    #[error("failed to write {}: {source}", path.display())]
    Export {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("pipeline I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("pipeline worker thread failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// What a batch produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Timestamped run directory, unless cleanup removed it.
    pub run_dir: Option<PathBuf>,
    /// Translated images in processing order.
    pub translated: Vec<PathBuf>,
    /// Input images excluded from translation.
    pub skipped: Vec<PathBuf>,
    /// Repackaged archives.
    pub archives: Vec<PathBuf>,
    /// Input archives that could not be extracted or repackaged.
    pub failed_archives: Vec<PathBuf>,
    pub cancelled: bool,
}

impl BatchOutcome {
    /// A batch that ran to completion is done even if every image was
    /// skipped. Cancelled or empty batches produced nothing.
    pub fn status(&self) -> PipelineStatus {
        let empty = self.translated.is_empty() && self.skipped.is_empty();
        if self.cancelled || (empty && self.archives.is_empty()) {
            PipelineStatus::Skipped
        } else {
            PipelineStatus::Done
        }
    }

    pub fn into_response(self, request: &PipelineRequest) -> PipelineResponse {
        let status = self.status();
        let mut artifact_paths = self.archives;
        artifact_paths.extend(self.translated);
        PipelineResponse {
            request_id: request.request_id,
            title_id: request.title_id.clone(),
            chapter_index: request.chapter_index,
            status,
            artifact_paths,
            skipped_images: self.skipped,
            error: None,
        }
    }
}

/// Response for a batch that failed with `error`.
pub fn failed_response(request: &PipelineRequest, error: &PipelineError) -> PipelineResponse {
    PipelineResponse {
        request_id: request.request_id,
        title_id: request.title_id.clone(),
        chapter_index: request.chapter_index,
        status: PipelineStatus::Failed,
        artifact_paths: Vec::new(),
        skipped_images: Vec::new(),
        error: Some(error.to_string()),
    }
}

#[derive(Clone)]
struct WorkItem {
    path: PathBuf,
    /// Stem of the archive the image came from.
    group: Option<String>,
}

struct ArchiveInput {
    archive: PathBuf,
    stem: String,
}

/// Images to process plus what became of each input archive.
#[derive(Default)]
struct ExpandedInputs {
    items: Vec<WorkItem>,
    archives: Vec<ArchiveInput>,
    failed: Vec<PathBuf>,
}

#[derive(Clone)]
struct Models {
    detector: Arc<dyn TextDetector>,
    ocr: Arc<dyn OcrEngine>,
    inpainter: Arc<dyn Inpainter>,
    renderer: Arc<dyn TextRenderer>,
}

enum ImageOutcome {
    Processed(PathBuf),
    Skipped { stage: Stage, reason: String },
    Cancelled,
}

/// Result of the stages before translation.
enum Prepared {
    Page {
        blocks: Vec<TextBlock>,
        cleaned: RgbImage,
    },
    Finished(ImageOutcome),
}

/// A translated page waiting for typesetting and export.
struct Typeset {
    item: WorkItem,
    blocks: Vec<TextBlock>,
    render_blocks: Vec<RenderBlock>,
    style: RenderStyle,
    cleaned: RgbImage,
}

fn skip(stage: Stage, reason: impl Into<String>) -> ImageOutcome {
    ImageOutcome::Skipped {
        stage,
        reason: reason.into(),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image")
        .to_string()
}

/// Decode the page, then detect, recognize and inpaint. Runs on a blocking
/// thread.
fn prepare_page(
    index: usize,
    path: &Path,
    models: &Models,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<Prepared, PipelineError> {
    let page = match image::open(path) {
        Ok(image) => image.to_rgb8(),
        Err(e) => {
            return Ok(Prepared::Finished(skip(
                Stage::Detect,
                format!("unreadable image: {}", e),
            )))
        }
    };

    if cancel.is_cancelled() {
        return Ok(Prepared::Finished(ImageOutcome::Cancelled));
    }
    let regions = match models.detector.detect(&page) {
        Ok(regions) => regions,
        Err(e) => return Ok(Prepared::Finished(skip(Stage::Detect, e.to_string()))),
    };
    if regions.is_empty() {
        return Ok(Prepared::Finished(skip(Stage::Detect, "no text regions")));
    }
    reporter.stage_done(index, Stage::Detect);

    if cancel.is_cancelled() {
        return Ok(Prepared::Finished(ImageOutcome::Cancelled));
    }
    let mut blocks: Vec<TextBlock> = regions.into_iter().map(TextBlock::new).collect();
    if let Err(e) = models.ocr.recognize(&page, &mut blocks) {
        return Ok(Prepared::Finished(skip(Stage::Ocr, e.to_string())));
    }
    reporter.stage_done(index, Stage::Ocr);

    if cancel.is_cancelled() {
        return Ok(Prepared::Finished(ImageOutcome::Cancelled));
    }
    let mask = block_mask(page.width(), page.height(), &blocks);
    let cleaned = models
        .inpainter
        .inpaint(&page, &mask)
        .map_err(|source| PipelineError::Stage {
            stage: Stage::Inpaint,
            image: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    reporter.stage_done(index, Stage::Inpaint);

    Ok(Prepared::Page { blocks, cleaned })
}

impl Typeset {
    /// Render the translation and write the artifacts. Runs on a blocking
    /// thread.
    fn finish(
        self,
        index: usize,
        renderer: &dyn TextRenderer,
        run: &RunDirs,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ImageOutcome, PipelineError> {
        let mut translated = self.cleaned.clone();
        renderer
            .render(&mut translated, &self.render_blocks, &self.style)
            .map_err(|source| PipelineError::Stage {
                stage: Stage::Render,
                image: self.item.path.clone(),
                source,
            })?;
        reporter.stage_done(index, Stage::Render);

        if cancel.is_cancelled() {
            return Ok(ImageOutcome::Cancelled);
        }
        let stem = file_stem(&self.item.path);
        let artifact = run
            .export(
                self.item.group.as_deref(),
                &stem,
                &translated,
                &self.cleaned,
                &self.blocks,
            )
            .map_err(|source| PipelineError::Export {
                path: self.item.path.clone(),
                source,
            })?;
        reporter.stage_done(index, Stage::Export);
        Ok(ImageOutcome::Processed(artifact))
    }
}

/// Flatten the inputs into images, extracting archives into `work`.
fn expand_inputs(inputs: &[PathBuf], work: &Path) -> ExpandedInputs {
    let mut expanded = ExpandedInputs::default();
    for input in inputs {
        if !archive::is_archive(input) {
            expanded.items.push(WorkItem {
                path: input.clone(),
                group: None,
            });
            continue;
        }

        let stem = file_stem(input);
        match archive::extract_images(input, &work.join(&stem)) {
            Ok(images) => {
                expanded.items.extend(images.into_iter().map(|path| WorkItem {
                    path,
                    group: Some(stem.clone()),
                }));
                expanded.archives.push(ArchiveInput {
                    archive: input.clone(),
                    stem,
                });
            }
            Err(e) => {
                warn!(archive = %input.display(), error = %e, "archive skipped");
                expanded.failed.push(input.clone());
            }
        }
    }
    expanded
}

/// Repackage each extracted archive. One bad archive does not stop the
/// rest. Returns the written archives and the inputs that failed.
fn repackage(
    formats: &BTreeMap<String, String>,
    archives: &[ArchiveInput],
    run: &RunDirs,
) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut written = Vec::new();
    let mut failed = Vec::new();
    for input in archives {
        let ext = archive::output_extension(formats, &input.archive);
        let out = run.root.join(format!("{}.{}", input.stem, ext));
        match archive::package(&run.translated_images().join(&input.stem), &out) {
            Ok(pages) => {
                info!(archive = %out.display(), pages, "archive repackaged");
                written.push(out);
            }
            Err(e) => {
                warn!(archive = %input.archive.display(), error = %e, "repackaging failed");
                failed.push(input.archive.clone());
            }
        }
    }
    (written, failed)
}

/// Runs batches one at a time. Owns the model cache so models survive
/// between batches.
///
/// Decoding, model inference, archive work and exports run on tokio's
/// blocking pool; only translation is awaited on the runtime.
pub struct TranslationPipeline {
    config: PipelineConfig,
    models: ModelCache,
    translator: Arc<dyn Translator>,
    bus: Arc<ProgressBus>,
}

impl TranslationPipeline {
    pub fn new(
        config: PipelineConfig,
        factory: Arc<dyn ModelFactory>,
        translator: Arc<dyn Translator>,
        bus: Arc<ProgressBus>,
    ) -> Self {
        Self {
            config,
            models: ModelCache::new(factory),
            translator,
            bus,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Select a different inpainter for the following batches.
    pub fn set_inpainter(&mut self, kind: impl Into<String>) {
        self.config.inpainter = kind.into();
    }

    pub fn model_builds(&self) -> BuildCounts {
        self.models.builds()
    }

    fn load_models(&mut self, source_lang: &str) -> Result<Models, PipelineError> {
        let cfg = &self.config;
        Ok(Models {
            detector: self
                .models
                .detector(&cfg.detector_models, &cfg.device)
                .map_err(PipelineError::Model)?,
            ocr: self.models.ocr(source_lang).map_err(PipelineError::Model)?,
            inpainter: self
                .models
                .inpainter(&cfg.inpainter, &cfg.device)
                .map_err(PipelineError::Model)?,
            renderer: self.models.renderer().map_err(PipelineError::Model)?,
        })
    }

    /// Process every page of `request`.
    #[instrument(skip_all, fields(title_id = %request.title_id, chapter = request.chapter_index))]
    pub async fn process_batch(
        &mut self,
        request: &PipelineRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, PipelineError> {
        let mut outcome = BatchOutcome::default();
        if request.local_page_paths.is_empty() {
            debug!("empty batch");
            return Ok(outcome);
        }

        let source_lang = request
            .source_lang
            .clone()
            .unwrap_or_else(|| self.config.source_lang.clone());
        let models = self.load_models(&source_lang)?;

        let run = RunDirs::create(&request.output_dir, &self.config.export)?;
        let mut manifest = SkipManifest::open(&run.root)?;
        let reporter = ProgressReporter::new(
            self.bus.clone(),
            &request.title_id,
            request.chapter_index,
        );

        let inputs = request.local_page_paths.clone();
        let work = run.work();
        let expanded =
            tokio::task::spawn_blocking(move || expand_inputs(&inputs, &work)).await?;
        outcome.failed_archives = expanded.failed;
        let items = expanded.items;
        let archives = expanded.archives;
        info!(images = items.len(), archives = archives.len(), "batch started");

        for (index, item) in items.iter().enumerate() {
            reporter.image_started(index);
            let result = self
                .process_image(index, item, &models, &run, &source_lang, &reporter, cancel)
                .await?;
            match result {
                ImageOutcome::Processed(artifact) => {
                    debug!(image = index, artifact = %artifact.display(), "image processed");
                    reporter.processed(index, artifact.clone());
                    outcome.translated.push(artifact);
                }
                ImageOutcome::Skipped { stage, reason } => {
                    warn!(image = %item.path.display(), %stage, %reason, "image skipped");
                    manifest.record(&item.path, stage, &reason)?;
                    reporter.skipped(index, item.path.clone(), &reason);
                    outcome.skipped.push(item.path.clone());
                }
                ImageOutcome::Cancelled => {
                    info!(image = index, "batch cancelled");
                    outcome.cancelled = true;
                    break;
                }
            }
        }

        if !outcome.cancelled {
            let formats = self.config.archive_formats.clone();
            let packaging_run = run.clone();
            let (written, failed) = tokio::task::spawn_blocking(move || {
                repackage(&formats, &archives, &packaging_run)
            })
            .await?;
            outcome.archives = written;
            outcome.failed_archives.extend(failed);
        }

        if let Err(e) = fsops::remove_tree(&run.work()).await {
            warn!(error = %e, "failed to remove work directory");
        }
        fsops::remove_empty_dirs(&run.root);
        outcome.run_dir = run.root.exists().then(|| run.root.clone());

        info!(
            translated = outcome.translated.len(),
            skipped = outcome.skipped.len(),
            archives = outcome.archives.len(),
            "batch finished"
        );
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_image(
        &self,
        index: usize,
        item: &WorkItem,
        models: &Models,
        run: &RunDirs,
        source_lang: &str,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ImageOutcome, PipelineError> {
        let prepared = {
            let path = item.path.clone();
            let models = models.clone();
            let reporter = reporter.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                prepare_page(index, &path, &models, &reporter, &cancel)
            })
            .await??
        };
        let (mut blocks, cleaned) = match prepared {
            Prepared::Page { blocks, cleaned } => (blocks, cleaned),
            Prepared::Finished(outcome) => return Ok(outcome),
        };

        if cancel.is_cancelled() {
            return Ok(ImageOutcome::Cancelled);
        }
        let hints = TranslationHints {
            source_lang: source_lang.to_string(),
            target_lang: self.config.target_lang.clone(),
            extra_context: self.config.extra_context.clone(),
            page: item
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            image_index: index,
        };
        if let Err(e) = self.translator.translate(&mut blocks, &hints).await {
            return Ok(skip(Stage::Translate, e.to_string()));
        }
        if blocks.iter().all(|b| b.source_text.trim().is_empty()) {
            return Ok(skip(Stage::Translate, "no text recognized"));
        }
        blocks.retain(|b| !b.translation.trim().is_empty());
        if blocks.is_empty() {
            return Ok(skip(Stage::Translate, "empty translation"));
        }
        if self.config.render.uppercase {
            for block in &mut blocks {
                block.translation = block.translation.to_uppercase();
            }
        }
        reporter.stage_done(index, Stage::Translate);

        if cancel.is_cancelled() {
            return Ok(ImageOutcome::Cancelled);
        }
        let render = &self.config.render;
        let style = RenderStyle {
            font: render.font.clone(),
            outline: render.outline,
            min_font_size: render.min_font_size,
            max_font_size: render.max_font_size,
        };
        let render_blocks: Vec<RenderBlock> = blocks
            .iter()
            .map(|b| RenderBlock {
                bbox: b.bbox,
                text: b.translation.clone(),
                font_size: fit_font_size(
                    b.bbox,
                    &b.translation,
                    render.min_font_size,
                    render.max_font_size,
                ),
            })
            .collect();
        let typeset = Typeset {
            item: item.clone(),
            blocks,
            render_blocks,
            style,
            cleaned,
        };

        let renderer = models.renderer.clone();
        let run = run.clone();
        let reporter = reporter.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            typeset.finish(index, renderer.as_ref(), &run, &reporter, &cancel)
        })
        .await?
    }
}

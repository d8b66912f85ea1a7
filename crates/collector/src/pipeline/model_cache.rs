//! Model instances kept across images and batches.
//!
//! The detector is keyed by (model files, device), the OCR engine by source
//! language and the inpainter by (kind, device). A key change rebuilds that
//! one model; everything else is reused.

use super::contracts::{Inpainter, ModelFactory, OcrEngine, StageError, TextDetector, TextRenderer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// How many times each model was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildCounts {
    pub detector: u32,
    pub ocr: u32,
    pub inpainter: u32,
    pub renderer: u32,
}

type DetectorKey = (Vec<PathBuf>, String);
type InpainterKey = (String, String);

/// Owned by the pipeline; never shared between pipelines.
pub struct ModelCache {
    factory: Arc<dyn ModelFactory>,
    detector: Option<(DetectorKey, Arc<dyn TextDetector>)>,
    ocr: Option<(String, Arc<dyn OcrEngine>)>,
    inpainter: Option<(InpainterKey, Arc<dyn Inpainter>)>,
    renderer: Option<Arc<dyn TextRenderer>>,
    builds: BuildCounts,
}

impl ModelCache {
    pub fn new(factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            factory,
            detector: None,
            ocr: None,
            inpainter: None,
            renderer: None,
            builds: BuildCounts::default(),
        }
    }

    pub fn builds(&self) -> BuildCounts {
        self.builds
    }

    pub fn detector(
        &mut self,
        model_files: &[PathBuf],
        device: &str,
    ) -> Result<Arc<dyn TextDetector>, StageError> {
        let key = (model_files.to_vec(), device.to_string());
        if let Some((cached, detector)) = &self.detector {
            if *cached == key {
                return Ok(detector.clone());
            }
        }
        info!(device, "building text detector");
        let detector = self.factory.detector(model_files, device)?;
        self.builds.detector += 1;
        self.detector = Some((key, detector.clone()));
        Ok(detector)
    }

    pub fn ocr(&mut self, source_lang: &str) -> Result<Arc<dyn OcrEngine>, StageError> {
        if let Some((lang, engine)) = &self.ocr {
            if lang == source_lang {
                return Ok(engine.clone());
            }
        }
        info!(source_lang, "building ocr engine");
        let engine = self.factory.ocr(source_lang)?;
        self.builds.ocr += 1;
        self.ocr = Some((source_lang.to_string(), engine.clone()));
        Ok(engine)
    }

    pub fn inpainter(&mut self, kind: &str, device: &str) -> Result<Arc<dyn Inpainter>, StageError> {
        let key = (kind.to_string(), device.to_string());
        if let Some((cached, inpainter)) = &self.inpainter {
            if *cached == key {
                return Ok(inpainter.clone());
            }
        }
        info!(kind, device, "building inpainter");
        // Drop the old model before building its replacement.
        self.inpainter = None;
        let inpainter = self.factory.inpainter(kind, device)?;
        self.builds.inpainter += 1;
        self.inpainter = Some((key, inpainter.clone()));
        Ok(inpainter)
    }

    pub fn renderer(&mut self) -> Result<Arc<dyn TextRenderer>, StageError> {
        if let Some(renderer) = &self.renderer {
            return Ok(renderer.clone());
        }
        let renderer = self.factory.renderer()?;
        self.builds.renderer += 1;
        self.renderer = Some(renderer.clone());
        Ok(renderer)
    }
}

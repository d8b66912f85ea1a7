//! In-crate fakes shared by unit tests.

use crate::library::{LibraryError, TitleStore};
use crate::models::{ChapterRef, Title};
use crate::pipeline::contracts::{
    BBox, Inpainter, ModelFactory, OcrEngine, RenderBlock, RenderStyle, StageError, TextBlock,
    TextDetector, TextRenderer, TranslationHints, Translator,
};
use crate::source::{RemoteSource, SourceError};
use async_trait::async_trait;
use image::{DynamicImage, GrayImage, RgbImage};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Page shade the fake detector finds no text on.
pub const BLANK_SHADE: u8 = 0;

/// Encoded 8x8 PNG used as page content.
pub fn tiny_png(shade: u8) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(8, 8, image::Rgb([shade, shade, shade]));
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .expect("encode png");
    bytes.into_inner()
}

/// Scriptable [`RemoteSource`].
pub struct FakeSource {
    base_url: RwLock<String>,
    titles: Mutex<HashMap<String, Title>>,
    pages: Mutex<HashMap<(String, u32), Vec<String>>>,
    broken_page_lists: Mutex<HashSet<(String, u32)>>,
    /// Remaining failures per page url.
    flaky_pages: Mutex<HashMap<String, u32>>,
    title_fetches: AtomicUsize,
    page_fetches: AtomicUsize,
    page_shade: AtomicU8,
    delay: Option<Duration>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            base_url: RwLock::new("https://toonkor.test".to_string()),
            titles: Mutex::new(HashMap::new()),
            pages: Mutex::new(HashMap::new()),
            broken_page_lists: Mutex::new(HashSet::new()),
            flaky_pages: Mutex::new(HashMap::new()),
            title_fetches: AtomicUsize::new(0),
            page_fetches: AtomicUsize::new(0),
            page_shade: AtomicU8::new(200),
            delay: None,
        }
    }

    /// Every network call sleeps for `delay` first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn add_title(&self, title: Title) {
        self.titles.lock().insert(title.id.clone(), title);
    }

    /// Register `count` pages for a chapter and return their urls.
    pub fn add_pages(&self, title_id: &str, index: u32, count: usize) -> Vec<String> {
        let urls: Vec<String> = (0..count)
            .map(|i| format!("https://cdn.test/{}/{}/{}.png", title_id, index, i))
            .collect();
        self.pages
            .lock()
            .insert((title_id.to_string(), index), urls.clone());
        urls
    }

    pub fn break_page_list(&self, title_id: &str, index: u32) {
        self.broken_page_lists
            .lock()
            .insert((title_id.to_string(), index));
    }

    /// Make `url` fail `times` times before succeeding.
    pub fn fail_page(&self, url: &str, times: u32) {
        self.flaky_pages.lock().insert(url.to_string(), times);
    }

    /// Shade of every page served from now on.
    pub fn set_page_shade(&self, shade: u8) {
        self.page_shade.store(shade, Ordering::SeqCst);
    }

    pub fn title_fetches(&self) -> usize {
        self.title_fetches.load(Ordering::SeqCst)
    }

    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
    }
}

#[async_trait]
impl RemoteSource for FakeSource {
    async fn fetch_title(&self, title_id: &str) -> Result<Title, SourceError> {
        self.title_fetches.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.titles
            .lock()
            .get(title_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(title_id.to_string()))
    }

    async fn page_urls(
        &self,
        title_id: &str,
        chapter: &ChapterRef,
    ) -> Result<Vec<String>, SourceError> {
        self.pause().await;
        let key = (title_id.to_string(), chapter.index);
        if self.broken_page_lists.lock().contains(&key) {
            return Err(SourceError::Parse("toon_img script not found".to_string()));
        }
        self.pages
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("{}/{}", title_id, chapter.index)))
    }

    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        {
            let mut flaky = self.flaky_pages.lock();
            if let Some(remaining) = flaky.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SourceError::Status {
                        url: url.to_string(),
                        status: 503,
                    });
                }
            }
        }
        Ok(tiny_png(self.page_shade.load(Ordering::SeqCst)))
    }

    fn base_url(&self) -> String {
        self.base_url.read().clone()
    }

    fn set_base_url(&self, url: &str) -> bool {
        let mut current = self.base_url.write();
        if *current == url {
            return false;
        }
        *current = url.to_string();
        true
    }
}

/// [`TitleStore`] kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    titles: Mutex<HashMap<String, Title>>,
}

impl MemoryStore {
    pub fn insert(&self, title: Title) {
        self.titles.lock().insert(title.id.clone(), title);
    }

    pub fn get(&self, title_id: &str) -> Option<Title> {
        self.titles.lock().get(title_id).cloned()
    }
}

#[async_trait]
impl TitleStore for MemoryStore {
    async fn load(&self, title_id: &str) -> Result<Option<Title>, LibraryError> {
        Ok(self.get(title_id))
    }

    async fn save(&self, title: &Title) -> Result<(), LibraryError> {
        self.insert(title.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, LibraryError> {
        let mut ids: Vec<String> = self.titles.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, title_id: &str) -> Result<bool, LibraryError> {
        Ok(self.titles.lock().remove(title_id).is_some())
    }
}

/// Write a tiny PNG page with the given shade.
pub fn write_page(dir: &Path, name: &str, shade: u8) -> PathBuf {
    std::fs::create_dir_all(dir).expect("create page dir");
    let path = dir.join(name);
    std::fs::write(&path, tiny_png(shade)).expect("write page");
    path
}

#[derive(Default)]
struct FakeModelState {
    fail_detector_build: AtomicBool,
    fail_render: AtomicBool,
    empty_translation: AtomicBool,
    ocr_fail_shades: Mutex<HashSet<u8>>,
    translate_calls: AtomicUsize,
    inpaint_calls: AtomicUsize,
    render_calls: AtomicUsize,
    cancel_on_inpaint: Mutex<Option<(usize, CancellationToken)>>,
    detect_delay: Mutex<Option<Duration>>,
}

/// Every model contract backed by one scriptable fake.
///
/// Pages are told apart by the shade of their top-left pixel: the detector
/// finds nothing on [`BLANK_SHADE`] and one page-wide region otherwise.
#[derive(Clone, Default)]
pub struct FakeModels {
    state: Arc<FakeModelState>,
}

impl FakeModels {
    pub fn fail_detector_build(&self, fail: bool) {
        self.state.fail_detector_build.store(fail, Ordering::SeqCst);
    }

    pub fn fail_render(&self, fail: bool) {
        self.state.fail_render.store(fail, Ordering::SeqCst);
    }

    pub fn empty_translation(&self, empty: bool) {
        self.state.empty_translation.store(empty, Ordering::SeqCst);
    }

    /// Detection blocks its thread for `delay` on every call.
    pub fn slow_detect(&self, delay: Duration) {
        *self.state.detect_delay.lock() = Some(delay);
    }

    /// OCR fails on pages of this shade.
    pub fn fail_ocr_on(&self, shade: u8) {
        self.state.ocr_fail_shades.lock().insert(shade);
    }

    /// Cancel `token` when the `call`-th inpaint (1-based) finishes.
    pub fn cancel_after_inpaint(&self, call: usize, token: CancellationToken) {
        *self.state.cancel_on_inpaint.lock() = Some((call, token));
    }

    pub fn translate_calls(&self) -> usize {
        self.state.translate_calls.load(Ordering::SeqCst)
    }

    pub fn inpaint_calls(&self) -> usize {
        self.state.inpaint_calls.load(Ordering::SeqCst)
    }

    pub fn render_calls(&self) -> usize {
        self.state.render_calls.load(Ordering::SeqCst)
    }
}

fn shade(image: &RgbImage) -> u8 {
    image.get_pixel(0, 0).0[0]
}

impl TextDetector for FakeModels {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BBox>, StageError> {
        if let Some(delay) = *self.state.detect_delay.lock() {
            std::thread::sleep(delay);
        }
        if shade(image) == BLANK_SHADE {
            return Ok(Vec::new());
        }
        Ok(vec![[0, 0, image.width(), image.height()]])
    }
}

impl OcrEngine for FakeModels {
    fn recognize(&self, image: &RgbImage, blocks: &mut [TextBlock]) -> Result<(), StageError> {
        if self.state.ocr_fail_shades.lock().contains(&shade(image)) {
            return Err(StageError::failed("ocr engine crashed"));
        }
        for block in blocks {
            block.source_text = "안녕하세요".to_string();
        }
        Ok(())
    }
}

impl Inpainter for FakeModels {
    fn inpaint(&self, image: &RgbImage, mask: &GrayImage) -> Result<DynamicImage, StageError> {
        let call = self.state.inpaint_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut cleaned = image.clone();
        for (x, y, m) in mask.enumerate_pixels() {
            if m.0[0] > 0 {
                cleaned.put_pixel(x, y, image::Rgb([255, 255, 255]));
            }
        }
        if let Some((at, token)) = self.state.cancel_on_inpaint.lock().as_ref() {
            if *at == call {
                token.cancel();
            }
        }
        // Hand back a non-RGB8 image so callers must normalize it.
        Ok(DynamicImage::ImageRgba8(DynamicImage::ImageRgb8(cleaned).to_rgba8()))
    }
}

#[async_trait]
impl Translator for FakeModels {
    async fn translate(
        &self,
        blocks: &mut [TextBlock],
        _hints: &TranslationHints,
    ) -> Result<(), StageError> {
        self.state.translate_calls.fetch_add(1, Ordering::SeqCst);
        let empty = self.state.empty_translation.load(Ordering::SeqCst);
        for block in blocks {
            block.translation = if empty { String::new() } else { "hello".to_string() };
        }
        Ok(())
    }
}

impl TextRenderer for FakeModels {
    fn render(
        &self,
        image: &mut RgbImage,
        blocks: &[RenderBlock],
        _style: &RenderStyle,
    ) -> Result<(), StageError> {
        self.state.render_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_render.load(Ordering::SeqCst) {
            return Err(StageError::failed("glyph cache exhausted"));
        }
        for block in blocks {
            let [x, y, _, _] = block.bbox;
            image.put_pixel(x, y, image::Rgb([0, 0, 0]));
        }
        Ok(())
    }
}

impl ModelFactory for FakeModels {
    fn detector(
        &self,
        _model_files: &[PathBuf],
        _device: &str,
    ) -> Result<Arc<dyn TextDetector>, StageError> {
        if self.state.fail_detector_build.load(Ordering::SeqCst) {
            return Err(StageError::Load {
                model: "detector".to_string(),
                reason: "weights missing".to_string(),
            });
        }
        Ok(Arc::new(self.clone()))
    }

    fn ocr(&self, _source_lang: &str) -> Result<Arc<dyn OcrEngine>, StageError> {
        Ok(Arc::new(self.clone()))
    }

    fn inpainter(&self, _kind: &str, _device: &str) -> Result<Arc<dyn Inpainter>, StageError> {
        Ok(Arc::new(self.clone()))
    }

    fn renderer(&self) -> Result<Arc<dyn TextRenderer>, StageError> {
        Ok(Arc::new(self.clone()))
    }
}

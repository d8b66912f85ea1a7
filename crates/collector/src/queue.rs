//! Job queue with a single-flight worker.
//!
//! Jobs are drained in FIFO order by at most one worker at a time. The
//! worker is spawned by the first `append` that finds the queue idle and
//! exits once the queue is empty; the next `append` starts a new one.
//!
//! Pipeline responses re-enter the queue as completion items, so every
//! chapter status change happens on the worker. The queue remembers which
//! requests are outstanding; a translation status left `LOADING` without one
//! belongs to an interrupted run and is reset before the chapter is touched.

use crate::bridge::{BridgeError, PipelineBridge};
use crate::bus::ProgressBus;
use crate::cache::{CacheError, MetadataCache};
use crate::download::PageDownloader;
use crate::events::{
    BusEvent, ChapterPhase, PipelineResponse, PipelineStatus, Progress, ProgressEvent,
};
use crate::fsops;
use crate::metrics::{ActiveJobMetrics, MetricsSnapshot, SharedMetrics};
use crate::models::{ChapterRef, Job, Status, StatusField, Task};
use crate::paths::Layout;
use crate::state::{ChapterEvent, TransitionError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors that abort the rest of a job.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("pipeline handoff failed: {0}")]
    Bridge(#[from] BridgeError),

    #[error("metadata unavailable: {0}")]
    Cache(#[from] CacheError),
}

enum QueueItem {
    Job(Job),
    PipelineDone(PipelineResponse),
}

/// FIFO of jobs plus the worker that drains it. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    items: Mutex<VecDeque<QueueItem>>,
    worker_active: AtomicBool,
    worker_starts: AtomicU64,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    idle: Notify,
    stop: CancellationToken,
    /// Outstanding pipeline requests by id.
    in_flight: Mutex<HashMap<Uuid, (String, u32)>>,
    cache: Arc<MetadataCache>,
    downloader: PageDownloader,
    bridge: Option<Arc<PipelineBridge>>,
    bus: Arc<ProgressBus>,
    metrics: SharedMetrics,
}

impl JobQueue {
    /// Build the queue. With a bridge, a listener for pipeline responses is
    /// spawned, so this must run inside a tokio runtime.
    pub fn new(
        cache: Arc<MetadataCache>,
        downloader: PageDownloader,
        bridge: Option<Arc<PipelineBridge>>,
        bus: Arc<ProgressBus>,
        metrics: SharedMetrics,
    ) -> Self {
        let inner = Arc::new(Inner {
            items: Mutex::new(VecDeque::new()),
            worker_active: AtomicBool::new(false),
            worker_starts: AtomicU64::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            idle: Notify::new(),
            stop: CancellationToken::new(),
            in_flight: Mutex::new(HashMap::new()),
            cache,
            downloader,
            bridge,
            bus,
            metrics,
        });
        if let Some(bridge) = &inner.bridge {
            spawn_response_listener(&inner, bridge.reply_topic());
        }
        Self { inner }
    }

    /// Enqueue `job` and make sure a worker is draining the queue.
    pub fn append(&self, job: Job) -> Uuid {
        let id = job.id;
        info!(job_id = %id, title_id = %job.title_id, task = %job.task, "job queued");
        self.inner.push(QueueItem::Job(job));
        Inner::kick(&self.inner);
        id
    }

    pub fn is_worker_active(&self) -> bool {
        self.inner.worker_active.load(Ordering::SeqCst)
    }

    /// Items waiting to be claimed by the worker.
    pub fn pending(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// How many workers have been started so far.
    pub fn worker_starts(&self) -> u64 {
        self.inner.worker_starts.load(Ordering::SeqCst)
    }

    /// Largest number of workers ever observed running at once.
    pub fn peak_workers(&self) -> usize {
        self.inner.peak_running.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.inner.cache
    }

    /// Pipeline requests sent and not yet answered.
    pub fn translations_in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Wait until the queue is empty and no worker is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_worker_active() && self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn spawn_response_listener(inner: &Arc<Inner>, topic: &str) {
    let mut responses = inner.bus.subscribe(topic);
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let stop = inner.stop.clone();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = responses.recv() => event,
            };
            match event {
                Ok(BusEvent::PipelineResponse(response)) => {
                    let Some(inner) = weak.upgrade() else { break };
                    debug!(request_id = %response.request_id, "pipeline response queued");
                    inner.push(QueueItem::PipelineDone(response));
                    Inner::kick(&inner);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "pipeline responses lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl Inner {
    fn push(&self, item: QueueItem) {
        self.items.lock().push_back(item);
    }

    fn layout(&self) -> &Layout {
        self.downloader.layout()
    }

    fn translating(&self, title_id: &str, index: u32) -> bool {
        self.in_flight
            .lock()
            .values()
            .any(|(title, chapter)| title == title_id && *chapter == index)
    }

    /// Reset statuses stranded in `LOADING` by an interrupted run. Nothing
    /// else downloads while the worker runs, and a translation is only
    /// `LOADING` while its request is outstanding.
    async fn reconcile(&self, title_id: &str, index: u32) {
        self.cache.ensure(title_id).await;
        let Some(chapter) = self.cache.chapter(title_id, index) else {
            return;
        };
        if chapter.translation_status == Status::Loading && !self.translating(title_id, index) {
            self.reset(title_id, index, StatusField::Translation).await;
        }
        if chapter.download_status == Status::Loading {
            self.reset(title_id, index, StatusField::Download).await;
        }
    }

    async fn reset(&self, title_id: &str, index: u32, field: StatusField) {
        match self
            .cache
            .apply_event(title_id, index, ChapterEvent::Reset(field))
            .await
        {
            Ok(_) => info!(chapter = index, %field, "reset stale LOADING status"),
            Err(e) => warn!(chapter = index, %field, error = %e, "failed to reset stale status"),
        }
    }

    /// Start a worker unless one is already running.
    fn kick(this: &Arc<Self>) {
        if this
            .worker_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            this.worker_starts.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(Self::run_worker(this.clone()));
        }
    }

    fn claim_slot(&self) {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(running, Ordering::SeqCst);
    }

    async fn run_worker(this: Arc<Self>) {
        this.claim_slot();
        let starts = this.worker_starts.load(Ordering::SeqCst);
        this.record(|m| {
            m.worker_active = true;
            m.worker_starts = starts;
        })
        .await;
        debug!("queue worker started");

        loop {
            let next = this.items.lock().pop_front();
            let Some(item) = next else {
                this.record(|m| {
                    m.worker_active = false;
                    m.queue_len = 0;
                })
                .await;
                this.running.fetch_sub(1, Ordering::SeqCst);
                this.worker_active.store(false, Ordering::SeqCst);

                // An append may have landed between the pop and the store.
                let more = !this.items.lock().is_empty();
                if more
                    && this
                        .worker_active
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    this.claim_slot();
                    this.record(|m| m.worker_active = true).await;
                    continue;
                }
                break;
            };

            let pending = this.items.lock().len();
            this.record(|m| m.queue_len = pending).await;

            // A panicking item takes down its own task, not the worker.
            let worker = this.clone();
            if let Err(e) = tokio::spawn(async move { worker.run_item(item).await }).await {
                error!(error = %e, "queue item panicked");
                this.record(|m| {
                    m.failed_jobs += 1;
                    m.active_job = None;
                })
                .await;
            }
        }

        debug!("queue worker stopped");
        this.idle.notify_waiters();
    }

    async fn record(&self, update: impl FnOnce(&mut MetricsSnapshot) + Send) {
        update(&mut *self.metrics.write().await);
    }

    fn publish(&self, title_id: &str, event: ProgressEvent) {
        self.bus.publish_progress(title_id, event);
    }

    fn publish_chapter(&self, title_id: &str, chapter: &ChapterRef, phase: ChapterPhase) {
        self.publish(title_id, ProgressEvent::chapter(chapter, phase, None));
    }

    async fn run_item(self: Arc<Self>, item: QueueItem) {
        match item {
            QueueItem::Job(job) => {
                self.record(|m| {
                    m.active_job = Some(ActiveJobMetrics {
                        id: job.id.to_string(),
                        title_id: job.title_id.clone(),
                        task: job.task.to_string(),
                        chapter_index: None,
                        chapters_done: 0,
                        chapters_total: job.chapters.len(),
                    })
                })
                .await;

                let result = match job.task {
                    Task::Remove => self.run_removal(&job).await,
                    Task::Download | Task::DownloadTranslate => self.run_download(&job).await,
                };
                self.persist(&job.title_id).await;

                match result {
                    Ok(()) => {
                        info!(job_id = %job.id, "job finished");
                        self.record(|m| m.completed_jobs += 1).await;
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "job aborted");
                        self.publish(&job.title_id, ProgressEvent::error(None, e.to_string()));
                        self.record(|m| m.failed_jobs += 1).await;
                    }
                }
                self.record(|m| m.active_job = None).await;
            }
            QueueItem::PipelineDone(response) => {
                let title_id = response.title_id.clone();
                self.finish_translation(response).await;
                self.persist(&title_id).await;
            }
        }
    }

    async fn persist(&self, title_id: &str) {
        if let Err(e) = self.cache.persist(title_id).await {
            warn!(title_id, error = %e, "failed to persist title");
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, title_id = %job.title_id))]
    async fn run_download(&self, job: &Job) -> Result<(), QueueError> {
        let title_id = job.title_id.as_str();
        self.cache.adopt_chapters(title_id, &job.chapters).await;

        let total = job.chapters.len() as u32;
        for (position, given) in job.chapters.iter().enumerate() {
            let progress = Progress {
                current: position as u32 + 1,
                total,
            };
            self.record(|m| {
                if let Some(active) = m.active_job.as_mut() {
                    active.chapter_index = Some(given.index);
                }
            })
            .await;

            let pages = self.download_chapter(title_id, given.index, progress).await;

            self.record(|m| {
                if let Some(active) = m.active_job.as_mut() {
                    active.chapters_done = position + 1;
                }
            })
            .await;

            if let (Some(pages), true) = (pages, job.task.translates()) {
                self.forward(title_id, given.index, pages).await?;
            }
        }
        Ok(())
    }

    /// Download one chapter. Failures are reported on the title topic and
    /// leave the chapter `NOT_READY`.
    async fn download_chapter(
        &self,
        title_id: &str,
        index: u32,
        progress: Progress,
    ) -> Option<Vec<PathBuf>> {
        self.reconcile(title_id, index).await;

        let chapter = match self
            .cache
            .apply_event(title_id, index, ChapterEvent::DownloadStarted)
            .await
        {
            Ok(chapter) => chapter,
            Err(e) => {
                warn!(chapter = index, error = %e, "chapter not downloadable");
                self.publish(title_id, ProgressEvent::error(Some(index), e.to_string()));
                return None;
            }
        };
        self.publish_chapter(title_id, &chapter, ChapterPhase::Downloading);

        match self.downloader.download(title_id, &chapter).await {
            Ok(downloaded) => {
                let chapter = match self
                    .cache
                    .apply_event(title_id, index, ChapterEvent::DownloadSucceeded)
                    .await
                {
                    Ok(chapter) => chapter,
                    Err(e) => {
                        self.publish(title_id, ProgressEvent::error(Some(index), e.to_string()));
                        return None;
                    }
                };
                info!(
                    chapter = index,
                    fetched = downloaded.fetched,
                    reused = downloaded.reused,
                    "chapter downloaded"
                );
                self.record(|m| {
                    m.chapters_downloaded += 1;
                    m.pages_fetched += downloaded.fetched as u64;
                    m.pages_reused += downloaded.reused as u64;
                })
                .await;
                self.publish(
                    title_id,
                    ProgressEvent::chapter(&chapter, ChapterPhase::Downloaded, Some(progress)),
                );
                Some(downloaded.pages)
            }
            Err(e) => {
                warn!(chapter = index, error = %e, "chapter download failed");
                if let Err(e) = self
                    .cache
                    .apply_event(title_id, index, ChapterEvent::DownloadFailed)
                    .await
                {
                    warn!(chapter = index, error = %e, "failed to record download failure");
                }
                self.record(|m| m.chapters_failed += 1).await;
                self.publish(title_id, ProgressEvent::error(Some(index), e.to_string()));
                None
            }
        }
    }

    /// Hand a downloaded chapter to the pipeline. A failed handoff aborts
    /// the job.
    async fn forward(&self, title_id: &str, index: u32, pages: Vec<PathBuf>) -> Result<(), QueueError> {
        let Some(bridge) = &self.bridge else {
            self.publish(
                title_id,
                ProgressEvent::error(Some(index), "translation is not configured"),
            );
            return Ok(());
        };

        let chapter = match self
            .cache
            .apply_event(title_id, index, ChapterEvent::TranslationAccepted)
            .await
        {
            Ok(chapter) => chapter,
            Err(e) => {
                warn!(chapter = index, error = %e, "chapter not translatable");
                self.publish(title_id, ProgressEvent::error(Some(index), e.to_string()));
                return Ok(());
            }
        };
        self.publish_chapter(title_id, &chapter, ChapterPhase::Translating);

        let output_dir = self.layout().translated_dir(title_id, index);
        let request = bridge.prepare(title_id, index, pages, output_dir);
        let request_id = request.request_id;
        self.in_flight
            .lock()
            .insert(request_id, (title_id.to_string(), index));
        if let Err(e) = bridge.request(request).await {
            self.in_flight.lock().remove(&request_id);
            match self
                .cache
                .apply_event(title_id, index, ChapterEvent::TranslationFailed)
                .await
            {
                Ok(chapter) => self.publish_chapter(title_id, &chapter, ChapterPhase::NotReady),
                Err(e) => warn!(chapter = index, error = %e, "failed to record handoff failure"),
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn finish_translation(&self, response: PipelineResponse) {
        let title_id = response.title_id.as_str();
        let index = response.chapter_index;
        if self.in_flight.lock().remove(&response.request_id).is_none() {
            warn!(
                title_id,
                chapter = index,
                request_id = %response.request_id,
                "response for unknown pipeline request"
            );
            return;
        }
        let (event, phase) = match response.status {
            PipelineStatus::Done => (ChapterEvent::TranslationCompleted, ChapterPhase::Translated),
            PipelineStatus::Skipped => (ChapterEvent::TranslationSkipped, ChapterPhase::NotReady),
            PipelineStatus::Failed => (ChapterEvent::TranslationFailed, ChapterPhase::NotReady),
        };

        match self.cache.apply_event(title_id, index, event).await {
            Ok(chapter) => {
                info!(
                    title_id,
                    chapter = index,
                    status = ?response.status,
                    skipped = response.skipped_images.len(),
                    "translation finished"
                );
                self.publish_chapter(title_id, &chapter, phase);
            }
            Err(e) => warn!(title_id, chapter = index, error = %e, "stale pipeline response"),
        }

        let skipped = response.skipped_images.len() as u64;
        let status = response.status;
        self.record(|m| {
            m.images_skipped += skipped;
            match status {
                PipelineStatus::Done => m.chapters_translated += 1,
                PipelineStatus::Skipped => m.chapters_skipped += 1,
                PipelineStatus::Failed => m.chapters_failed += 1,
            }
        })
        .await;

        if let Some(error) = response.error {
            self.publish(title_id, ProgressEvent::error(Some(index), error));
        }
    }

    /// Delete the selected artifacts of each chapter.
    #[instrument(skip_all, fields(job_id = %job.id, title_id = %job.title_id))]
    async fn run_removal(&self, job: &Job) -> Result<(), QueueError> {
        let title_id = job.title_id.as_str();
        for given in &job.chapters {
            self.reconcile(title_id, given.index).await;
            for field in job.remove.fields() {
                let chapter = match self
                    .cache
                    .apply_event(title_id, given.index, ChapterEvent::RemoveRequested(field))
                    .await
                {
                    Ok(chapter) => chapter,
                    Err(CacheError::Transition(e @ TransitionError::TranslationInFlight { .. })) => {
                        warn!(chapter = given.index, %field, error = %e, "chapter busy, not removed");
                        self.publish(title_id, ProgressEvent::error(Some(given.index), e.to_string()));
                        continue;
                    }
                    Err(e) => {
                        debug!(chapter = given.index, %field, error = %e, "nothing to remove");
                        continue;
                    }
                };
                self.publish_chapter(title_id, &chapter, ChapterPhase::Removing);

                let dir = match field {
                    StatusField::Download => self.layout().pages_dir(title_id, given.index),
                    StatusField::Translation => self.layout().translated_dir(title_id, given.index),
                };
                if let Err(e) = fsops::remove_tree(&dir).await {
                    warn!(error = %e, "failed to remove chapter files");
                    self.publish(title_id, ProgressEvent::error(Some(given.index), e.to_string()));
                }

                let chapter = self
                    .cache
                    .apply_event(title_id, given.index, ChapterEvent::RemoveFinished(field))
                    .await?;
                self.record(|m| m.chapters_removed += 1).await;
                self.publish_chapter(title_id, &chapter, ChapterPhase::Removed);
            }
        }
        fsops::remove_empty_dirs(&self.layout().title_dir(title_id));
        Ok(())
    }
}

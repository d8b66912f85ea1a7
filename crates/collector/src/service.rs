//! Collector startup and main loop
//!
//! Wires the source, library store, metadata cache, job queue, pipeline
//! bridge and metrics together and runs them until shutdown.

use crate::bridge::PipelineBridge;
use crate::bus::{title_topic, ProgressBus};
use crate::cache::{CacheError, MetadataCache, Provenance};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::download::PageDownloader;
use crate::enrich::{MangadexClient, TitleEnricher};
use crate::events::BusEvent;
use crate::library::{JsonLibrary, TitleStore};
use crate::metrics::{collect_system_metrics, new_shared_metrics, now_unix_ms, SharedMetrics};
use crate::metrics_server::run_metrics_server;
use crate::models::{Job, Title};
use crate::paths::Layout;
use crate::pipeline::contracts::{ModelFactory, Translator, UnconfiguredModels};
use crate::pipeline::TranslationPipeline;
use crate::queue::JobQueue;
use crate::source::{RemoteSource, SourceError, TitleParser, ToonkorSource};
use crate::startup::{check_base_url, run_startup_checks, StartupError};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const METRICS_REFRESH: Duration = Duration::from_millis(500);

/// Error type for collector operations
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Metadata error: {0}")]
    Cache(#[from] CacheError),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid job submission: {0}")]
    Submission(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// External collaborators the collector is built from.
pub struct Components {
    pub source: Arc<dyn RemoteSource>,
    pub store: Arc<dyn TitleStore>,
    pub models: Arc<dyn ModelFactory>,
    pub translator: Arc<dyn Translator>,
    pub enricher: Option<Arc<dyn TitleEnricher>>,
}

impl Components {
    /// HTTP source, JSON library and MangaDex enrichment from `config`.
    ///
    /// No model backend is linked into this crate; translation batches fail
    /// at model load until a real factory is supplied.
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        Self::from_config_with_parser(config, None)
    }

    /// Like [`Components::from_config`], with the title page parser for the
    /// configured mirror. Without one, titles resolve from the library only.
    pub fn from_config_with_parser(
        config: &Config,
        parser: Option<Arc<dyn TitleParser>>,
    ) -> Result<Self, ServiceError> {
        let mut source = ToonkorSource::new(&config.source)?;
        match parser {
            Some(parser) => source = source.with_parser(parser),
            None => warn!("no title parser configured, titles resolve from the library only"),
        }
        let enricher: Option<Arc<dyn TitleEnricher>> = if config.source.enrich {
            Some(Arc::new(MangadexClient::new(&config.source)?))
        } else {
            None
        };
        Ok(Self {
            source: Arc::new(source),
            store: Arc::new(JsonLibrary::new(&config.storage.library_dir)),
            models: Arc::new(UnconfiguredModels),
            translator: Arc::new(UnconfiguredModels),
            enricher,
        })
    }
}

/// Collector state containing all runtime components
pub struct Collector {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    bus: Arc<ProgressBus>,
    bridge: Arc<PipelineBridge>,
    queue: JobQueue,
    layout: Layout,
    shutdown: CancellationToken,
}

impl Collector {
    /// Load config from file, apply environment overrides, run the startup
    /// checks and build the default components.
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, ServiceError> {
        let config = Config::load(config_path)?;
        let components = Components::from_config(&config)?;
        Self::with_config(config, components)
    }

    /// Initialize with an existing configuration. Startup checks still run.
    pub fn with_config(config: Config, components: Components) -> Result<Self, ServiceError> {
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config, components))
    }

    /// Initialize without running startup checks.
    ///
    /// Spawns the queue's response listener, so it must be called inside a
    /// tokio runtime.
    pub fn new_without_checks(config: Config, components: Components) -> Self {
        let concurrency_plan = derive_plan(&config);
        let metrics = new_shared_metrics();
        let bus = Arc::new(ProgressBus::new(config.bus.capacity));

        let mut cache = MetadataCache::new(components.source.clone(), components.store);
        if let Some(enricher) = components.enricher {
            cache = cache.with_enricher(enricher);
        }

        let layout = Layout::new(&config.storage.data_dir);
        let downloader = PageDownloader::new(
            components.source,
            layout.clone(),
            concurrency_plan.page_fetch_workers as usize,
            config.download.page_retries,
        );

        let pipeline = TranslationPipeline::new(
            config.pipeline.clone(),
            components.models,
            components.translator,
            bus.clone(),
        );
        let bridge = Arc::new(PipelineBridge::new(
            pipeline,
            bus.clone(),
            config.bridge.clone(),
        ));

        let queue = JobQueue::new(
            Arc::new(cache),
            downloader,
            Some(bridge.clone()),
            bus.clone(),
            metrics.clone(),
        );

        info!(
            cores = concurrency_plan.total_cores,
            page_workers = concurrency_plan.page_fetch_workers,
            data_dir = %config.storage.data_dir.display(),
            "collector initialized"
        );

        Self {
            config,
            concurrency_plan,
            metrics,
            bus,
            bridge,
            queue,
            layout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Enqueue a job.
    pub fn submit(&self, job: Job) -> Result<Uuid, ServiceError> {
        if job.title_id.trim().is_empty() {
            return Err(ServiceError::Submission("empty title id".to_string()));
        }
        Ok(self.queue.append(job))
    }

    /// Parse a JSON job submission and enqueue it.
    pub fn submit_json(&self, json: &str) -> Result<Uuid, ServiceError> {
        let job = Job::from_submission(json).map_err(|e| ServiceError::Submission(e.to_string()))?;
        self.submit(job)
    }

    /// Progress events for one title.
    pub fn subscribe_title(&self, title_id: &str) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe(&title_topic(title_id))
    }

    /// Title record through the metadata cache.
    pub async fn title(&self, title_id: &str) -> Result<(Title, Provenance), ServiceError> {
        Ok(self.queue.cache().get(title_id).await?)
    }

    /// Add a title to the library, fetching it first when it is unknown.
    pub async fn add_to_library(&self, title_id: &str) -> Result<Title, ServiceError> {
        let title = self.queue.cache().add_to_library(title_id).await?;
        info!(title_id, "title added to library");
        Ok(title)
    }

    /// Drop a title's library record. Downloaded files are left alone.
    pub async fn remove_from_library(&self, title_id: &str) -> Result<bool, ServiceError> {
        let removed = self.queue.cache().remove_from_library(title_id).await?;
        info!(title_id, removed, "title removed from library");
        Ok(removed)
    }

    /// Titles with chapter files under the data directory.
    pub fn stored_titles(&self) -> Result<Vec<String>, ServiceError> {
        Ok(self.layout.stored_titles()?)
    }

    /// Point the source at a new domain. Cached titles are refetched on next
    /// access when the value changes.
    pub fn set_base_url(&self, url: &str) -> Result<bool, ServiceError> {
        check_base_url(url)?;
        Ok(self.queue.cache().set_base_url(url))
    }

    pub fn bus(&self) -> Arc<ProgressBus> {
        self.bus.clone()
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Token that stops the server, the updater and `run`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the metrics HTTP server on the configured address
    pub fn start_metrics_server(&self) -> Result<JoinHandle<()>, ServiceError> {
        let addr: SocketAddr = self.config.metrics.addr.parse().map_err(|e| {
            ServiceError::Server(format!("invalid metrics address {}: {}", self.config.metrics.addr, e))
        })?;
        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();
        Ok(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, addr, shutdown).await {
                error!(error = %e, "metrics server error");
            }
        }))
    }

    /// Start the metrics update task
    ///
    /// Periodically refreshes system metrics and the queue view.
    pub fn start_metrics_updater(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let system = collect_system_metrics();
                {
                    let mut snapshot = metrics.write().await;
                    snapshot.system = system;
                    snapshot.timestamp_unix_ms = now_unix_ms();
                    snapshot.queue_len = queue.pending();
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(METRICS_REFRESH) => {}
                }
            }
        })
    }

    /// Block until shutdown is requested, then let the worker drain and stop
    /// the pipeline engine.
    pub async fn run(&self) -> Result<(), ServiceError> {
        self.shutdown.cancelled().await;
        info!(pending = self.queue.pending(), "shutdown requested, draining queue");
        self.bridge.cancel().await;
        self.queue.wait_idle().await;
        self.bridge.shutdown().await;
        info!("collector stopped");
        Ok(())
    }

    /// Run with the metrics server (when enabled) and updater.
    pub async fn run_with_server(&self) -> Result<(), ServiceError> {
        let _server_handle = if self.config.metrics.enabled {
            Some(self.start_metrics_server()?)
        } else {
            None
        };
        let _updater_handle = self.start_metrics_updater();
        self.run().await
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChapterPhase, ProgressEvent};
    use crate::models::{ChapterRef, Status};
    use crate::testing::{FakeModels, FakeSource, MemoryStore};
    use tempfile::TempDir;

    struct Fixture {
        collector: Collector,
        source: Arc<FakeSource>,
        store: Arc<MemoryStore>,
        _temp_dir: TempDir,
    }

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = temp_dir.path().join("data");
        config.storage.library_dir = temp_dir.path().join("library");
        config.source.enrich = false;
        config.download.page_concurrency = 4;
        config.metrics.addr = "127.0.0.1:0".to_string();
        config
    }

    fn components(source: Arc<FakeSource>, store: Arc<MemoryStore>) -> Components {
        let models = FakeModels::default();
        Components {
            source,
            store,
            models: Arc::new(models.clone()),
            translator: Arc::new(models),
            enricher: None,
        }
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        let mut title = Title::bare("T1");
        title.chapters = (1..=2).map(ChapterRef::new).collect();
        source.add_title(title);
        let store = Arc::new(MemoryStore::default());
        let collector = Collector::new_without_checks(
            create_test_config(&temp_dir),
            components(source.clone(), store.clone()),
        );
        Fixture {
            collector,
            source,
            store,
            _temp_dir: temp_dir,
        }
    }

    #[tokio::test]
    async fn test_collector_initialization_without_checks() {
        let f = fixture();
        assert_eq!(f.collector.concurrency_plan.page_fetch_workers, 4);
        assert!(!f.collector.queue().is_worker_active());

        let metrics = f.collector.metrics.read().await;
        assert_eq!(metrics.completed_jobs, 0);
        assert!(metrics.active_job.is_none());
    }

    #[tokio::test]
    async fn test_with_config_runs_startup_checks() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.source.base_url = "not a url".to_string();
        let result = Collector::with_config(
            config,
            components(Arc::new(FakeSource::new()), Arc::new(MemoryStore::default())),
        );
        assert!(matches!(result, Err(ServiceError::Startup(_))));
    }

    #[tokio::test]
    async fn test_submit_json_runs_download() {
        let f = fixture();
        f.source.add_pages("T1", 2, 2);
        let mut rx = f.collector.subscribe_title("T1");

        f.collector
            .submit_json(r#"{"task":"download","title_id":"T1","chapters":[{"index":2}]}"#)
            .unwrap();
        f.collector.queue().wait_idle().await;

        let mut phases = Vec::new();
        while let Ok(BusEvent::Progress(ProgressEvent::Chapter { status, .. })) = rx.try_recv() {
            phases.push(status);
        }
        assert_eq!(phases, vec![ChapterPhase::Downloading, ChapterPhase::Downloaded]);
        assert_eq!(
            f.store.get("T1").unwrap().chapter(2).unwrap().download_status,
            Status::Ready
        );
        assert_eq!(f.collector.metrics.read().await.completed_jobs, 1);
    }

    #[tokio::test]
    async fn test_invalid_submissions_rejected() {
        let f = fixture();
        assert!(matches!(
            f.collector.submit_json(r#"{"task":"upload","title_id":"T1","chapters":[]}"#),
            Err(ServiceError::Submission(_))
        ));
        assert!(matches!(
            f.collector.submit(Job::new("  ", crate::models::Task::Download, Vec::new())),
            Err(ServiceError::Submission(_))
        ));
        assert_eq!(f.collector.queue().pending(), 0);
        assert_eq!(f.collector.queue().worker_starts(), 0);
    }

    #[tokio::test]
    async fn test_set_base_url_invalidates_cache() {
        let f = fixture();
        let (_, provenance) = f.collector.title("T1").await.unwrap();
        assert_eq!(provenance, Provenance::Remote);
        assert_eq!(f.collector.queue().cache().fresh_len(), 1);

        assert!(f.collector.set_base_url("ftp://mirror").is_err());
        assert!(!f.collector.set_base_url("https://toonkor.test").unwrap());
        assert_eq!(f.collector.queue().cache().fresh_len(), 1);

        assert!(f.collector.set_base_url("https://toonkor430.com").unwrap());
        assert_eq!(f.collector.queue().cache().fresh_len(), 0);
        let (_, provenance) = f.collector.title("T1").await.unwrap();
        assert_eq!(provenance, Provenance::Remote);
        assert_eq!(f.source.title_fetches(), 2);
    }

    #[tokio::test]
    async fn test_metrics_updater_refreshes_timestamp() {
        let f = fixture();
        let handle = f.collector.start_metrics_updater();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.collector.metrics.read().await.timestamp_unix_ms > 0);

        f.collector.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_metrics_addr() {
        let mut f = fixture();
        f.collector.config.metrics.addr = "localhost".to_string();
        assert!(matches!(
            f.collector.start_metrics_server(),
            Err(ServiceError::Server(_))
        ));
    }

    #[tokio::test]
    async fn test_run_with_server_stops_on_shutdown() {
        let f = fixture();
        f.source.add_pages("T1", 1, 1);
        f.collector
            .submit(Job::new("T1", crate::models::Task::Download, vec![ChapterRef::new(1)]))
            .unwrap();

        let token = f.collector.shutdown_token();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), f.collector.run_with_server())
            .await
            .unwrap()
            .unwrap();
        stopper.await.unwrap();
        assert!(!f.collector.queue().is_worker_active());
        assert_eq!(f.collector.queue().pending(), 0);
    }

    struct HeadingParser;

    impl TitleParser for HeadingParser {
        fn parse_title(&self, title_id: &str, document: &str) -> Result<Title, SourceError> {
            let name = document
                .split("<h1>")
                .nth(1)
                .and_then(|rest| rest.split("</h1>").next())
                .ok_or_else(|| SourceError::Parse("no heading".to_string()))?;
            let mut title = Title::bare(title_id);
            title.title = name.to_string();
            title.chapters = vec![ChapterRef::new(1)];
            Ok(title)
        }
    }

    async fn serve_title_page() -> SocketAddr {
        let app = axum::Router::new().route(
            "/T1",
            axum::routing::get(|| async { axum::response::Html("<h1>Solo Leveling</h1>") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_title_parser_feeds_library() {
        let addr = serve_title_page().await;
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.source.base_url = format!("http://{}", addr);

        let mut parts =
            Components::from_config_with_parser(&config, Some(Arc::new(HeadingParser))).unwrap();
        let store = Arc::new(MemoryStore::default());
        parts.store = store.clone();
        let collector = Collector::new_without_checks(config, parts);

        let title = collector.add_to_library("T1").await.unwrap();
        assert_eq!(title.title, "Solo Leveling");
        assert!(title.in_library);
        assert!(store.get("T1").unwrap().in_library);

        assert!(collector.remove_from_library("T1").await.unwrap());
        assert!(store.get("T1").is_none());
        assert!(!collector.remove_from_library("T1").await.unwrap());
    }

    #[tokio::test]
    async fn test_without_parser_titles_come_from_library() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let mut parts = Components::from_config(&config).unwrap();
        let store = Arc::new(MemoryStore::default());
        let mut stored = Title::bare("T1");
        stored.title = "Solo Leveling".to_string();
        store.insert(stored);
        parts.store = store;
        let collector = Collector::new_without_checks(config, parts);

        let (title, provenance) = collector.title("T1").await.unwrap();
        assert_eq!(title.title, "Solo Leveling");
        assert_eq!(provenance, Provenance::Persisted);
        assert!(collector.add_to_library("T2").await.is_err());
    }

    #[tokio::test]
    async fn test_stored_titles_lists_downloaded_titles() {
        let f = fixture();
        assert!(f.collector.stored_titles().unwrap().is_empty());

        f.source.add_pages("T1", 1, 1);
        f.collector
            .submit(Job::new("T1", crate::models::Task::Download, vec![ChapterRef::new(1)]))
            .unwrap();
        f.collector.queue().wait_idle().await;

        assert_eq!(f.collector.stored_titles().unwrap(), vec!["T1".to_string()]);
    }
}

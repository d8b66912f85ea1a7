//! Toonkor Collector
//!
//! Background service that downloads comic chapters from a Toonkor mirror,
//! tracks per-chapter download and translation status, and hands finished
//! downloads to the translation pipeline.

pub mod bridge;
pub mod bus;
pub mod cache;
pub mod concurrency;
pub mod download;
pub mod enrich;
pub mod events;
pub mod fsops;
pub mod library;
pub mod metrics;
pub mod metrics_server;
pub mod models;
pub mod paths;
pub mod pipeline;
pub mod queue;
pub mod service;
pub mod source;
pub mod startup;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use toonkor_collector_config as config;
pub use toonkor_collector_config::Config;
pub use bridge::{BridgeError, PipelineBridge};
pub use bus::{title_topic, ProgressBus};
pub use cache::{CacheError, MetadataCache, Provenance};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use events::{
    BusEvent, ChapterPhase, PipelineRequest, PipelineResponse, PipelineStatus, Progress,
    ProgressEvent,
};
pub use library::{JsonLibrary, LibraryError, TitleStore};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, ActiveJobMetrics, MetricsSnapshot, SharedMetrics,
    SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use models::{ChapterRef, Job, JobSubmission, RemoveChoices, Status, StatusField, Task, Title};
pub use pipeline::{BatchOutcome, PipelineError, TranslationPipeline};
pub use queue::{JobQueue, QueueError};
pub use service::{Collector, Components, ServiceError};
pub use source::{RemoteSource, SourceError, TitleParser, ToonkorSource};
pub use startup::{run_startup_checks, StartupError};
pub use state::{ChapterEvent, ChapterState, TransitionError};

//! Handoff between the job queue and the pipeline engine.
//!
//! The engine is a long-running task that listens on [`PIPELINE_TOPIC`],
//! runs one batch at a time in arrival order and publishes each response on
//! the request's reply topic. The bridge starts it on first use and makes
//! sure it answers a ready probe before the first request goes out.

use crate::bus::{ProgressBus, PIPELINE_TOPIC, QUEUE_TOPIC};
use crate::events::{BusEvent, PipelineRequest};
use crate::pipeline::{failed_response, TranslationPipeline};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toonkor_collector_config::BridgeConfig;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Topic the engine answers ready probes on.
pub const PROBE_TOPIC: &str = "pipeline:probe";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("pipeline engine did not answer {attempts} ready probes")]
    NotReady { attempts: u32 },

    #[error("pipeline engine is not listening")]
    EngineUnavailable,
}

/// Running engine tasks.
pub struct EngineHandle {
    /// Token of the batch in flight.
    current: Arc<Mutex<CancellationToken>>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Cancel the batch in flight, if any.
    pub fn cancel_current(&self) {
        self.current.lock().cancel();
    }

    async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Spawn the engine on the current runtime.
///
/// The pipeline topic is subscribed before this returns, so requests
/// published afterwards are never missed.
pub fn spawn_engine(
    mut pipeline: TranslationPipeline,
    bus: Arc<ProgressBus>,
    shutdown: CancellationToken,
) -> EngineHandle {
    let mut inbox = bus.subscribe(PIPELINE_TOPIC);
    let (tx, mut requests) = mpsc::unbounded_channel::<PipelineRequest>();
    let current = Arc::new(Mutex::new(shutdown.child_token()));

    let receiver = {
        let bus = bus.clone();
        let current = current.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = inbox.recv() => event,
                };
                match event {
                    Ok(BusEvent::Ping {
                        probe_id,
                        reply_topic,
                    }) => {
                        bus.publish(&reply_topic, BusEvent::Pong { probe_id });
                    }
                    Ok(BusEvent::CancelPipeline) => {
                        info!("cancel requested");
                        current.lock().cancel();
                    }
                    Ok(BusEvent::PipelineRequest(request)) => {
                        if tx.send(request).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "pipeline inbox lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("pipeline receiver stopped");
        })
    };

    let processor = {
        let current = current.clone();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };

                let token = shutdown.child_token();
                *current.lock() = token.clone();

                info!(
                    title_id = %request.title_id,
                    chapter = request.chapter_index,
                    pages = request.local_page_paths.len(),
                    "batch accepted"
                );
                let response = match pipeline.process_batch(&request, &token).await {
                    Ok(outcome) => outcome.into_response(&request),
                    Err(e) => {
                        error!(
                            title_id = %request.title_id,
                            chapter = request.chapter_index,
                            error = %e,
                            "batch failed"
                        );
                        failed_response(&request, &e)
                    }
                };
                bus.publish(&request.reply_topic, BusEvent::PipelineResponse(response));
            }
            debug!("pipeline processor stopped");
        })
    };

    EngineHandle {
        current,
        tasks: vec![receiver, processor],
    }
}

struct EngineSlot {
    /// Pipeline waiting for its engine to be started.
    pending: Option<TranslationPipeline>,
    handle: Option<EngineHandle>,
    ready: bool,
}

/// Requester side of the handoff.
pub struct PipelineBridge {
    bus: Arc<ProgressBus>,
    config: BridgeConfig,
    reply_topic: String,
    slot: tokio::sync::Mutex<EngineSlot>,
    shutdown: CancellationToken,
}

impl PipelineBridge {
    /// Bridge that starts an in-process engine around `pipeline` on first use.
    pub fn new(pipeline: TranslationPipeline, bus: Arc<ProgressBus>, config: BridgeConfig) -> Self {
        Self::with_slot(Some(pipeline), bus, config)
    }

    /// Bridge to an engine running elsewhere on the same bus.
    pub fn external(bus: Arc<ProgressBus>, config: BridgeConfig) -> Self {
        Self::with_slot(None, bus, config)
    }

    fn with_slot(
        pending: Option<TranslationPipeline>,
        bus: Arc<ProgressBus>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            bus,
            config,
            reply_topic: QUEUE_TOPIC.to_string(),
            slot: tokio::sync::Mutex::new(EngineSlot {
                pending,
                handle: None,
                ready: false,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Topic responses are published on.
    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    pub async fn is_started(&self) -> bool {
        self.slot.lock().await.handle.is_some()
    }

    /// Build a request for a downloaded chapter.
    pub fn prepare(
        &self,
        title_id: &str,
        chapter_index: u32,
        local_page_paths: Vec<PathBuf>,
        output_dir: PathBuf,
    ) -> PipelineRequest {
        PipelineRequest {
            request_id: Uuid::new_v4(),
            title_id: title_id.to_string(),
            chapter_index,
            local_page_paths,
            output_dir,
            source_lang: None,
            reply_topic: self.reply_topic.clone(),
        }
    }

    /// Start the engine if needed and wait until it answers a probe.
    pub async fn ensure_ready(&self) -> Result<(), BridgeError> {
        let mut slot = self.slot.lock().await;
        if slot.ready {
            return Ok(());
        }
        if let Some(pipeline) = slot.pending.take() {
            info!("starting pipeline engine");
            slot.handle = Some(spawn_engine(
                pipeline,
                self.bus.clone(),
                self.shutdown.child_token(),
            ));
        }
        self.handshake().await?;
        slot.ready = true;
        Ok(())
    }

    async fn handshake(&self) -> Result<(), BridgeError> {
        let attempts = self.config.probe_attempts.max(1);
        let wait = Duration::from_millis(self.config.probe_timeout_ms);
        let mut replies = self.bus.subscribe(PROBE_TOPIC);

        for attempt in 1..=attempts {
            let probe_id = Uuid::new_v4();
            self.bus.publish(
                PIPELINE_TOPIC,
                BusEvent::Ping {
                    probe_id,
                    reply_topic: PROBE_TOPIC.to_string(),
                },
            );

            let answered = tokio::time::timeout(wait, async {
                loop {
                    match replies.recv().await {
                        Ok(BusEvent::Pong { probe_id: id }) if id == probe_id => return true,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return false,
                    }
                }
            })
            .await;

            if matches!(answered, Ok(true)) {
                debug!(attempt, "pipeline engine ready");
                return Ok(());
            }
            debug!(attempt, "ready probe unanswered");
        }
        warn!(attempts, "pipeline engine never became ready");
        Err(BridgeError::NotReady { attempts })
    }

    /// Hand a chapter to the engine. Returns once the request is published;
    /// the response arrives later on the reply topic.
    pub async fn request(&self, request: PipelineRequest) -> Result<Uuid, BridgeError> {
        self.ensure_ready().await?;
        let request_id = request.request_id;
        debug!(%request_id, title_id = %request.title_id, "publishing pipeline request");
        if self
            .bus
            .publish(PIPELINE_TOPIC, BusEvent::PipelineRequest(request))
            == 0
        {
            return Err(BridgeError::EngineUnavailable);
        }
        Ok(request_id)
    }

    /// Cancel the batch in flight. Queued requests still run.
    pub async fn cancel(&self) {
        match self.slot.lock().await.handle.as_ref() {
            Some(handle) => handle.cancel_current(),
            None => {
                self.bus.publish(PIPELINE_TOPIC, BusEvent::CancelPipeline);
            }
        }
    }

    /// Stop the engine and wait for its tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = {
            let mut slot = self.slot.lock().await;
            slot.ready = false;
            slot.handle.take()
        };
        if let Some(handle) = handle {
            handle.join().await;
        }
    }
}

impl Drop for PipelineBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

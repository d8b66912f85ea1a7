//! Messages carried over the [`ProgressBus`](crate::bus::ProgressBus).
//!
//! Three families share one envelope ([`BusEvent`]):
//! chapter progress for observers, pipeline requests and responses between
//! the queue and the engine, and per-image pipeline ticks.

use crate::models::{ChapterRef, Status};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Chapters finished so far in the current job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
}

/// Human facing phase of a chapter, published as `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterPhase {
    Downloading,
    Downloaded,
    Translating,
    Translated,
    Removing,
    Removed,
    NotReady,
}

/// Event delivered to observers of a title topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Chapter {
        chapter_index: u32,
        status: ChapterPhase,
        download_status: Status,
        translation_status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<Progress>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chapter_index: Option<u32>,
        error: String,
    },
}

impl ProgressEvent {
    pub fn chapter(chapter: &ChapterRef, status: ChapterPhase, progress: Option<Progress>) -> Self {
        ProgressEvent::Chapter {
            chapter_index: chapter.index,
            status,
            download_status: chapter.download_status,
            translation_status: chapter.translation_status,
            progress,
        }
    }

    pub fn error(chapter_index: Option<u32>, error: impl Into<String>) -> Self {
        ProgressEvent::Error {
            chapter_index,
            error: error.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ProgressEvent::Error { .. })
    }
}

/// A chapter handed to the pipeline engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub request_id: Uuid,
    pub title_id: String,
    pub chapter_index: u32,
    /// Downloaded pages in page order.
    pub local_page_paths: Vec<PathBuf>,
    /// Where translated artifacts are written.
    pub output_dir: PathBuf,
    /// Overrides the configured source language for this chapter.
    #[serde(default)]
    pub source_lang: Option<String>,
    /// Topic the response is published on.
    pub reply_topic: String,
}

/// Outcome of a pipeline request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Batch completed; some images may still have been skipped.
    Done,
    /// Nothing was produced (cancelled, or no image had text).
    Skipped,
    /// Batch aborted on a fatal stage error.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub request_id: Uuid,
    pub title_id: String,
    pub chapter_index: u32,
    pub status: PipelineStatus,
    #[serde(default)]
    pub artifact_paths: Vec<PathBuf>,
    #[serde(default)]
    pub skipped_images: Vec<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Envelope for everything published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusEvent {
    Progress(ProgressEvent),
    PipelineRequest(PipelineRequest),
    PipelineResponse(PipelineResponse),
    /// Ready probe sent by the bridge before its first request.
    Ping { probe_id: Uuid, reply_topic: String },
    Pong { probe_id: Uuid },
    /// Cancel the batch currently being processed.
    CancelPipeline,
    ImageProgress {
        title_id: String,
        chapter_index: u32,
        image_index: usize,
        step: u32,
        total_steps: u32,
        new_stage: bool,
    },
    ImageSkipped {
        title_id: String,
        chapter_index: u32,
        image_index: usize,
        path: PathBuf,
        reason: String,
    },
    ImageProcessed {
        title_id: String,
        chapter_index: u32,
        image_index: usize,
        artifact: PathBuf,
    },
}

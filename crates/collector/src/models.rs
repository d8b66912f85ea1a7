//! Domain records shared by the queue, cache and pipeline.
//!
//! A chapter is always passed around as a [`ChapterRef`]; statuses are never
//! carried in loose maps.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of one chapter axis (download or translation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    NotReady,
    Loading,
    Ready,
    Removing,
}

impl Default for Status {
    fn default() -> Self {
        Self::NotReady
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::NotReady => write!(f, "NOT_READY"),
            Status::Loading => write!(f, "LOADING"),
            Status::Ready => write!(f, "READY"),
            Status::Removing => write!(f, "REMOVING"),
        }
    }
}

/// Which of the two status axes a change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusField {
    Download,
    Translation,
}

impl std::fmt::Display for StatusField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusField::Download => write!(f, "download_status"),
            StatusField::Translation => write!(f, "translation_status"),
        }
    }
}

/// One numbered installment of a title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
    /// Index as assigned by the remote source, unique within a title.
    pub index: u32,
    /// Upload time (unix seconds), 0 when unknown.
    #[serde(default)]
    pub date_upload: i64,
    /// Source specific chapter id used to build the chapter page url.
    #[serde(default, alias = "toonkor_id")]
    pub source_id: Option<String>,
    #[serde(default)]
    pub download_status: Status,
    #[serde(default)]
    pub translation_status: Status,
}

impl ChapterRef {
    /// A fresh chapter, `NOT_READY` on both axes.
    pub fn new(index: u32) -> Self {
        Self {
            index,
            date_upload: 0,
            source_id: None,
            download_status: Status::NotReady,
            translation_status: Status::NotReady,
        }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn status(&self, field: StatusField) -> Status {
        match field {
            StatusField::Download => self.download_status,
            StatusField::Translation => self.translation_status,
        }
    }

    pub fn set_status(&mut self, field: StatusField, value: Status) {
        match field {
            StatusField::Download => self.download_status = value,
            StatusField::Translation => self.translation_status = value,
        }
    }
}

/// A tracked comic series and its chapter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Title {
    /// Stable slug, immutable once assigned.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub en_title: Option<String>,
    #[serde(default)]
    pub en_description: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    /// MangaDex cross reference.
    #[serde(default)]
    pub mangadex_id: Option<String>,
    #[serde(default)]
    pub in_library: bool,
    #[serde(default)]
    pub chapters: Vec<ChapterRef>,
}

impl Title {
    /// A bare record holding only the id.
    pub fn bare(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            ..Self::default()
        }
    }

    pub fn chapter(&self, index: u32) -> Option<&ChapterRef> {
        self.chapters.iter().find(|c| c.index == index)
    }

    pub fn chapter_mut(&mut self, index: u32) -> Option<&mut ChapterRef> {
        self.chapters.iter_mut().find(|c| c.index == index)
    }

    /// Returns the chapter with `index`, appending a fresh one if it is missing.
    pub fn chapter_or_insert(&mut self, index: u32) -> &mut ChapterRef {
        let pos = match self.chapters.iter().position(|c| c.index == index) {
            Some(pos) => pos,
            None => {
                self.chapters.push(ChapterRef::new(index));
                self.chapters.len() - 1
            }
        };
        &mut self.chapters[pos]
    }
}

/// Kind of work a job asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Download,
    DownloadTranslate,
    Remove,
}

impl Task {
    /// Whether downloaded chapters are forwarded to the pipeline.
    pub fn translates(self) -> bool {
        matches!(self, Task::DownloadTranslate)
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Download => write!(f, "download"),
            Task::DownloadTranslate => write!(f, "download_translate"),
            Task::Remove => write!(f, "remove"),
        }
    }
}

/// Which artifacts a remove job deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoveChoices {
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub translated: bool,
}

impl RemoveChoices {
    /// Axes selected for removal, translation first.
    pub fn fields(&self) -> Vec<StatusField> {
        let mut fields = Vec::new();
        if self.translated {
            fields.push(StatusField::Translation);
        }
        if self.downloaded {
            fields.push(StatusField::Download);
        }
        fields
    }
}

/// Request body accepted from the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub task: Task,
    pub title_id: String,
    pub chapters: Vec<ChapterRef>,
    #[serde(default)]
    pub remove: RemoveChoices,
}

/// One queue element. Never mutated after it is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub title_id: String,
    pub task: Task,
    pub chapters: Vec<ChapterRef>,
    #[serde(default)]
    pub remove: RemoveChoices,
}

impl Job {
    pub fn new(title_id: impl Into<String>, task: Task, chapters: Vec<ChapterRef>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title_id: title_id.into(),
            task,
            chapters,
            remove: RemoveChoices::default(),
        }
    }

    /// A remove job for the given chapter indices.
    pub fn removal(title_id: impl Into<String>, indices: &[u32], remove: RemoveChoices) -> Self {
        Self {
            remove,
            ..Self::new(
                title_id,
                Task::Remove,
                indices.iter().map(|&i| ChapterRef::new(i)).collect(),
            )
        }
    }

    /// Parse a JSON submission and assign a fresh job id.
    pub fn from_submission(json: &str) -> Result<Self, serde_json::Error> {
        let submission: JobSubmission = serde_json::from_str(json)?;
        Ok(submission.into())
    }
}

impl From<JobSubmission> for Job {
    fn from(s: JobSubmission) -> Self {
        Self {
            id: Uuid::new_v4(),
            title_id: s.title_id,
            task: s.task,
            chapters: s.chapters,
            remove: s.remove,
        }
    }
}

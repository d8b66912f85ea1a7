//! Chapter page download.
//!
//! Pages of one chapter are fetched concurrently through a bounded pool
//! (semaphore + `JoinSet`). Pages already on disk are reused, so re-running
//! a download performs no network fetches for them.

use crate::fsops::{is_nonempty_file, write_atomic};
use crate::models::ChapterRef;
use crate::paths::Layout;
use crate::source::{RemoteSource, SourceError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

/// Error type for chapter downloads
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The page list could not be retrieved
    #[error("Failed to resolve page list: {0}")]
    PageList(#[source] SourceError),

    /// The chapter has no pages
    #[error("Chapter has no pages")]
    Empty,

    /// A page failed on every attempt
    #[error("Page {index} ({url}) failed: {reason}")]
    Page {
        index: usize,
        url: String,
        reason: String,
    },

    /// A fetch task panicked or was cancelled
    #[error("Page task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of a successful chapter download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedChapter {
    /// Local page files in page order.
    pub pages: Vec<PathBuf>,
    /// Pages fetched over the network.
    pub fetched: usize,
    /// Pages already present locally.
    pub reused: usize,
}

#[derive(Debug)]
enum PageOutcome {
    Fetched,
    Reused,
}

/// Downloads chapter pages into the data directory layout.
#[derive(Clone)]
pub struct PageDownloader {
    source: Arc<dyn RemoteSource>,
    layout: Layout,
    concurrency: usize,
    retries: u32,
}

impl PageDownloader {
    /// `concurrency` bounds in-flight fetches; each page gets `1 + retries` attempts.
    pub fn new(source: Arc<dyn RemoteSource>, layout: Layout, concurrency: usize, retries: u32) -> Self {
        Self {
            source,
            layout,
            concurrency: concurrency.max(1),
            retries,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Fetch every page of `chapter`. Waits for all page tasks to settle
    /// before reporting, even when one of them failed.
    #[instrument(skip(self, chapter), fields(chapter = chapter.index))]
    pub async fn download(
        &self,
        title_id: &str,
        chapter: &ChapterRef,
    ) -> Result<DownloadedChapter, DownloadError> {
        let urls = self
            .source
            .page_urls(title_id, chapter)
            .await
            .map_err(DownloadError::PageList)?;
        if urls.is_empty() {
            return Err(DownloadError::Empty);
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut pages = Vec::with_capacity(urls.len());

        for (index, url) in urls.into_iter().enumerate() {
            let path = self.layout.page_file(title_id, chapter.index, index, &url);
            pages.push(path.clone());

            let semaphore = semaphore.clone();
            let source = self.source.clone();
            let attempts = 1 + self.retries;
            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await;
                fetch_page(source.as_ref(), index, &url, &path, attempts).await
            });
        }

        let mut fetched = 0;
        let mut reused = 0;
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(PageOutcome::Fetched)) => fetched += 1,
                Ok(Ok(PageOutcome::Reused)) => reused += 1,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(DownloadError::Join(e));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        debug!(title_id, fetched, reused, "chapter pages ready");
        Ok(DownloadedChapter {
            pages,
            fetched,
            reused,
        })
    }
}

async fn fetch_page(
    source: &dyn RemoteSource,
    index: usize,
    url: &str,
    path: &std::path::Path,
    attempts: u32,
) -> Result<PageOutcome, DownloadError> {
    if is_nonempty_file(path).await {
        return Ok(PageOutcome::Reused);
    }

    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let result = match source.fetch_page(url).await {
            Ok(bytes) if bytes.is_empty() => Err("empty response body".to_string()),
            Ok(bytes) => write_atomic(path, &bytes).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => return Ok(PageOutcome::Fetched),
            Err(reason) => {
                warn!(url, attempt, attempts, %reason, "page fetch failed");
                last_error = reason;
            }
        }
    }

    Err(DownloadError::Page {
        index,
        url: url.to_string(),
        reason: last_error,
    })
}

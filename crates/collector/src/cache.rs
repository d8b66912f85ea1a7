//! Cache-aside metadata store.
//!
//! Merges the persisted record of a title with a live fetch from the remote
//! source and keeps the result for the lifetime of the process. Chapter
//! statuses are mutated in place; a status change never refetches the title.
//!
//! Reads go through a `DashMap`. A miss takes a per-title async lock so at
//! most one remote fetch per title is in flight, and no lock spanning other
//! titles is held while it runs.

use crate::enrich::TitleEnricher;
use crate::library::{LibraryError, TitleStore};
use crate::models::{ChapterRef, Status, StatusField, Title};
use crate::source::{RemoteSource, SourceError};
use crate::state::{ChapterEvent, TransitionError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Error type for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Neither a persisted record nor the remote source could supply the title
    #[error("Title {title_id} is unavailable: {source}")]
    Unavailable {
        title_id: String,
        #[source]
        source: SourceError,
    },

    /// Persisting the merged record failed
    #[error(transparent)]
    Library(#[from] LibraryError),

    /// A chapter event was rejected by the state machine
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Title {0} is not cached")]
    NotCached(String),
}

/// Where the record returned by [`MetadataCache::get`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Served from memory.
    Cache,
    /// Remote fetch failed; the persisted (possibly outdated) record was used.
    Persisted,
    /// Freshly merged with a remote fetch.
    Remote,
}

#[derive(Debug, Clone)]
struct Entry {
    title: Title,
    /// Built without the remote source; the next `get` retries it.
    stale: bool,
}

/// Title id to merged record.
pub struct MetadataCache {
    source: Arc<dyn RemoteSource>,
    store: Arc<dyn TitleStore>,
    enricher: Option<Arc<dyn TitleEnricher>>,
    entries: DashMap<String, Entry>,
    populate_locks: DashMap<String, Arc<Mutex<()>>>,
    generation: AtomicU64,
}

impl MetadataCache {
    pub fn new(source: Arc<dyn RemoteSource>, store: Arc<dyn TitleStore>) -> Self {
        Self {
            source,
            store,
            enricher: None,
            entries: DashMap::new(),
            populate_locks: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn TitleEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn source(&self) -> &Arc<dyn RemoteSource> {
        &self.source
    }

    /// Merged record for `title_id`, populating it on a miss.
    pub async fn get(&self, title_id: &str) -> Result<(Title, Provenance), CacheError> {
        if let Some(hit) = self.fresh(title_id) {
            return Ok((hit, Provenance::Cache));
        }

        let lock = self
            .populate_locks
            .entry(title_id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have populated it while we waited.
        if let Some(hit) = self.fresh(title_id) {
            return Ok((hit, Provenance::Cache));
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let persisted = match self.store.load(title_id).await {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(title_id, error = %e, "ignoring unreadable library record");
                None
            }
        };

        match self.source.fetch_title(title_id).await {
            Ok(remote) => {
                let mut merged = merge_title(persisted.as_ref(), remote);
                self.enrich(&mut merged).await;
                let merged = self.insert(title_id, merged, false, generation);
                debug!(title_id, chapters = merged.chapters.len(), "populated from remote");
                Ok((merged, Provenance::Remote))
            }
            Err(source) => match persisted {
                Some(persisted) => {
                    warn!(title_id, error = %source, "remote fetch failed, serving persisted record");
                    let title = self.insert(title_id, persisted, true, generation);
                    Ok((title, Provenance::Persisted))
                }
                None => Err(CacheError::Unavailable {
                    title_id: title_id.to_string(),
                    source,
                }),
            },
        }
    }

    fn fresh(&self, title_id: &str) -> Option<Title> {
        self.entries
            .get(title_id)
            .filter(|entry| !entry.stale)
            .map(|entry| entry.title.clone())
    }

    /// Store a populated record unless the cache was invalidated since
    /// `generation` was read. Statuses already cached win over `title`'s.
    fn insert(&self, title_id: &str, mut title: Title, stale: bool, generation: u64) -> Title {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(title_id, "cache invalidated during populate, not caching");
            return title;
        }
        let mut entry = self
            .entries
            .entry(title_id.to_string())
            .or_insert_with(|| Entry {
                title: title.clone(),
                stale,
            });
        carry_statuses(&entry.title, &mut title);
        entry.title = title;
        entry.stale = stale;
        entry.title.clone()
    }

    async fn enrich(&self, title: &mut Title) {
        let Some(enricher) = &self.enricher else {
            return;
        };
        if title.en_title.is_some() && title.mangadex_id.is_some() {
            return;
        }
        match enricher.enrich(title).await {
            Ok(true) => debug!(title_id = %title.id, "enriched title"),
            Ok(false) => {}
            Err(e) => warn!(title_id = %title.id, error = %e, "enrichment failed"),
        }
    }

    /// Make sure an entry for `title_id` exists, falling back to a bare record.
    pub async fn ensure(&self, title_id: &str) {
        if self.entries.contains_key(title_id) {
            return;
        }
        if let Err(e) = self.get(title_id).await {
            warn!(title_id, error = %e, "synthesizing bare title record");
        }
    }

    /// Set one status field of a cached chapter in place.
    ///
    /// Missing titles are populated first; a chapter the remote list does
    /// not know is added.
    pub async fn update_chapter_status(
        &self,
        title_id: &str,
        chapter_index: u32,
        field: StatusField,
        value: Status,
    ) -> ChapterRef {
        self.ensure(title_id).await;
        let mut entry = self.entry_or_bare(title_id);
        let chapter = entry.title.chapter_or_insert(chapter_index);
        chapter.set_status(field, value);
        chapter.clone()
    }

    /// Run a state machine event against a cached chapter.
    ///
    /// Reading and writing happen under the entry's lock, so concurrent
    /// events on one chapter cannot interleave.
    pub async fn apply_event(
        &self,
        title_id: &str,
        chapter_index: u32,
        event: ChapterEvent,
    ) -> Result<ChapterRef, CacheError> {
        self.ensure(title_id).await;
        let mut entry = self.entry_or_bare(title_id);
        let chapter = entry.title.chapter_or_insert(chapter_index);
        chapter.apply(event)?;
        Ok(chapter.clone())
    }

    /// Copy source ids and upload dates from a job's chapters onto the cache.
    pub async fn adopt_chapters(&self, title_id: &str, chapters: &[ChapterRef]) {
        self.ensure(title_id).await;
        let mut entry = self.entry_or_bare(title_id);
        for given in chapters {
            let chapter = entry.title.chapter_or_insert(given.index);
            if given.source_id.is_some() {
                chapter.source_id = given.source_id.clone();
            }
            if given.date_upload != 0 {
                chapter.date_upload = given.date_upload;
            }
        }
    }

    fn entry_or_bare(
        &self,
        title_id: &str,
    ) -> dashmap::mapref::one::RefMut<'_, String, Entry> {
        self.entries
            .entry(title_id.to_string())
            .or_insert_with(|| Entry {
                title: Title::bare(title_id),
                stale: true,
            })
    }

    /// Cached chapter without populating.
    pub fn chapter(&self, title_id: &str, chapter_index: u32) -> Option<ChapterRef> {
        self.entries
            .get(title_id)
            .and_then(|entry| entry.title.chapter(chapter_index).cloned())
    }

    /// Cached record without populating.
    pub fn peek(&self, title_id: &str) -> Option<Title> {
        self.entries.get(title_id).map(|entry| entry.title.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark every cached record stale so the next `get` refetches it.
    ///
    /// Chapter statuses stay in place and are carried onto the refetched
    /// record. In-flight populates will not be cached.
    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        for mut entry in self.entries.iter_mut() {
            entry.stale = true;
        }
        info!("metadata cache invalidated");
    }

    /// Number of cached records that do not need a refetch.
    pub fn fresh_len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.stale).count()
    }

    /// Point the source at a new base url, invalidating on change.
    pub fn set_base_url(&self, url: &str) -> bool {
        let changed = self.source.set_base_url(url);
        if changed {
            info!(base_url = %self.source.base_url(), "source base url changed");
            self.invalidate_all();
        }
        changed
    }

    /// Write the cached record through to the library store.
    pub async fn persist(&self, title_id: &str) -> Result<(), CacheError> {
        let title = self
            .peek(title_id)
            .ok_or_else(|| CacheError::NotCached(title_id.to_string()))?;
        self.store.save(&title).await?;
        Ok(())
    }

    /// Mark a title as part of the library and persist it.
    pub async fn add_to_library(&self, title_id: &str) -> Result<Title, CacheError> {
        self.get(title_id).await?;
        {
            let mut entry = self.entry_or_bare(title_id);
            entry.title.in_library = true;
        }
        self.persist(title_id).await?;
        self.peek(title_id)
            .ok_or_else(|| CacheError::NotCached(title_id.to_string()))
    }

    /// Explicitly remove a title from the library store.
    pub async fn remove_from_library(&self, title_id: &str) -> Result<bool, CacheError> {
        if let Some(mut entry) = self.entries.get_mut(title_id) {
            entry.title.in_library = false;
        }
        Ok(self.store.remove(title_id).await?)
    }
}

/// Merge a live remote record onto the persisted one.
///
/// Remote wins for live fields and the chapter list; the persisted record
/// wins for library membership and any English or external field it has.
pub fn merge_title(persisted: Option<&Title>, mut remote: Title) -> Title {
    let Some(persisted) = persisted else {
        return remote;
    };
    remote.in_library = persisted.in_library;
    if persisted.en_title.is_some() {
        remote.en_title = persisted.en_title.clone();
    }
    if persisted.en_description.is_some() {
        remote.en_description = persisted.en_description.clone();
    }
    if persisted.mangadex_id.is_some() {
        remote.mangadex_id = persisted.mangadex_id.clone();
    }
    remote.author = remote.author.or_else(|| persisted.author.clone());
    carry_statuses(persisted, &mut remote);
    remote
}

/// Copy per-chapter statuses from `from` onto `to` by index. Chapters that
/// only `from` knows are kept when they still have local state.
fn carry_statuses(from: &Title, to: &mut Title) {
    for old in &from.chapters {
        match to.chapter_mut(old.index) {
            Some(chapter) => {
                chapter.download_status = old.download_status;
                chapter.translation_status = old.translation_status;
                if chapter.source_id.is_none() {
                    chapter.source_id = old.source_id.clone();
                }
            }
            None if old.download_status != Status::NotReady
                || old.translation_status != Status::NotReady =>
            {
                to.chapters.push(old.clone());
            }
            None => {}
        }
    }
    to.chapters.sort_by_key(|c| c.index);
}

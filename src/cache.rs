//! Content-addressed chapter cache keyed by (document id, chapter index).
//!
//! Entries never expire. A record whose stored digest disagrees with its
//! content, or that cannot be decoded, is reported as a miss so the chapter is
//! simply fetched again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::error::PersistenceError;
use crate::formats::{CachedChapterEntry, Chapter, content_digest};
use crate::logging::{EventSink, IngestEvent};

#[derive(Clone)]
pub struct ChapterCache {
    base_dir: PathBuf,
    events: Arc<dyn EventSink>,
}

impl ChapterCache {
    pub fn new(base_dir: impl Into<PathBuf>, events: Arc<dyn EventSink>) -> Self {
        Self {
            base_dir: base_dir.into(),
            events,
        }
    }

    pub fn document_dir(&self, doc_id: &str) -> PathBuf {
        self.base_dir.join(doc_id)
    }

    pub fn entry_path(&self, doc_id: &str, index: usize) -> PathBuf {
        self.document_dir(doc_id).join(format!("{index:05}.json"))
    }

    pub async fn get(
        &self,
        doc_id: &str,
        index: usize,
    ) -> Result<Option<CachedChapterEntry>, PersistenceError> {
        let path = self.entry_path(doc_id, index);
        let entry = match crate::store::read_json::<CachedChapterEntry>(&path).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(PersistenceError::Decode { source, .. }) => {
                self.reject(doc_id, index, format!("undecodable record: {source}"));
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if entry.index != index {
            self.reject(
                doc_id,
                index,
                format!("record belongs to chapter {}", entry.index),
            );
            return Ok(None);
        }
        if !entry.is_intact() {
            self.reject(doc_id, index, "digest mismatch".to_string());
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Like [`ChapterCache::get`], but an entry captured from a different
    /// locator is a miss. Indices shift when a source reorders its chapters.
    pub async fn get_chapter(
        &self,
        doc_id: &str,
        chapter: &Chapter,
    ) -> Result<Option<CachedChapterEntry>, PersistenceError> {
        let Some(entry) = self.get(doc_id, chapter.index).await? else {
            return Ok(None);
        };
        if entry.locator != chapter.locator {
            self.reject(
                doc_id,
                chapter.index,
                format!("record captured from {}", entry.locator),
            );
            return Ok(None);
        }
        Ok(Some(entry))
    }

    pub async fn put(
        &self,
        doc_id: &str,
        index: usize,
        title: &str,
        locator: &str,
        content: String,
    ) -> Result<CachedChapterEntry, PersistenceError> {
        let entry = CachedChapterEntry {
            index,
            title: title.to_string(),
            locator: locator.to_string(),
            digest: content_digest(&content),
            content,
            captured_at: Utc::now(),
        };
        let path = self.entry_path(doc_id, index);
        crate::store::write_json_atomic(&path, &entry).await?;
        Ok(entry)
    }

    /// Drops every cached chapter of a document. Missing namespaces are fine.
    pub async fn invalidate(&self, doc_id: &str) -> Result<(), PersistenceError> {
        crate::store::remove_dir_if_exists(&self.document_dir(doc_id)).await
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn reject(&self, doc_id: &str, index: usize, reason: String) {
        self.events.record(IngestEvent::CacheEntryRejected {
            doc_id: doc_id.to_string(),
            index,
            reason,
        });
    }
}

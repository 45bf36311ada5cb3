use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cache::ChapterCache;
use crate::checkpoint::CheckpointStore;
use crate::discover::{Discoverer, DiscoveryOptions};
use crate::error::{ChapterError, DiscoveryError, FetchError, IngestError, ValidationError};
use crate::fetch::Fetcher;
use crate::formats::{
    Chapter, Checkpoint, CheckpointStatus, Document, ManifestEntry, ManifestStatus, document_id,
    normalize_locator,
};
use crate::logging::{EventSink, IngestEvent};
use crate::manifest::ManifestRegistry;
use crate::render::{AssembledChapter, Renderer};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::throttle::RequestPacer;
use crate::validate::{ValidationReport, validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Pending,
    Discovering,
    Scraping,
    Assembling,
    Complete,
    Failed,
}

impl DocumentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Discovering => "discovering",
            Self::Scraping => "scraping",
            Self::Assembling => "assembling",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Per-request timeout for chapter fetches.
    pub fetch_timeout: Duration,
    /// Re-run documents the manifest already records as complete.
    pub force: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            force: false,
        }
    }
}

/// Everything an [`Ingestor`] needs, wired by the caller.
pub struct IngestorParts {
    pub fetcher: Arc<dyn Fetcher>,
    pub renderer: Arc<dyn Renderer>,
    pub cache: ChapterCache,
    pub checkpoints: CheckpointStore,
    pub manifest: ManifestRegistry,
    pub retry: RetryPolicy,
    pub pacer: Arc<RequestPacer>,
    pub discovery: DiscoveryOptions,
    pub options: IngestOptions,
    pub events: Arc<dyn EventSink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub doc_id: String,
    pub title: String,
    pub status: ManifestStatus,
    pub artifact_path: Option<PathBuf>,
    pub failed: Vec<usize>,
    /// Chapters that went to the network in this run.
    pub fetched: usize,
    pub cache_hits: usize,
    /// The manifest already recorded the document as complete.
    pub skipped: bool,
}

#[derive(Debug)]
pub struct BatchEntry {
    pub locator: String,
    pub result: Result<IngestOutcome, IngestError>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
    /// Set when a job-fatal error stopped the batch early.
    pub aborted: Option<IngestError>,
}

impl BatchReport {
    pub fn all_complete(&self) -> bool {
        self.aborted.is_none()
            && self.entries.iter().all(|entry| {
                entry
                    .result
                    .as_ref()
                    .is_ok_and(|outcome| outcome.status == ManifestStatus::Complete)
            })
    }
}

/// Drives documents through discovery, chapter scraping and rendering.
pub struct Ingestor {
    fetcher: Arc<dyn Fetcher>,
    renderer: Arc<dyn Renderer>,
    discoverer: Discoverer,
    cache: ChapterCache,
    checkpoints: CheckpointStore,
    manifest: ManifestRegistry,
    retry: RetryExecutor,
    pacer: Arc<RequestPacer>,
    options: IngestOptions,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl Ingestor {
    pub fn new(parts: IngestorParts) -> Self {
        let retry = RetryExecutor::new(parts.retry, parts.events.clone());
        let discoverer = Discoverer::new(
            parts.fetcher.clone(),
            retry.clone(),
            parts.pacer.clone(),
            parts.discovery,
            parts.events.clone(),
        );
        Self {
            fetcher: parts.fetcher,
            renderer: parts.renderer,
            discoverer,
            cache: parts.cache,
            checkpoints: parts.checkpoints,
            manifest: parts.manifest,
            retry,
            pacer: parts.pacer,
            options: parts.options,
            events: parts.events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_discoverer(mut self, discoverer: Discoverer) -> Self {
        self.discoverer = discoverer.with_cancellation(self.cancel.clone());
        self
    }

    /// Checked between chapters and between discovery probes; a cancelled
    /// token stops the run before the next request.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.discoverer = self.discoverer.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    /// Processes documents one after another. Document-level failures are
    /// recorded and skipped; job-fatal errors stop the batch.
    pub async fn run_batch<I, S>(&self, locators: I) -> BatchReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = BatchReport::default();
        for locator in locators {
            let locator = locator.as_ref();
            match self.ingest(locator).await {
                Err(err) if err.is_job_fatal() => {
                    tracing::error!(locator, error = %err, "aborting batch");
                    report.aborted = Some(err);
                    break;
                }
                result => report.entries.push(BatchEntry {
                    locator: locator.to_string(),
                    result,
                }),
            }
        }
        report
    }

    pub async fn ingest(&self, locator: &str) -> Result<IngestOutcome, IngestError> {
        let root = Url::parse(locator).map_err(|source| DiscoveryError::InvalidLocator {
            locator: locator.to_string(),
            source,
        });
        let root = match root {
            Ok(root) => normalize_locator(&root),
            Err(err) => {
                self.record_failure(&fallback_id(locator), locator, None, &err)
                    .await?;
                return Err(err.into());
            }
        };
        let doc_id = document_id(&root);
        self.set_state(&doc_id, DocumentState::Pending);

        if !self.options.force
            && let Some(entry) = self.manifest.completed(&doc_id).await?
        {
            self.events.record(IngestEvent::AlreadyComplete {
                doc_id: doc_id.clone(),
            });
            return Ok(IngestOutcome {
                doc_id,
                title: entry.title,
                status: ManifestStatus::Complete,
                artifact_path: entry.artifact_path,
                failed: Vec::new(),
                fetched: 0,
                cache_hits: 0,
                skipped: true,
            });
        }

        self.set_state(&doc_id, DocumentState::Discovering);
        let discovered = self.discoverer.discover(root.as_str()).await;
        if self.cancel.is_cancelled() {
            return Err(IngestError::Interrupted {
                doc_id,
                next_index: 0,
            });
        }
        let document = match discovered {
            Ok(document) => document,
            Err(err) => {
                self.record_failure(&doc_id, root.as_str(), None, &err)
                    .await?;
                return Err(err.into());
            }
        };

        self.scrape(document).await
    }

    async fn scrape(&self, document: Document) -> Result<IngestOutcome, IngestError> {
        let doc_id = document.id.clone();
        self.set_state(&doc_id, DocumentState::Scraping);

        let mut checkpoint = self.open_checkpoint(&document).await?;
        checkpoint.status = CheckpointStatus::InProgress;
        self.checkpoints.save(&checkpoint).await?;

        let mut fetched = 0;
        let mut cache_hits = 0;
        for index in checkpoint.pending() {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Interrupted {
                    doc_id,
                    next_index: index,
                });
            }
            let chapter = &document.chapters[index];

            checkpoint.mark_started(index);
            self.checkpoints.save(&checkpoint).await?;
            self.events.record(IngestEvent::ChapterStarted {
                doc_id: doc_id.clone(),
                index,
            });

            if self.cache.get_chapter(&doc_id, chapter).await?.is_some() {
                cache_hits += 1;
                checkpoint.mark_completed(index);
                self.checkpoints.save(&checkpoint).await?;
                self.events.record(IngestEvent::ChapterCacheHit {
                    doc_id: doc_id.clone(),
                    index,
                });
                continue;
            }

            fetched += 1;
            let attempt = self.fetch_chapter(chapter).await;
            match attempt {
                Ok((content, report)) => {
                    self.cache
                        .put(&doc_id, index, &chapter.title, &chapter.locator, content)
                        .await?;
                    checkpoint.mark_completed(index);
                    self.checkpoints.save(&checkpoint).await?;
                    self.events.record(IngestEvent::ChapterCompleted {
                        doc_id: doc_id.clone(),
                        index,
                        word_count: report.metadata.word_count,
                        warnings: report.warning_messages(),
                    });
                }
                Err(err) => {
                    checkpoint.mark_failed(index);
                    self.checkpoints.save(&checkpoint).await?;
                    self.events.record(IngestEvent::ChapterFailed {
                        doc_id: doc_id.clone(),
                        index,
                        error: err.to_string(),
                    });
                }
            }
            self.pacer.cooldown().await;
        }

        if !checkpoint.is_fully_complete() {
            return self
                .finish_partial(&document, checkpoint, fetched, cache_hits)
                .await;
        }

        self.set_state(&doc_id, DocumentState::Assembling);
        let chapters = match self.assemble(&document).await {
            Ok(chapters) => chapters,
            Err(err) => {
                self.record_failure(&doc_id, &document.locator, Some(&document), &err)
                    .await?;
                return Err(err);
            }
        };
        let artifact = match self.renderer.render(&document.meta(), &chapters).await {
            Ok(path) => path,
            Err(err) => {
                let err = IngestError::from(err);
                self.record_failure(&doc_id, &document.locator, Some(&document), &err)
                    .await?;
                return Err(err);
            }
        };

        checkpoint.status = CheckpointStatus::Completed;
        self.checkpoints.save(&checkpoint).await?;
        self.manifest
            .upsert(manifest_entry(
                &document,
                ManifestStatus::Complete,
                Some(artifact.clone()),
                Vec::new(),
                None,
            ))
            .await?;
        self.checkpoints.delete(&doc_id).await?;

        self.set_state(&doc_id, DocumentState::Complete);
        self.events.record(IngestEvent::DocumentFinished {
            doc_id: doc_id.clone(),
            status: ManifestStatus::Complete.to_string(),
            failed: Vec::new(),
        });
        Ok(IngestOutcome {
            doc_id,
            title: document.title,
            status: ManifestStatus::Complete,
            artifact_path: Some(artifact),
            failed: Vec::new(),
            fetched,
            cache_hits,
            skipped: false,
        })
    }

    /// Loads the checkpoint for `document`, discarding it when the chapter
    /// count no longer matches a fresh discovery.
    async fn open_checkpoint(&self, document: &Document) -> Result<Checkpoint, IngestError> {
        let count = document.chapters.len();
        match self.checkpoints.load(&document.id).await? {
            Some(checkpoint) if checkpoint.chapter_count == count => {
                self.events.record(IngestEvent::ResumedCheckpoint {
                    doc_id: document.id.clone(),
                    completed: checkpoint.completed.len(),
                    failed: checkpoint.failed.len(),
                });
                Ok(checkpoint)
            }
            Some(checkpoint) => {
                self.events.record(IngestEvent::DiscardedCheckpoint {
                    doc_id: document.id.clone(),
                    reason: format!(
                        "chapter count changed from {} to {count}",
                        checkpoint.chapter_count
                    ),
                });
                self.checkpoints.delete(&document.id).await?;
                self.cache.invalidate(&document.id).await?;
                Ok(Checkpoint::new(&document.id, &document.locator, count))
            }
            None => Ok(Checkpoint::new(&document.id, &document.locator, count)),
        }
    }

    async fn fetch_chapter(
        &self,
        chapter: &Chapter,
    ) -> Result<(String, ValidationReport), ChapterError> {
        let url = Url::parse(&chapter.locator).map_err(|err| FetchError::Other {
            url: chapter.locator.clone(),
            message: format!("invalid chapter locator: {err}"),
        })?;
        let url = &url;
        let timeout = self.options.fetch_timeout;

        self.retry
            .run(
                |_| async move {
                    self.pacer.wait().await;
                    let content = self.fetcher.fetch(url, timeout).await?.into_content(url)?;
                    let report = validate(&content, &chapter.title);
                    if !report.is_valid {
                        return Err(ChapterError::from(ValidationError {
                            title: chapter.title.clone(),
                            reasons: report.error_messages(),
                        }));
                    }
                    Ok::<_, ChapterError>((content, report))
                },
                ChapterError::is_retryable,
            )
            .await
    }

    /// Reads every chapter back from the cache. An entry lost since it was
    /// completed is fetched again once; if that fails the document fails.
    async fn assemble(&self, document: &Document) -> Result<Vec<AssembledChapter>, IngestError> {
        let mut assembled = Vec::with_capacity(document.chapters.len());
        for chapter in &document.chapters {
            let content = match self.cache.get_chapter(&document.id, chapter).await? {
                Some(entry) => entry.content,
                None => {
                    tracing::warn!(
                        doc_id = %document.id,
                        index = chapter.index,
                        "completed chapter missing from cache; fetching again"
                    );
                    let refetched = self.fetch_chapter(chapter).await;
                    self.pacer.cooldown().await;
                    let (content, _) = refetched.map_err(|source| IngestError::ContentLost {
                        doc_id: document.id.clone(),
                        index: chapter.index,
                        source,
                    })?;
                    self.cache
                        .put(
                            &document.id,
                            chapter.index,
                            &chapter.title,
                            &chapter.locator,
                            content,
                        )
                        .await?
                        .content
                }
            };
            assembled.push(AssembledChapter {
                index: chapter.index,
                title: chapter.title.clone(),
                content,
            });
        }
        Ok(assembled)
    }

    async fn finish_partial(
        &self,
        document: &Document,
        mut checkpoint: Checkpoint,
        fetched: usize,
        cache_hits: usize,
    ) -> Result<IngestOutcome, IngestError> {
        checkpoint.status = CheckpointStatus::Failed;
        self.checkpoints.save(&checkpoint).await?;

        let failed = checkpoint.failed.iter().copied().collect::<Vec<_>>();
        self.manifest
            .upsert(manifest_entry(
                document,
                ManifestStatus::Partial,
                None,
                failed.clone(),
                None,
            ))
            .await?;

        self.set_state(&document.id, DocumentState::Failed);
        self.events.record(IngestEvent::DocumentFinished {
            doc_id: document.id.clone(),
            status: ManifestStatus::Partial.to_string(),
            failed: failed.clone(),
        });
        Ok(IngestOutcome {
            doc_id: document.id.clone(),
            title: document.title.clone(),
            status: ManifestStatus::Partial,
            artifact_path: None,
            failed,
            fetched,
            cache_hits,
            skipped: false,
        })
    }

    async fn record_failure(
        &self,
        doc_id: &str,
        locator: &str,
        document: Option<&Document>,
        err: &dyn std::error::Error,
    ) -> Result<(), IngestError> {
        let entry = match document {
            Some(document) => manifest_entry(
                document,
                ManifestStatus::Failed,
                None,
                Vec::new(),
                Some(err.to_string()),
            ),
            None => {
                let now = Utc::now();
                ManifestEntry {
                    doc_id: doc_id.to_string(),
                    title: locator.to_string(),
                    author: None,
                    locator: locator.to_string(),
                    chapter_count: 0,
                    artifact_path: None,
                    status: ManifestStatus::Failed,
                    failed_chapters: Vec::new(),
                    error: Some(err.to_string()),
                    scraped_at: now,
                    updated_at: now,
                }
            }
        };
        self.manifest.upsert(entry).await?;

        self.set_state(doc_id, DocumentState::Failed);
        self.events.record(IngestEvent::DocumentFinished {
            doc_id: doc_id.to_string(),
            status: ManifestStatus::Failed.to_string(),
            failed: Vec::new(),
        });
        Ok(())
    }

    fn set_state(&self, doc_id: &str, state: DocumentState) {
        self.events.record(IngestEvent::DocumentState {
            doc_id: doc_id.to_string(),
            state: state.as_str(),
        });
    }
}

fn manifest_entry(
    document: &Document,
    status: ManifestStatus,
    artifact_path: Option<PathBuf>,
    failed_chapters: Vec<usize>,
    error: Option<String>,
) -> ManifestEntry {
    let now = Utc::now();
    ManifestEntry {
        doc_id: document.id.clone(),
        title: document.title.clone(),
        author: document.author.clone(),
        locator: document.locator.clone(),
        chapter_count: document.chapters.len(),
        artifact_path,
        status,
        failed_chapters,
        error,
        scraped_at: now,
        updated_at: now,
    }
}

/// Id for a locator that does not even parse, so the failure is still recorded.
fn fallback_id(locator: &str) -> String {
    format!("d_{}", crate::formats::content_digest(locator.trim()))
}

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context as _;

pub fn init() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

/// Pipeline events reported by the components through their [`EventSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    DocumentState {
        doc_id: String,
        state: &'static str,
    },
    AlreadyComplete {
        doc_id: String,
    },
    ResumedCheckpoint {
        doc_id: String,
        completed: usize,
        failed: usize,
    },
    DiscardedCheckpoint {
        doc_id: String,
        reason: String,
    },
    DiscoveryPass {
        locator: String,
        strategy: &'static str,
        found: usize,
    },
    ChapterStarted {
        doc_id: String,
        index: usize,
    },
    ChapterCacheHit {
        doc_id: String,
        index: usize,
    },
    ChapterCompleted {
        doc_id: String,
        index: usize,
        word_count: usize,
        warnings: Vec<String>,
    },
    ChapterFailed {
        doc_id: String,
        index: usize,
        error: String,
    },
    CacheEntryRejected {
        doc_id: String,
        index: usize,
        reason: String,
    },
    Retrying {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    DocumentFinished {
        doc_id: String,
        status: String,
        failed: Vec<usize>,
    },
}

/// Logging port handed to each component at construction.
pub trait EventSink: Send + Sync {
    fn record(&self, event: IngestEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: IngestEvent) {
        match event {
            IngestEvent::DocumentState { doc_id, state } => {
                tracing::info!(doc_id, state, "document state");
            }
            IngestEvent::AlreadyComplete { doc_id } => {
                tracing::info!(doc_id, "document already complete; skipping");
            }
            IngestEvent::ResumedCheckpoint {
                doc_id,
                completed,
                failed,
            } => {
                tracing::info!(doc_id, completed, failed, "resuming from checkpoint");
            }
            IngestEvent::DiscardedCheckpoint { doc_id, reason } => {
                tracing::warn!(doc_id, reason, "discarding checkpoint");
            }
            IngestEvent::DiscoveryPass {
                locator,
                strategy,
                found,
            } => {
                tracing::info!(locator, strategy, found, "discovery pass");
            }
            IngestEvent::ChapterStarted { doc_id, index } => {
                tracing::debug!(doc_id, index, "chapter started");
            }
            IngestEvent::ChapterCacheHit { doc_id, index } => {
                tracing::debug!(doc_id, index, "chapter served from cache");
            }
            IngestEvent::ChapterCompleted {
                doc_id,
                index,
                word_count,
                warnings,
            } => {
                if warnings.is_empty() {
                    tracing::info!(doc_id, index, word_count, "chapter completed");
                } else {
                    tracing::warn!(doc_id, index, word_count, ?warnings, "chapter completed with warnings");
                }
            }
            IngestEvent::ChapterFailed {
                doc_id,
                index,
                error,
            } => {
                tracing::warn!(doc_id, index, error, "chapter failed");
            }
            IngestEvent::CacheEntryRejected {
                doc_id,
                index,
                reason,
            } => {
                tracing::warn!(doc_id, index, reason, "cache entry rejected; treating as miss");
            }
            IngestEvent::Retrying {
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error, "retrying");
            }
            IngestEvent::DocumentFinished {
                doc_id,
                status,
                failed,
            } => {
                tracing::info!(doc_id, status, ?failed, "document finished");
            }
        }
    }
}

/// Keeps every event in memory; used by tests to assert on pipeline behaviour.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<IngestEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<IngestEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: IngestEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

//! Error taxonomy for the ingestion pipeline.
//!
//! Chapter-level failures ([`ChapterError`]) are recorded in the checkpoint and
//! never abort a document. Document-level failures ([`IngestError::Discovery`],
//! [`IngestError::Render`]) abort one document. [`PersistenceError`] aborts the
//! whole job because progress tracking can no longer be trusted.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    #[error("navigation timeout on {url}: {message}")]
    NavigationTimeout { url: String, message: String },

    #[error("connection failed for {url}: {message}")]
    Connection { url: String, message: String },

    #[error("dns resolution failed for {url}: {message}")]
    Dns { url: String, message: String },

    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("fetch failed for {url}: {message}")]
    Other { url: String, message: String },
}

impl FetchError {
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        Self::Status {
            url: url.into(),
            status,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Default retryability classifier.
    ///
    /// Network-class failures, 429 and 5xx (except 501) are transient.
    /// Authentication failures and other 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::NavigationTimeout { .. }
            | Self::Connection { .. }
            | Self::Dns { .. } => true,
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Other { .. } => false,
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    match status {
        429 => true,
        501 => false,
        500..=599 => true,
        _ => false,
    }
}

#[derive(Debug, Error)]
#[error("content for chapter {title:?} rejected: {}", .reasons.join("; "))]
pub struct ValidationError {
    pub title: String,
    pub reasons: Vec<String>,
}

/// Failure of one fetch+validate attempt for a chapter.
#[derive(Debug, Error)]
pub enum ChapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ChapterError {
    /// Validation failures are never retried by the executor.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(err) => err.is_retryable(),
            Self::Validation(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid source locator {locator:?}: {source}")]
    InvalidLocator {
        locator: String,
        #[source]
        source: url::ParseError,
    },

    #[error("source root {locator} is unavailable")]
    RootUnavailable {
        locator: String,
        #[source]
        source: FetchError,
    },

    #[error("no chapters found for {locator}")]
    NoChapters { locator: String },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt record at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
#[error("render failed for {doc_id}: {message}")]
pub struct RenderError {
    pub doc_id: String,
    pub message: String,
}

impl RenderError {
    pub fn new(doc_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            doc_id: doc_id.into(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("completed chapter {index} of {doc_id} could not be reloaded: {source}")]
    ContentLost {
        doc_id: String,
        index: usize,
        #[source]
        source: ChapterError,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("interrupted before chapter {next_index} of {doc_id}")]
    Interrupted { doc_id: String, next_index: usize },
}

impl IngestError {
    /// Whether the whole job must stop rather than move on to the next document.
    pub fn is_job_fatal(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Interrupted { .. })
    }
}

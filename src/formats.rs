use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub index: usize,
    pub title: String,
    pub locator: String,
}

/// A discovered book. Immutable once the discoverer hands it over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub locator: String,
    pub chapters: Vec<Chapter>,
}

impl Document {
    pub fn meta(&self) -> DocumentMeta {
        DocumentMeta {
            id: self.id.clone(),
            title: self.title.clone(),
            author: self.author.clone(),
            locator: self.locator.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedChapterEntry {
    pub index: usize,
    pub title: String,
    pub locator: String,
    pub content: String,
    pub captured_at: DateTime<Utc>,
    pub digest: String,
}

impl CachedChapterEntry {
    pub fn is_intact(&self) -> bool {
        content_digest(&self.content) == self.digest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub doc_id: String,
    pub locator: String,
    pub chapter_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed: BTreeSet<usize>,
    pub failed: BTreeSet<usize>,
    /// Chapter whose attempt began but has not been resolved yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<usize>,
    pub status: CheckpointStatus,
}

impl Checkpoint {
    pub fn new(doc_id: impl Into<String>, locator: impl Into<String>, chapter_count: usize) -> Self {
        let now = Utc::now();
        Self {
            doc_id: doc_id.into(),
            locator: locator.into(),
            chapter_count,
            created_at: now,
            updated_at: now,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            started: None,
            status: CheckpointStatus::InProgress,
        }
    }

    pub fn mark_started(&mut self, index: usize) {
        self.started = Some(index);
        self.status = CheckpointStatus::InProgress;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, index: usize) {
        self.failed.remove(&index);
        self.completed.insert(index);
        self.clear_started(index);
        self.updated_at = Utc::now();
    }

    /// Completed chapters never move back to failed.
    pub fn mark_failed(&mut self, index: usize) {
        if !self.completed.contains(&index) {
            self.failed.insert(index);
        }
        self.clear_started(index);
        self.updated_at = Utc::now();
    }

    pub fn is_fully_complete(&self) -> bool {
        (0..self.chapter_count).all(|index| self.completed.contains(&index))
    }

    pub fn pending(&self) -> Vec<usize> {
        (0..self.chapter_count)
            .filter(|index| !self.completed.contains(index))
            .collect()
    }

    fn clear_started(&mut self, index: usize) {
        if self.started == Some(index) {
            self.started = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Complete,
    Partial,
    Failed,
}

impl std::fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub doc_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub locator: String,
    pub chapter_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    pub status: ManifestStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_chapters: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub version: u32,
    #[serde(default)]
    pub documents: BTreeMap<String, ManifestEntry>,
}

impl Default for ManifestFile {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            documents: BTreeMap::new(),
        }
    }
}

pub fn content_digest(content: &str) -> String {
    hex::encode(sha2::Sha256::digest(content.as_bytes()))
}

pub fn normalize_locator(url: &Url) -> Url {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    normalized
}

pub fn document_id(locator: &Url) -> String {
    let normalized = normalize_locator(locator);
    let mut canonical = normalized.to_string();
    while canonical.ends_with('/') && canonical.len() > 1 {
        canonical.pop();
    }
    format!("d_{}", content_digest(&canonical))
}

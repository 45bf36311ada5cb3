use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::PersistenceError;
use crate::formats::{MANIFEST_VERSION, ManifestEntry, ManifestFile, ManifestStatus};

/// Durable index of ingested documents, rewritten as a whole on every update.
#[derive(Debug, Clone)]
pub struct ManifestRegistry {
    path: PathBuf,
}

impl ManifestRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<ManifestFile, PersistenceError> {
        let file: Option<ManifestFile> = crate::store::read_json(&self.path).await?;
        let file = file.unwrap_or_default();
        if file.version != MANIFEST_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                version = file.version,
                expected = MANIFEST_VERSION,
                "manifest version mismatch"
            );
        }
        Ok(file)
    }

    pub async fn get(&self, doc_id: &str) -> Result<Option<ManifestEntry>, PersistenceError> {
        Ok(self.load().await?.documents.remove(doc_id))
    }

    /// The entry for `doc_id` if it is already `complete`.
    pub async fn completed(&self, doc_id: &str) -> Result<Option<ManifestEntry>, PersistenceError> {
        Ok(self
            .get(doc_id)
            .await?
            .filter(|entry| entry.status == ManifestStatus::Complete))
    }

    /// Replaces any prior entry for the same document id. The first
    /// `scraped_at` is kept across replacements.
    pub async fn upsert(&self, mut entry: ManifestEntry) -> Result<ManifestEntry, PersistenceError> {
        let mut file = self.load().await?;
        file.version = MANIFEST_VERSION;
        if let Some(previous) = file.documents.get(&entry.doc_id) {
            entry.scraped_at = previous.scraped_at;
        }
        entry.updated_at = Utc::now();
        file.documents.insert(entry.doc_id.clone(), entry.clone());
        crate::store::write_json_atomic(&self.path, &file).await?;
        Ok(entry)
    }

    pub async fn list(&self) -> Result<Vec<ManifestEntry>, PersistenceError> {
        Ok(self.load().await?.documents.into_values().collect())
    }
}

use std::path::PathBuf;

use crate::error::PersistenceError;
use crate::formats::Checkpoint;

/// One JSON record per document id under `base_dir`.
///
/// At most one pipeline instance may touch a given document id at a time;
/// there is no cross-process locking.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    base_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn checkpoint_path(&self, doc_id: &str) -> PathBuf {
        self.base_dir.join(format!("{doc_id}.json"))
    }

    pub async fn load(&self, doc_id: &str) -> Result<Option<Checkpoint>, PersistenceError> {
        crate::store::read_json(&self.checkpoint_path(doc_id)).await
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        crate::store::write_json_atomic(&self.checkpoint_path(&checkpoint.doc_id), checkpoint).await
    }

    pub async fn delete(&self, doc_id: &str) -> Result<(), PersistenceError> {
        crate::store::remove_file_if_exists(&self.checkpoint_path(doc_id)).await
    }
}

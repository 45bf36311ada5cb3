//! Atomic JSON persistence shared by the cache, checkpoint store and manifest.

use std::io::ErrorKind;
use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt as _;

use crate::error::PersistenceError;

pub async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, PersistenceError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(PersistenceError::io(path, err)),
    };
    let value = serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(value))
}

/// Writes `value` to a sibling temp file and renames it over `path`.
///
/// Readers observe either the previous record or the new one, never a prefix.
pub async fn write_json_atomic<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), PersistenceError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|err| PersistenceError::io(parent, err))?;

    let data = serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::Encode {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    if let Err(err) = write_and_sync(&tmp_path, &data).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(PersistenceError::io(&tmp_path, err));
    }
    if let Err(err) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(PersistenceError::io(path, err));
    }
    Ok(())
}

async fn write_and_sync(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

pub async fn remove_file_if_exists(path: &Path) -> Result<(), PersistenceError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PersistenceError::io(path, err)),
    }
}

pub async fn remove_dir_if_exists(path: &Path) -> Result<(), PersistenceError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PersistenceError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn write_then_read_leaves_no_temp_files() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("nested").join("record.json");
        let record = Record {
            name: "a".to_string(),
            count: 2,
        };

        write_json_atomic(&path, &record).await?;
        let read: Option<Record> = read_json(&path).await?;
        assert_eq!(read, Some(record));

        let names = std::fs::read_dir(path.parent().unwrap())?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(names, vec!["record.json".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let read: Option<Record> = read_json(&temp.path().join("absent.json")).await?;
        assert!(read.is_none());
        remove_file_if_exists(&temp.path().join("absent.json")).await?;
        remove_dir_if_exists(&temp.path().join("absent")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("bad.json");
        std::fs::write(&path, b"{not json")?;
        let err = read_json::<Record>(&path).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Decode { .. }));
        Ok(())
    }
}

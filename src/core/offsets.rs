//! Durable per-consumer read offsets.
//!
//! Each consumer owns one small JSON file (`offsets/<consumer>.json`) holding
//! the sequence number of the last record it fully processed. Files are
//! replaced atomically (temp file + rename, then a directory fsync), so a
//! crash or power loss leaves either the old or the new offset, never a torn
//! one.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Errors that can occur with the offset store
#[derive(Debug, Error)]
pub enum OffsetError {
    #[error("Invalid consumer id: {0:?}")]
    InvalidConsumerId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to persist offset: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// A consumer's durable cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerOffset {
    pub consumer_id: String,

    /// Sequence number of the last record fully processed
    pub offset: u64,

    pub updated_at: DateTime<Utc>,
}

/// Directory of per-consumer offset files
#[derive(Debug, Clone)]
pub struct OffsetStore {
    dir: PathBuf,
}

impl OffsetStore {
    /// Create or open an offset store in the given directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, OffsetError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn offset_path(&self, consumer_id: &str) -> Result<PathBuf, OffsetError> {
        validate_consumer_id(consumer_id)?;
        Ok(self.dir.join(format!("{}.json", consumer_id)))
    }

    /// Load a consumer's offset, if it has ever registered
    pub async fn load(&self, consumer_id: &str) -> Result<Option<ConsumerOffset>, OffsetError> {
        let path = self.offset_path(consumer_id)?;

        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Register a consumer (creating its offset at 0 on first use) and
    /// return the offset to resume from
    pub async fn register(&self, consumer_id: &str) -> Result<u64, OffsetError> {
        if let Some(existing) = self.load(consumer_id).await? {
            return Ok(existing.offset);
        }

        self.write(consumer_id, 0).await?;
        debug!(consumer = consumer_id, "Registered new consumer at offset 0");
        Ok(0)
    }

    /// Durably advance a consumer's offset.
    ///
    /// Offsets never move backwards; a lower value is ignored.
    pub async fn commit(&self, consumer_id: &str, offset: u64) -> Result<(), OffsetError> {
        if let Some(current) = self.load(consumer_id).await? {
            if offset < current.offset {
                warn!(
                    consumer = consumer_id,
                    current = current.offset,
                    requested = offset,
                    "Ignoring backwards offset commit"
                );
                return Ok(());
            }
            if offset == current.offset {
                return Ok(());
            }
        }

        self.write(consumer_id, offset).await
    }

    async fn write(&self, consumer_id: &str, offset: u64) -> Result<(), OffsetError> {
        let path = self.offset_path(consumer_id)?;
        let dir = self.dir.clone();
        let entry = ConsumerOffset {
            consumer_id: consumer_id.to_string(),
            offset,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&entry)?;

        tokio::task::spawn_blocking(move || -> Result<(), OffsetError> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&json)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path)?;
            sync_dir(&dir)?;
            Ok(())
        })
        .await
        .map_err(|e| OffsetError::Io(std::io::Error::other(e)))?
    }

    /// All registered consumers, sorted by id
    pub async fn list(&self) -> Result<Vec<ConsumerOffset>, OffsetError> {
        let mut offsets = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<ConsumerOffset>(&content) {
                Ok(offset) => offsets.push(offset),
                Err(e) => warn!(path = %path.display(), error = %e, "Unreadable offset file"),
            }
        }

        offsets.sort_by(|a, b| a.consumer_id.cmp(&b.consumer_id));
        Ok(offsets)
    }
}

/// Make a rename inside `dir` survive power loss
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Consumer ids become file names: ASCII alphanumerics, `-`, `_`, `.`
fn validate_consumer_id(consumer_id: &str) -> Result<(), OffsetError> {
    let valid = !consumer_id.is_empty()
        && !consumer_id.starts_with('.')
        && consumer_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(OffsetError::InvalidConsumerId(consumer_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_store() -> (OffsetStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = OffsetStore::open(temp.path().join("offsets")).await.unwrap();
        (store, temp)
    }

    #[tokio::test]
    async fn test_register_creates_zero_offset() {
        let (store, _temp) = create_test_store().await;

        assert!(store.load("resolver").await.unwrap().is_none());
        assert_eq!(store.register("resolver").await.unwrap(), 0);
        assert_eq!(store.load("resolver").await.unwrap().unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_commit_persists_across_reopen() {
        let (store, temp) = create_test_store().await;
        store.register("gate").await.unwrap();
        store.commit("gate", 42).await.unwrap();

        let reopened = OffsetStore::open(temp.path().join("offsets")).await.unwrap();
        assert_eq!(reopened.register("gate").await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_offsets_never_move_backwards() {
        let (store, _temp) = create_test_store().await;
        store.commit("audit", 10).await.unwrap();
        store.commit("audit", 3).await.unwrap();

        assert_eq!(store.load("audit").await.unwrap().unwrap().offset, 10);
    }

    #[tokio::test]
    async fn test_consumers_are_independent() {
        let (store, _temp) = create_test_store().await;
        store.commit("a", 5).await.unwrap();
        store.commit("b", 1).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].consumer_id, "a");
        assert_eq!(all[0].offset, 5);
        assert_eq!(all[1].offset, 1);
    }

    #[tokio::test]
    async fn test_rejects_path_like_consumer_ids() {
        let (store, _temp) = create_test_store().await;

        assert!(matches!(
            store.register("../escape").await,
            Err(OffsetError::InvalidConsumerId(_))
        ));
        assert!(store.register("").await.is_err());
        assert!(store.register("script-runner").await.is_ok());
    }

    #[tokio::test]
    async fn test_commit_replaces_file_in_place() {
        let (store, _temp) = create_test_store().await;
        for offset in 1..=5 {
            store.commit("resolver", offset).await.unwrap();
        }

        let entries: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("resolver.json")]);
        assert!(sync_dir(store.dir()).is_ok());
    }
}

//! Durable job storage.

use crate::error::StorageError;
use crate::job::Job;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Job storage trait
#[async_trait]
pub trait JobStorage: Send + Sync + std::fmt::Debug {
    /// Load every persisted job
    async fn load_all(&self) -> Result<Vec<Job>, StorageError>;

    /// Replace the persisted job set
    async fn save_all(&self, jobs: &[Job]) -> Result<(), StorageError>;
}

/// Keeps all jobs in a single JSON document.
#[derive(Debug)]
pub struct JsonJobStorage {
    path: PathBuf,
}

impl JsonJobStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JobStorage for JsonJobStorage {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn load_all(&self) -> Result<Vec<Job>, StorageError> {
        let raw = match tokio_fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::FileRead(self.path.clone(), e)),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let jobs: Vec<Job> =
            serde_json::from_slice(&raw).map_err(|e| StorageError::Deserialization(self.path.clone(), e))?;
        debug!("Loaded {} jobs", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, jobs), fields(path = %self.path.display(), count = jobs.len()))]
    async fn save_all(&self, jobs: &[Job]) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(jobs).map_err(StorageError::Serialization)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio_fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::FileCreate(parent.to_path_buf(), e))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = tokio_fs::File::create(&temp_path)
            .await
            .map_err(|e| StorageError::FileCreate(temp_path.clone(), e))?;

        file.write_all(&json)
            .await
            .map_err(|e| StorageError::FileWrite(temp_path.clone(), e))?;

        file.sync_all()
            .await
            .map_err(|e| StorageError::FileSync(temp_path.clone(), e))?;
        drop(file);

        tokio_fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| StorageError::FileRename(temp_path, self.path.clone(), e))?;

        Ok(())
    }
}

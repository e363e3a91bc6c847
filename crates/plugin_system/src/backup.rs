//! Single-generation backup store.
//!
//! Each plugin owns at most one backup slot: `<dir>/<name>.jar` plus
//! `<dir>/<name>.json` metadata. Storing a backup overwrites the slot, so only
//! the immediately preceding mutation can be rolled back. Older generations are
//! intentionally not kept.

use crate::error::PluginError;
use crate::registry::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;
use tracing::{debug, info};

/// Metadata describing the JAR held in a backup slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMeta {
    pub plugin_name: String,
    pub version: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn jar_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.jar", name))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Whether a complete backup (JAR and metadata) exists for `name`.
    pub async fn exists(&self, name: &str) -> bool {
        tokio_fs::try_exists(self.jar_path(name)).await.unwrap_or(false)
            && tokio_fs::try_exists(self.meta_path(name)).await.unwrap_or(false)
    }

    /// Reads the slot metadata, `None` when no backup is present.
    pub async fn meta(&self, name: &str) -> Result<Option<BackupMeta>, PluginError> {
        if !self.exists(name).await {
            return Ok(None);
        }
        let path = self.meta_path(name);
        let raw = tokio_fs::read(&path)
            .await
            .map_err(|e| PluginError::io(&path, e))?;
        let meta = serde_json::from_slice(&raw).map_err(|source| PluginError::Corrupt { path, source })?;
        Ok(Some(meta))
    }

    /// Copies `source_jar` into the slot for `name`, replacing any previous backup.
    ///
    /// The JAR is written before the metadata; a slot without metadata is
    /// treated as absent by [`BackupStore::exists`].
    pub async fn store(
        &self,
        name: &str,
        source_jar: &Path,
        version: &str,
        file_name: &str,
    ) -> Result<BackupMeta, PluginError> {
        tokio_fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PluginError::io(&self.dir, e))?;

        let meta_path = self.meta_path(name);
        match tokio_fs::remove_file(&meta_path).await {
            Ok(()) => debug!("Overwriting previous backup of {}", name),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PluginError::io(&meta_path, e)),
        }

        copy_atomic(source_jar, &self.jar_path(name)).await?;

        let meta = BackupMeta {
            plugin_name: name.to_string(),
            version: version.to_string(),
            file_name: file_name.to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&meta).map_err(|source| PluginError::Corrupt {
            path: meta_path.clone(),
            source,
        })?;
        write_atomic(&meta_path, &json).await?;

        info!("Backed up {} v{} to {}", name, version, self.dir.display());
        Ok(meta)
    }

    /// Copies the backed up JAR over `dest` without consuming the slot.
    pub async fn restore_to(&self, name: &str, dest: &Path) -> Result<(), PluginError> {
        copy_atomic(&self.jar_path(name), dest).await
    }

    /// Deletes the slot for `name`, if any.
    pub async fn discard(&self, name: &str) -> Result<(), PluginError> {
        for path in [self.meta_path(name), self.jar_path(name)] {
            match tokio_fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PluginError::io(&path, e)),
            }
        }
        Ok(())
    }
}

/// Copies `src` to `dest` through a temporary sibling and a rename.
pub async fn copy_atomic(src: &Path, dest: &Path) -> Result<(), PluginError> {
    let mut temp_name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    temp_name.push(".part");
    let temp = dest.with_file_name(temp_name);

    tokio_fs::copy(src, &temp)
        .await
        .map_err(|e| PluginError::io(src, e))?;
    let file = tokio_fs::OpenOptions::new()
        .write(true)
        .open(&temp)
        .await
        .map_err(|e| PluginError::io(&temp, e))?;
    file.sync_all().await.map_err(|e| PluginError::io(&temp, e))?;
    drop(file);

    if let Err(e) = tokio_fs::rename(&temp, dest).await {
        let _ = tokio_fs::remove_file(&temp).await;
        return Err(PluginError::io(dest, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_overwrites_single_generation() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("backups"));
        let jar = dir.path().join("Foo.jar");

        tokio_fs::write(&jar, b"v1").await.unwrap();
        store.store("Foo", &jar, "1.0", "Foo.jar").await.unwrap();
        tokio_fs::write(&jar, b"v2").await.unwrap();
        store.store("Foo", &jar, "2.0", "Foo.jar").await.unwrap();

        let meta = store.meta("Foo").await.unwrap().unwrap();
        assert_eq!(meta.version, "2.0");

        let restored = dir.path().join("restored.jar");
        store.restore_to("Foo", &restored).await.unwrap();
        assert_eq!(tokio_fs::read(&restored).await.unwrap(), b"v2");

        let mut entries = tokio_fs::read_dir(store.dir()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2, "one jar and one metadata file");
    }

    #[tokio::test]
    async fn test_discard_removes_slot() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join(".backups"));
        let jar = dir.path().join("Bar.jar");
        tokio_fs::write(&jar, b"bytes").await.unwrap();

        store.store("Bar", &jar, "0.1", "Bar.jar").await.unwrap();
        assert!(store.exists("Bar").await);
        store.discard("Bar").await.unwrap();
        assert!(!store.exists("Bar").await);
        assert!(store.meta("Bar").await.unwrap().is_none());
        // discarding an empty slot is fine
        store.discard("Bar").await.unwrap();
    }
}

//! Persistent plugin registry (`plugins.json`).
//!
//! The registry maps a plugin name to its installed metadata. It is written
//! with a write-to-temp, fsync, rename sequence so readers never observe a
//! partially written file.

use crate::error::PluginError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Suffix appended to a JAR file name while the plugin is disabled.
pub const DISABLED_SUFFIX: &str = ".disabled";

/// Installed plugin metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    /// URL the plugin was installed from
    #[serde(default)]
    pub source: Option<String>,
    /// JAR file name inside the plugin directory, without the disabled suffix
    pub file_name: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn default_category() -> String {
    "general".to_string()
}

impl PluginRecord {
    /// Path of the JAR for the record's current enabled state.
    pub fn jar_path(&self, plugin_dir: &Path) -> PathBuf {
        placement_path(plugin_dir, &self.file_name, self.enabled)
    }
}

/// Location of `file_name` inside `plugin_dir` when enabled or disabled.
pub fn placement_path(plugin_dir: &Path, file_name: &str, enabled: bool) -> PathBuf {
    if enabled {
        plugin_dir.join(file_name)
    } else {
        plugin_dir.join(format!("{}{}", file_name, DISABLED_SUFFIX))
    }
}

/// In-memory view of `plugins.json`, at most one record per name.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    records: BTreeMap<String, PluginRecord>,
}

impl Registry {
    /// Loads the registry, treating a missing file as empty.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PluginError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio_fs::read(&path).await {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(raw) => serde_json::from_slice(&raw).map_err(|source| PluginError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(PluginError::io(&path, e)),
        };
        debug!("Loaded {} plugin records from {}", records.len(), path.display());
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&PluginRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn records(&self) -> impl Iterator<Item = &PluginRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Inserts or replaces the record keyed by `record.name`.
    pub fn upsert(&mut self, record: PluginRecord) -> Option<PluginRecord> {
        self.records.insert(record.name.clone(), record)
    }

    pub fn remove(&mut self, name: &str) -> Option<PluginRecord> {
        self.records.remove(name)
    }

    /// Persists the registry atomically.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn save(&self) -> Result<(), PluginError> {
        let json = serde_json::to_vec_pretty(&self.records).map_err(|source| PluginError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &json).await?;
        debug!("Saved {} plugin records", self.records.len());
        Ok(())
    }
}

/// Writes `data` to `path` through a temporary sibling and a rename.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PluginError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio_fs::create_dir_all(parent)
            .await
            .map_err(|e| PluginError::io(parent, e))?;
    }
    let temp_path = temp_sibling(path);

    let mut file = tokio_fs::File::create(&temp_path)
        .await
        .map_err(|e| PluginError::io(&temp_path, e))?;
    file.write_all(data)
        .await
        .map_err(|e| PluginError::io(&temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| PluginError::io(&temp_path, e))?;
    drop(file);

    if let Err(e) = tokio_fs::rename(&temp_path, path).await {
        let _ = tokio_fs::remove_file(&temp_path).await;
        return Err(PluginError::io(path, e));
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(name: &str, version: &str) -> PluginRecord {
        let now = Utc::now();
        PluginRecord {
            name: name.to_string(),
            version: version.to_string(),
            enabled: true,
            description: None,
            category: default_category(),
            source: None,
            file_name: format!("{}.jar", name),
            authors: vec![],
            installed_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::load(dir.path().join("plugins.json")).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("plugins.json");

        let mut registry = Registry::load(&path).await.unwrap();
        registry.upsert(record("Foo", "1.0"));
        registry.upsert(record("Bar", "2.1"));
        registry.save().await.unwrap();

        let reloaded = Registry::load(&path).await.unwrap();
        assert_eq!(reloaded.path(), path.as_path());
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("Bar"));
        assert_eq!(reloaded.get("Foo").unwrap().version, "1.0");
        assert!(!path.with_file_name("plugins.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_record_per_name() {
        let dir = TempDir::new().unwrap();
        let mut registry = Registry::load(dir.path().join("plugins.json")).await.unwrap();
        assert!(registry.upsert(record("Foo", "1.0")).is_none());
        let previous = registry.upsert(record("Foo", "1.1")).unwrap();
        assert_eq!(previous.version, "1.0");
        assert_eq!(registry.len(), 1);
        registry.remove("Foo");
        assert!(!registry.contains("Foo"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plugins.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = Registry::load(&path).await.unwrap_err();
        assert_eq!(err.kind(), "corrupt");
    }

    #[test]
    fn test_disabled_placement() {
        let mut r = record("Foo", "1.0");
        let dir = Path::new("/srv/plugins");
        assert_eq!(r.jar_path(dir), dir.join("Foo.jar"));
        r.enabled = false;
        assert_eq!(r.jar_path(dir), dir.join("Foo.jar.disabled"));
    }
}

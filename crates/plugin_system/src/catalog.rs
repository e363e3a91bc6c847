//! Read-only plugin listing.
//!
//! The [`crate::PluginManager`] is owned by the job worker, so request
//! handlers that only need to show state read it back from disk through a
//! [`PluginCatalog`]. Writes are atomic renames, so a reader always sees a
//! complete `plugins.json`.

use crate::backup::BackupStore;
use crate::error::PluginError;
use crate::registry::{PluginRecord, Registry};
use serde::Serialize;
use std::path::PathBuf;

/// A registry record together with its rollback availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginView {
    #[serde(flatten)]
    pub record: PluginRecord,
    pub has_backup: bool,
}

pub(crate) async fn collect_views(
    records: impl Iterator<Item = PluginRecord>,
    backups: &BackupStore,
) -> Vec<PluginView> {
    let mut views = Vec::new();
    for record in records {
        let has_backup = backups.exists(&record.name).await;
        views.push(PluginView { record, has_backup });
    }
    views
}

#[derive(Debug, Clone)]
pub struct PluginCatalog {
    registry_file: PathBuf,
    backups: BackupStore,
}

impl PluginCatalog {
    pub fn new(registry_file: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry_file: registry_file.into(),
            backups: BackupStore::new(backup_dir),
        }
    }

    /// All installed plugins, ordered by name.
    pub async fn list(&self) -> Result<Vec<PluginView>, PluginError> {
        let registry = Registry::load(&self.registry_file).await?;
        Ok(collect_views(registry.records().cloned(), &self.backups).await)
    }

    pub async fn get(&self, name: &str) -> Result<Option<PluginView>, PluginError> {
        let registry = Registry::load(&self.registry_file).await?;
        let Some(record) = registry.get(name).cloned() else {
            return Ok(None);
        };
        let has_backup = self.backups.exists(name).await;
        Ok(Some(PluginView { record, has_backup }))
    }

    pub async fn has_backup(&self, name: &str) -> bool {
        self.backups.exists(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{InstallRequest, ManagerConfig, PluginManager};
    use crate::testing::{build_plugin_jar, StaticTransport};
    use crate::OperationContext;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_catalog_sees_manager_writes() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(StaticTransport::new());
        transport.serve_bytes("https://cdn.test/Foo.jar", build_plugin_jar("Foo", "1.0"));
        let config = ManagerConfig::new(dir.path().join("plugins"), dir.path().join("data"));
        let catalog = PluginCatalog::new(&config.registry_file, &config.backup_dir);

        assert!(catalog.list().await.unwrap().is_empty());

        let mut manager = PluginManager::open(config, transport).await.unwrap();
        manager
            .install_from_url(InstallRequest::new("https://cdn.test/Foo.jar"), &OperationContext::detached())
            .await
            .unwrap();

        let views = catalog.list().await.unwrap();
        assert_eq!(views.len(), 1);
        assert!(!views[0].has_backup);
        let json = serde_json::to_value(&views[0]).unwrap();
        assert_eq!(json["name"], "Foo");
        assert_eq!(json["hasBackup"], false);

        assert!(catalog.get("Foo").await.unwrap().is_some());
        assert!(catalog.get("Bar").await.unwrap().is_none());
    }
}

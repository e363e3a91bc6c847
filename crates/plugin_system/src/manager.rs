//! Plugin manager: the only component that mutates the plugin directory.
//!
//! Every mutating entry point takes `&mut self`. The manager is owned by a
//! single worker task, so the borrow checker is what serializes access to
//! `plugins.json`, the plugin directory and the backup store.

use crate::backup::{copy_atomic, BackupStore};
use crate::catalog::{collect_views, PluginView};
use crate::download::{download_to_staging, DownloadLimits};
use crate::error::PluginError;
use crate::events::{HistoryAction, HistoryEntry, OperationContext};
use crate::manifest::read_manifest;
use crate::registry::{default_category, placement_path, PluginRecord, Registry, DISABLED_SUFFIX};
use crate::resolve::{parse_url, DownloadOption, MarketplaceEndpoints, ParsedUrl, Resolver, Selection};
use crate::transport::HttpTransport;
use crate::version::compare_versions;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio::fs as tokio_fs;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Capacity of the history broadcast channel.
const HISTORY_CAPACITY: usize = 256;

/// Filesystem layout and limits used by the [`PluginManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Server plugin directory holding the live JARs
    pub plugin_dir: PathBuf,
    /// Location of `plugins.json`
    pub registry_file: PathBuf,
    /// Backup slots
    pub backup_dir: PathBuf,
    /// Scratch space for downloads, must not be inside `plugin_dir`
    pub staging_dir: PathBuf,
    pub max_download_bytes: u64,
    pub stall_timeout: Duration,
    pub endpoints: MarketplaceEndpoints,
}

impl ManagerConfig {
    /// Default layout with all state files under `data_dir`.
    pub fn new(plugin_dir: impl Into<PathBuf>, data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            plugin_dir: plugin_dir.into(),
            registry_file: data_dir.join("plugins.json"),
            backup_dir: data_dir.join("backups"),
            staging_dir: data_dir.join("staging"),
            max_download_bytes: 100 * 1024 * 1024,
            stall_timeout: Duration::from_secs(30),
            endpoints: MarketplaceEndpoints::default(),
        }
    }
}

/// Input of [`PluginManager::install_from_url`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallRequest {
    pub url: String,
    /// Overrides the manifest name
    pub custom_name: Option<String>,
    /// Option id or index picked from a previous selection-required result
    pub selection: Option<String>,
}

impl InstallRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Confirmation accepted by [`PluginManager::proceed_with_install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveAction {
    Update,
    Downgrade,
    Reinstall,
}

impl ResolveAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveAction::Update => "update",
            ResolveAction::Downgrade => "downgrade",
            ResolveAction::Reinstall => "reinstall",
        }
    }
}

impl fmt::Display for ResolveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolveAction {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "update" => Ok(ResolveAction::Update),
            "downgrade" => Ok(ResolveAction::Downgrade),
            "reinstall" => Ok(ResolveAction::Reinstall),
            other => Err(PluginError::Validation(format!(
                "unknown confirmation '{}', expected update, downgrade or reinstall",
                other
            ))),
        }
    }
}

/// How an incoming version relates to the installed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    SameVersion,
    OlderInstalled,
    NewerInstalled,
}

impl ConflictKind {
    /// Compares the installed version with the incoming one.
    pub fn classify(installed: &str, incoming: &str) -> Self {
        match compare_versions(installed, incoming) {
            Ordering::Equal => ConflictKind::SameVersion,
            Ordering::Less => ConflictKind::OlderInstalled,
            Ordering::Greater => ConflictKind::NewerInstalled,
        }
    }

    /// Confirmation needed to go ahead.
    pub fn required_action(&self) -> ResolveAction {
        match self {
            ConflictKind::SameVersion => ResolveAction::Reinstall,
            ConflictKind::OlderInstalled => ResolveAction::Update,
            ConflictKind::NewerInstalled => ResolveAction::Downgrade,
        }
    }
}

/// What a successful install did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallAction {
    Install,
    Update,
    Downgrade,
    Reinstall,
}

impl From<ResolveAction> for InstallAction {
    fn from(action: ResolveAction) -> Self {
        match action {
            ResolveAction::Update => InstallAction::Update,
            ResolveAction::Downgrade => InstallAction::Downgrade,
            ResolveAction::Reinstall => InstallAction::Reinstall,
        }
    }
}

impl From<InstallAction> for HistoryAction {
    fn from(action: InstallAction) -> Self {
        match action {
            InstallAction::Install => HistoryAction::Install,
            InstallAction::Update => HistoryAction::Update,
            InstallAction::Downgrade => HistoryAction::Downgrade,
            InstallAction::Reinstall => HistoryAction::Reinstall,
        }
    }
}

/// Result of an install attempt.
///
/// Only `Installed` changed anything on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InstallOutcome {
    Installed {
        plugin_name: String,
        version: String,
        previous_version: Option<String>,
        action: InstallAction,
    },
    Conflict {
        plugin_name: String,
        installed_version: String,
        new_version: String,
        conflict: ConflictKind,
        /// Confirmation to pass to `proceed_with_install`
        action: ResolveAction,
        message: String,
    },
    SelectionRequired {
        options: Vec<DownloadOption>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallOutcome {
    pub plugin_name: String,
    pub version: String,
    pub configs_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleOutcome {
    pub plugin_name: String,
    pub enabled: bool,
    /// False when the plugin already was in the requested state
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub plugin_name: String,
    pub version: String,
    pub replaced_version: String,
}

/// Rejects names that could escape the plugin directory.
pub fn validate_plugin_name(name: &str) -> Result<(), PluginError> {
    if name.is_empty() {
        return Err(PluginError::Validation("Plugin name cannot be empty".to_string()));
    }
    if name.len() > 64 {
        return Err(PluginError::Validation(
            "Plugin name cannot exceed 64 characters".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(PluginError::Validation(format!(
            "Plugin name '{}' contains invalid path characters",
            name
        )));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid || name.starts_with('.') {
        return Err(PluginError::Validation(format!(
            "Plugin name '{}' can only contain letters, digits, '-', '_' and '.'",
            name
        )));
    }
    // `<plugins>/<name>` is the config directory and must never alias a JAR
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".jar") || lower.ends_with(DISABLED_SUFFIX) {
        return Err(PluginError::Validation(format!(
            "Plugin name '{}' cannot end in .jar or {}",
            name, DISABLED_SUFFIX
        )));
    }
    Ok(())
}

/// Installs, updates and removes server plugins.
pub struct PluginManager {
    config: ManagerConfig,
    transport: Arc<dyn HttpTransport>,
    registry: Registry,
    backups: BackupStore,
    history: broadcast::Sender<HistoryEntry>,
}

impl PluginManager {
    /// Loads the registry and prepares the plugin and staging directories.
    pub async fn open(config: ManagerConfig, transport: Arc<dyn HttpTransport>) -> Result<Self, PluginError> {
        if config.staging_dir.starts_with(&config.plugin_dir) {
            return Err(PluginError::Validation(format!(
                "staging directory {} must not be inside the plugin directory",
                config.staging_dir.display()
            )));
        }

        tokio_fs::create_dir_all(&config.plugin_dir)
            .await
            .map_err(|e| PluginError::io(&config.plugin_dir, e))?;
        clear_staging(&config.staging_dir).await?;

        let registry = Registry::load(&config.registry_file).await?;
        let backups = BackupStore::new(&config.backup_dir);
        let (history, _) = broadcast::channel(HISTORY_CAPACITY);

        info!(
            "Plugin manager ready: {} plugins registered in {}",
            registry.len(),
            config.plugin_dir.display()
        );
        Ok(Self {
            config,
            transport,
            registry,
            backups,
            history,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Receiver for one [`HistoryEntry`] per completed mutation.
    pub fn subscribe_history(&self) -> broadcast::Receiver<HistoryEntry> {
        self.history.subscribe()
    }

    /// Classifies `url` without any network access.
    pub fn parse_url(&self, url: &str) -> Result<ParsedUrl, PluginError> {
        parse_url(url)
    }

    pub fn get_plugin(&self, name: &str) -> Option<&PluginRecord> {
        self.registry.get(name)
    }

    pub async fn has_backup(&self, name: &str) -> bool {
        self.backups.exists(name).await
    }

    pub async fn list_plugins(&self) -> Vec<PluginView> {
        collect_views(self.registry.records().cloned(), &self.backups).await
    }

    /// Installs the plugin found at `request.url`.
    ///
    /// When a different version of the same plugin is installed nothing is
    /// written and [`InstallOutcome::Conflict`] names the confirmation that
    /// [`PluginManager::proceed_with_install`] needs.
    pub async fn install_from_url(
        &mut self,
        request: InstallRequest,
        ctx: &OperationContext,
    ) -> Result<InstallOutcome, PluginError> {
        self.install(request, None, ctx).await
    }

    /// Performs an install withheld by a conflict.
    ///
    /// Falls back to a plain install when no record exists anymore. A
    /// confirmation that does not match the current conflict yields a fresh
    /// conflict result instead of a write.
    pub async fn proceed_with_install(
        &mut self,
        request: InstallRequest,
        action: ResolveAction,
        ctx: &OperationContext,
    ) -> Result<InstallOutcome, PluginError> {
        self.install(request, Some(action), ctx).await
    }

    async fn install(
        &mut self,
        request: InstallRequest,
        confirm: Option<ResolveAction>,
        ctx: &OperationContext,
    ) -> Result<InstallOutcome, PluginError> {
        let custom_name = request
            .custom_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        if let Some(name) = &custom_name {
            validate_plugin_name(name)?;
        }

        ctx.log(format!("Resolving {}", request.url));
        let resolver = Resolver::new(self.transport.as_ref(), &self.config.endpoints);
        let source = resolver.resolve(&request.url).await?;
        let option = match source.select(request.selection.as_deref())? {
            Selection::Chosen(option) => option,
            Selection::Ambiguous(options) => {
                let message = format!(
                    "{} builds are available, choose one and resubmit with selectedOption",
                    options.len()
                );
                ctx.log(message.clone());
                return Ok(InstallOutcome::SelectionRequired { options, message });
            }
        };

        ctx.ensure_active("download")?;
        ctx.log(format!("Downloading {}", option.file_name));
        let limits = DownloadLimits {
            max_bytes: self.config.max_download_bytes,
            stall_timeout: self.config.stall_timeout,
        };
        let staged = download_to_staging(
            self.transport.as_ref(),
            &option.url,
            &self.config.staging_dir,
            &limits,
            ctx,
        )
        .await?;
        ctx.log(format!("Downloaded {} bytes", staged.size()));

        let manifest = read_manifest(staged.path()).await?;
        let name = match custom_name {
            Some(name) => name,
            None => {
                validate_plugin_name(&manifest.name)?;
                manifest.name.clone()
            }
        };
        ctx.log(format!("Found {} v{}", name, manifest.version));

        let existing = self.registry.get(&name).cloned();
        let action = match (&existing, confirm) {
            (None, _) => InstallAction::Install,
            (Some(record), confirm) => {
                let conflict = ConflictKind::classify(&record.version, &manifest.version);
                let required = conflict.required_action();
                if confirm != Some(required) {
                    let message = match confirm {
                        Some(given) => format!(
                            "{} v{} is installed; installing v{} requires '{}', not '{}'",
                            name, record.version, manifest.version, required, given
                        ),
                        None => format!(
                            "{} v{} is already installed; confirm with '{}' to install v{}",
                            name, record.version, required, manifest.version
                        ),
                    };
                    ctx.log(message.clone());
                    return Ok(InstallOutcome::Conflict {
                        plugin_name: name,
                        installed_version: record.version.clone(),
                        new_version: manifest.version,
                        conflict,
                        action: required,
                        message,
                    });
                }
                required.into()
            }
        };

        ctx.ensure_active("commit")?;
        self.ensure_writable().await?;

        let plugin_dir = self.config.plugin_dir.clone();
        let (file_name, enabled) = match &existing {
            Some(record) => (record.file_name.clone(), record.enabled),
            None => (format!("{}.jar", name), true),
        };

        let mut backed_up = false;
        if let Some(record) = &existing {
            let current = record.jar_path(&plugin_dir);
            if tokio_fs::try_exists(&current).await.unwrap_or(false) {
                self.backups
                    .store(&name, &current, &record.version, &record.file_name)
                    .await?;
                backed_up = true;
                ctx.log(format!("Backed up {} v{}", name, record.version));
            } else {
                warn!("JAR {} missing, replacing without a backup", current.display());
            }
        }

        let target = placement_path(&plugin_dir, &file_name, enabled);
        copy_atomic(staged.path(), &target).await?;
        drop(staged);

        let now = Utc::now();
        let previous_version = existing.as_ref().map(|r| r.version.clone());
        let record = PluginRecord {
            name: name.clone(),
            version: manifest.version.clone(),
            enabled,
            description: manifest
                .description
                .or_else(|| existing.as_ref().and_then(|r| r.description.clone())),
            category: source
                .category
                .or_else(|| existing.as_ref().map(|r| r.category.clone()))
                .unwrap_or_else(default_category),
            source: Some(request.url),
            file_name,
            authors: manifest.authors,
            installed_at: existing.as_ref().map_or(now, |r| r.installed_at),
            updated_at: now,
        };
        if let Err(e) = self.commit_record(record).await {
            let undo = if backed_up {
                self.backups.restore_to(&name, &target).await
            } else {
                remove_if_present(&target).await
            };
            if let Err(undo) = undo {
                error!("Could not undo JAR write for {}: {}", name, undo);
            }
            return Err(e);
        }

        ctx.log(format!("Installed {} v{}", name, manifest.version));
        self.publish(action.into(), &name, &manifest.version);
        Ok(InstallOutcome::Installed {
            plugin_name: name,
            version: manifest.version,
            previous_version,
            action,
        })
    }

    /// Removes the plugin JAR, its record and its backup.
    pub async fn uninstall_plugin(
        &mut self,
        name: &str,
        delete_configs: bool,
        ctx: &OperationContext,
    ) -> Result<UninstallOutcome, PluginError> {
        let record = self.require(name)?;
        ctx.ensure_active("commit")?;
        self.ensure_writable().await?;

        let mut configs_deleted = false;
        if delete_configs {
            let config_dir = self.config.plugin_dir.join(&record.name);
            let is_dir = tokio_fs::symlink_metadata(&config_dir)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if is_dir {
                tokio_fs::remove_dir_all(&config_dir)
                    .await
                    .map_err(|e| PluginError::io(&config_dir, e))?;
                configs_deleted = true;
                ctx.log(format!("Deleted configuration directory {}", config_dir.display()));
            }
        }

        self.registry.remove(name);
        if let Err(e) = self.save_registry().await {
            self.registry.upsert(record.clone());
            return Err(e);
        }

        for enabled in [true, false] {
            remove_if_present(&placement_path(&self.config.plugin_dir, &record.file_name, enabled)).await?;
        }
        ctx.log(format!("Removed {}", record.file_name));
        self.backups.discard(name).await?;

        ctx.log(format!("Uninstalled {} v{}", name, record.version));
        self.publish(HistoryAction::Uninstall, name, &record.version);
        Ok(UninstallOutcome {
            plugin_name: record.name,
            version: record.version,
            configs_deleted,
        })
    }

    /// Moves the JAR between its enabled and disabled placement.
    pub async fn toggle_plugin(
        &mut self,
        name: &str,
        enabled: bool,
        ctx: &OperationContext,
    ) -> Result<ToggleOutcome, PluginError> {
        let mut record = self.require(name)?;
        let state = if enabled { "enabled" } else { "disabled" };
        if record.enabled == enabled {
            ctx.log(format!("{} is already {}", name, state));
            return Ok(ToggleOutcome {
                plugin_name: record.name,
                enabled,
                changed: false,
            });
        }

        ctx.ensure_active("commit")?;
        self.ensure_writable().await?;

        let from = record.jar_path(&self.config.plugin_dir);
        let to = placement_path(&self.config.plugin_dir, &record.file_name, enabled);
        let from_exists = tokio_fs::try_exists(&from).await.unwrap_or(false);
        let to_exists = tokio_fs::try_exists(&to).await.unwrap_or(false);
        if from_exists {
            tokio_fs::rename(&from, &to)
                .await
                .map_err(|e| PluginError::io(&from, e))?;
        } else if !to_exists {
            return Err(PluginError::NotFound(format!(
                "JAR for {} is missing from {}",
                name,
                self.config.plugin_dir.display()
            )));
        }

        record.enabled = enabled;
        record.updated_at = Utc::now();
        let version = record.version.clone();
        if let Err(e) = self.commit_record(record).await {
            if from_exists {
                if let Err(undo) = tokio_fs::rename(&to, &from).await {
                    error!("Could not move {} back to {}: {}", to.display(), from.display(), undo);
                }
            }
            return Err(e);
        }

        ctx.log(format!("{} is now {}", name, state));
        let action = if enabled {
            HistoryAction::Enable
        } else {
            HistoryAction::Disable
        };
        self.publish(action, name, &version);
        Ok(ToggleOutcome {
            plugin_name: name.to_string(),
            enabled,
            changed: true,
        })
    }

    /// Restores the JAR captured before the last mutation and consumes the backup.
    pub async fn rollback_plugin(
        &mut self,
        name: &str,
        ctx: &OperationContext,
    ) -> Result<RollbackOutcome, PluginError> {
        let mut record = self.require(name)?;
        let meta = self
            .backups
            .meta(name)
            .await?
            .ok_or_else(|| PluginError::NoBackupAvailable(name.to_string()))?;

        ctx.ensure_active("commit")?;
        self.ensure_writable().await?;

        let jar = record.jar_path(&self.config.plugin_dir);
        let aside = self.set_aside(&jar).await?;
        self.backups.restore_to(name, &jar).await?;

        let replaced_version = std::mem::replace(&mut record.version, meta.version.clone());
        record.updated_at = Utc::now();
        if let Err(e) = self.commit_record(record).await {
            let undo = match &aside {
                Some(aside) => copy_atomic(aside, &jar).await,
                None => remove_if_present(&jar).await,
            };
            if let Err(undo) = undo {
                error!("Could not restore {} after a failed rollback: {}", jar.display(), undo);
            }
            return Err(e);
        }
        self.backups.discard(name).await?;

        ctx.log(format!("Rolled back {} from v{} to v{}", name, replaced_version, meta.version));
        self.publish(HistoryAction::Rollback, name, &meta.version);
        Ok(RollbackOutcome {
            plugin_name: name.to_string(),
            version: meta.version,
            replaced_version,
        })
    }

    fn require(&self, name: &str) -> Result<PluginRecord, PluginError> {
        validate_plugin_name(name)?;
        self.registry
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    /// Saves `record`. On failure the previous entry is put back, so memory
    /// never runs ahead of `plugins.json`.
    async fn commit_record(&mut self, record: PluginRecord) -> Result<(), PluginError> {
        let name = record.name.clone();
        let previous = self.registry.upsert(record);
        if let Err(e) = self.save_registry().await {
            match previous {
                Some(previous) => {
                    self.registry.upsert(previous);
                }
                None => {
                    self.registry.remove(&name);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Copies the live JAR into the staging area, `None` when it is missing.
    async fn set_aside(&self, jar: &Path) -> Result<Option<TempPath>, PluginError> {
        if !tokio_fs::try_exists(jar).await.unwrap_or(false) {
            return Ok(None);
        }
        let staging = &self.config.staging_dir;
        tokio_fs::create_dir_all(staging)
            .await
            .map_err(|e| PluginError::io(staging, e))?;
        let aside = tempfile::Builder::new()
            .prefix("previous-")
            .suffix(".jar")
            .tempfile_in(staging)
            .map_err(|e| PluginError::io(staging, e))?
            .into_temp_path();
        copy_atomic(jar, &aside).await?;
        Ok(Some(aside))
    }

    async fn save_registry(&self) -> Result<(), PluginError> {
        self.registry.save().await.map_err(|e| {
            error!("Failed to persist plugin registry: {}", e);
            e
        })
    }

    /// Writes and removes a throwaway file in the plugin directory.
    async fn ensure_writable(&self) -> Result<(), PluginError> {
        let dir = &self.config.plugin_dir;
        let marker = dir.join(format!(".write-check-{}", uuid::Uuid::new_v4()));
        let result = async {
            tokio_fs::create_dir_all(dir).await?;
            tokio_fs::write(&marker, b"").await?;
            tokio_fs::remove_file(&marker).await
        }
        .await;

        result.map_err(|e| {
            let err = PluginError::Permission(format!(
                "Plugin directory {} is not accessible or not writable",
                dir.display()
            ));
            error!("{} ({})", err, e);
            err
        })
    }

    fn publish(&self, action: HistoryAction, name: &str, version: &str) {
        // no subscribers is fine
        let _ = self.history.send(HistoryEntry::now(action, name, version));
    }
}

async fn remove_if_present(path: &Path) -> Result<(), PluginError> {
    match tokio_fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PluginError::io(path, e)),
    }
}

/// Removes downloads left behind by an interrupted process.
async fn clear_staging(dir: &Path) -> Result<(), PluginError> {
    tokio_fs::create_dir_all(dir)
        .await
        .map_err(|e| PluginError::io(dir, e))?;
    let mut entries = tokio_fs::read_dir(dir).await.map_err(|e| PluginError::io(dir, e))?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| PluginError::io(dir, e))? {
        let path = entry.path();
        if let Err(e) = tokio_fs::remove_file(&path).await {
            warn!("Could not remove stale download {}: {}", path.display(), e);
        }
    }
    Ok(())
}

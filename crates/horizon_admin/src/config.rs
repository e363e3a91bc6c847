//! Configuration management for the admin job service.
//!
//! Settings are loaded from a TOML file, overridden from the command line,
//! validated, and then converted into the config types of the library crates.

use job_queue::{QueueConfig, WorkerConfig};
use plugin_system::{ManagerConfig, MarketplaceEndpoints, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub plugins: PluginSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub marketplace: MarketplaceSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Where plugins live and where the service keeps its own state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Server plugin directory holding the live JARs
    pub directory: String,
    /// Holds jobs.json, plugins.json, backups and download staging
    pub data_dir: String,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            directory: "plugins".to_string(),
            data_dir: "data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    /// Terminal jobs retained before the oldest are pruned
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Fallback store poll in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_history_limit() -> usize {
    500
}

fn default_poll_interval() -> u64 {
    500
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Outbound HTTP limits for marketplace lookups and downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub connect_timeout_secs: u64,
    pub lookup_timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// Abort a download when no bytes arrive for this long
    pub stall_timeout_secs: u64,
    pub max_redirects: usize,
    pub max_download_mb: u64,
    /// Overrides the default `horizon-admin/<version>` agent
    pub user_agent: Option<String>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            lookup_timeout_secs: 15,
            download_timeout_secs: 300,
            stall_timeout_secs: 30,
            max_redirects: 5,
            max_download_mb: 100,
            user_agent: None,
        }
    }
}

/// Marketplace API base URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketplaceSettings {
    pub modrinth_api: String,
    pub spiget_api: String,
    pub github_api: String,
}

impl Default for MarketplaceSettings {
    fn default() -> Self {
        let endpoints = MarketplaceEndpoints::default();
        Self {
            modrinth_api: endpoints.modrinth_api,
            spiget_api: endpoints.spiget_api,
            github_api: endpoints.github_api,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    /// Optional file that receives a copy of all log output
    #[serde(default)]
    pub file_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            file_path: None,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, the default configuration is written there
    /// and returned.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration, or an error if the file could not
    /// be read or created.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Server plugin directory as a path.
    pub fn plugin_dir(&self) -> PathBuf {
        PathBuf::from(&self.plugins.directory)
    }

    /// State directory as a path.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.plugins.data_dir)
    }

    /// Path of the durable job store.
    pub fn jobs_file(&self) -> PathBuf {
        self.data_dir().join("jobs.json")
    }

    /// Converts the file settings into the plugin manager's layout and limits.
    ///
    /// # Returns
    ///
    /// A `ManagerConfig` with `plugins.json`, backups and staging under the
    /// data directory.
    pub fn to_manager_config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::new(self.plugin_dir(), self.data_dir());
        config.max_download_bytes = self.network.max_download_mb.saturating_mul(1024 * 1024);
        config.stall_timeout = Duration::from_secs(self.network.stall_timeout_secs);
        config.endpoints = MarketplaceEndpoints {
            modrinth_api: self.marketplace.modrinth_api.clone(),
            spiget_api: self.marketplace.spiget_api.clone(),
            github_api: self.marketplace.github_api.clone(),
        };
        config
    }

    /// Converts the network section into HTTP client settings.
    ///
    /// # Returns
    ///
    /// A `TransportConfig`, keeping the default user agent unless one is set.
    pub fn to_transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig {
            connect_timeout: Duration::from_secs(self.network.connect_timeout_secs),
            lookup_timeout: Duration::from_secs(self.network.lookup_timeout_secs),
            download_timeout: Duration::from_secs(self.network.download_timeout_secs),
            max_redirects: self.network.max_redirects,
            ..TransportConfig::default()
        };
        if let Some(agent) = &self.network.user_agent {
            config.user_agent = agent.clone();
        }
        config
    }

    /// # Returns
    ///
    /// The job history retention for the queue.
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            history_limit: self.jobs.history_limit,
        }
    }

    /// # Returns
    ///
    /// The worker's fallback poll interval.
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.jobs.poll_interval_ms),
        }
    }

    /// Checks the configuration for values the service cannot run with.
    ///
    /// Covers the directory layout and the numeric job and network limits.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is usable, or a message naming the first
    /// offending setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.plugins.directory.trim().is_empty() {
            return Err("Plugin directory cannot be empty".to_string());
        }
        if self.plugins.data_dir.trim().is_empty() {
            return Err("Data directory cannot be empty".to_string());
        }
        if self.data_dir().starts_with(self.plugin_dir()) {
            return Err(format!(
                "Data directory {} must not be inside the plugin directory {}",
                self.plugins.data_dir, self.plugins.directory
            ));
        }

        if self.jobs.history_limit == 0 {
            return Err("jobs.history_limit must be at least 1".to_string());
        }
        if self.jobs.poll_interval_ms == 0 {
            return Err("jobs.poll_interval_ms must be greater than zero".to_string());
        }

        if self.network.stall_timeout_secs == 0 {
            return Err("network.stall_timeout_secs must be greater than zero".to_string());
        }
        if self.network.lookup_timeout_secs == 0 || self.network.download_timeout_secs == 0 {
            return Err("network timeouts must be greater than zero".to_string());
        }
        if self.network.max_download_mb == 0 {
            return Err("network.max_download_mb must be greater than zero".to_string());
        }

        for (key, value) in [
            ("modrinth_api", &self.marketplace.modrinth_api),
            ("spiget_api", &self.marketplace.spiget_api),
            ("github_api", &self.marketplace.github_api),
        ] {
            if !value.starts_with("http://") && !value.starts_with("https://") {
                return Err(format!("Invalid marketplace.{}: {}", key, value));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}

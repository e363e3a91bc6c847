//! Error types for plugin management operations.
//!
//! Version conflicts are not errors. They are reported through
//! [`crate::InstallOutcome::Conflict`] and await caller confirmation.

use std::io;
use std::path::{Path, PathBuf};

/// Errors that can occur while resolving, downloading or mutating plugins.
///
/// # Error Categories
///
/// - **Validation / InvalidUrl / InvalidPluginFile**: caller or input faults, never retried
/// - **NotFound / NoBackupAvailable**: the named plugin or its backup does not exist
/// - **Network / DownloadTimeout**: transient faults, callers may enqueue a fresh job
/// - **Permission**: the plugin directory cannot be written, fatal for the environment
/// - **Storage**: any other filesystem or registry persistence failure
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Bad input such as a missing URL or an illegal plugin name
    #[error("Validation error: {0}")]
    Validation(String),
    /// The URL could not be parsed or points to an unsupported source
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Requested plugin is not present in the registry
    #[error("Plugin not found: {0}")]
    NotFound(String),
    /// Lookup or download failed at the network level
    #[error("Network error: {0}")]
    Network(String),
    /// Lookup or download exceeded its time budget
    #[error("Download timed out: {0}")]
    DownloadTimeout(String),
    /// Downloaded artifact is not a well-formed plugin archive
    #[error("Invalid plugin file: {0}")]
    InvalidPluginFile(String),
    /// Filesystem location exists but cannot be accessed or written
    #[error("{0}")]
    Permission(String),
    /// Rollback was requested without a backup in place
    #[error("No backup available for plugin {0}")]
    NoBackupAvailable(String),
    /// The operation observed its cancellation token
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
    /// Filesystem or persistence failure
    #[error("Storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Registry or metadata file contained malformed JSON
    #[error("Corrupt data in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PluginError {
    /// Wraps an I/O error for `path`, promoting permission failures to
    /// [`PluginError::Permission`] so they surface verbatim.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref();
        if source.kind() == io::ErrorKind::PermissionDenied {
            return PluginError::Permission(format!(
                "Path {} is not accessible or not writable",
                path.display()
            ));
        }
        PluginError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Short machine-readable category, used in job results and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PluginError::Validation(_) => "validation",
            PluginError::InvalidUrl(_) => "invalid_url",
            PluginError::NotFound(_) => "not_found",
            PluginError::Network(_) => "network",
            PluginError::DownloadTimeout(_) => "download_timeout",
            PluginError::InvalidPluginFile(_) => "invalid_plugin_file",
            PluginError::Permission(_) => "permission",
            PluginError::NoBackupAvailable(_) => "no_backup_available",
            PluginError::Cancelled(_) => "cancelled",
            PluginError::Storage { .. } => "storage",
            PluginError::Corrupt { .. } => "corrupt",
        }
    }

    /// Whether submitting a fresh job might succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PluginError::Network(_) | PluginError::DownloadTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_is_promoted() {
        let err = PluginError::io(
            "/srv/plugins",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), "permission");
        assert!(err.to_string().contains("not accessible or not writable"));
    }

    #[test]
    fn other_io_errors_stay_storage() {
        let err = PluginError::io("/srv/plugins/a.jar", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.kind(), "storage");
        assert!(!err.is_transient());
    }

    #[test]
    fn network_faults_are_transient() {
        assert!(PluginError::Network("reset".into()).is_transient());
        assert!(PluginError::DownloadTimeout("slow".into()).is_transient());
        assert!(!PluginError::InvalidPluginFile("bad".into()).is_transient());
    }
}

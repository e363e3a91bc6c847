//! Server plugin management for Horizon Admin.
//!
//! Resolves plugin JARs from direct links and marketplaces, validates their
//! manifests, and installs, updates, toggles, removes and rolls them back in
//! a server's plugin directory. State lives in `plugins.json` plus one backup
//! slot per plugin.
//!
//! [`PluginManager`] performs all mutations and is meant to be owned by a
//! single task. [`PluginCatalog`] offers a read-only view for everyone else.

pub mod backup;
pub mod catalog;
pub mod download;
pub mod error;
pub mod events;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod resolve;
pub mod transport;
pub mod version;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use catalog::{PluginCatalog, PluginView};
pub use error::PluginError;
pub use events::{DownloadProgress, HistoryAction, HistoryEntry, OperationContext, OperationEvent};
pub use manager::{
    validate_plugin_name, ConflictKind, InstallAction, InstallOutcome, InstallRequest, ManagerConfig,
    PluginManager, ResolveAction, RollbackOutcome, ToggleOutcome, UninstallOutcome,
};
pub use manifest::{ManifestKind, PluginManifest};
pub use registry::PluginRecord;
pub use resolve::{DownloadOption, MarketplaceEndpoints, ParsedUrl, SourceKind};
pub use transport::{HttpTransport, ReqwestTransport, TransportConfig};
pub use version::compare_versions;

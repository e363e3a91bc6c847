//! Events produced by plugin operations.
//!
//! Long-running operations do not take callbacks. They publish
//! [`OperationEvent`]s through the [`OperationContext`] they are given, and
//! whoever created the context drains the receiving end. Completed mutations
//! are announced separately as [`HistoryEntry`] values on a broadcast channel.

use crate::error::PluginError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Download progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    /// Present only when the server announced a content length
    pub percentage: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationEvent {
    /// Human readable progress line
    Log(String),
    Progress(DownloadProgress),
}

/// Handle passed into every long-running plugin operation.
///
/// Carries the event producer and the cancellation token that the operation
/// checks between downloaded chunks and before committing any change.
#[derive(Debug, Clone)]
pub struct OperationContext {
    events: Option<mpsc::UnboundedSender<OperationEvent>>,
    cancel: CancellationToken,
}

impl OperationContext {
    pub fn new(events: mpsc::UnboundedSender<OperationEvent>, cancel: CancellationToken) -> Self {
        Self {
            events: Some(events),
            cancel,
        }
    }

    /// Creates a context together with the receiver for its events.
    pub fn channel(cancel: CancellationToken) -> (Self, mpsc::UnboundedReceiver<OperationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, cancel), rx)
    }

    /// A context nobody listens to, with its own token.
    pub fn detached() -> Self {
        Self {
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        if let Some(events) = &self.events {
            let _ = events.send(OperationEvent::Log(message));
        }
    }

    pub fn progress(&self, progress: DownloadProgress) {
        if let Some(events) = &self.events {
            let _ = events.send(OperationEvent::Progress(progress));
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Suspension point: fails with [`PluginError::Cancelled`] once the token fired.
    pub fn ensure_active(&self, stage: &str) -> Result<(), PluginError> {
        if self.cancel.is_cancelled() {
            return Err(PluginError::Cancelled(format!("stopped before {}", stage)));
        }
        Ok(())
    }
}

/// Kind of a completed mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Install,
    Update,
    Downgrade,
    Reinstall,
    Uninstall,
    Enable,
    Disable,
    Rollback,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Install => "install",
            HistoryAction::Update => "update",
            HistoryAction::Downgrade => "downgrade",
            HistoryAction::Reinstall => "reinstall",
            HistoryAction::Uninstall => "uninstall",
            HistoryAction::Enable => "enable",
            HistoryAction::Disable => "disable",
            HistoryAction::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record per completed mutating operation, for the audit collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub action: HistoryAction,
    pub plugin_name: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn now(action: HistoryAction, plugin_name: &str, version: &str) -> Self {
        Self {
            action,
            plugin_name: plugin_name.to_string(),
            version: version.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_receiver_in_order() {
        let (ctx, mut rx) = OperationContext::channel(CancellationToken::new());
        ctx.log("Resolving");
        ctx.progress(DownloadProgress {
            downloaded: 5,
            total: Some(10),
            percentage: Some(50),
        });
        drop(ctx);

        assert_eq!(rx.recv().await, Some(OperationEvent::Log("Resolving".into())));
        assert!(matches!(rx.recv().await, Some(OperationEvent::Progress(p)) if p.percentage == Some(50)));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_cancelled_context_refuses_to_continue() {
        let token = CancellationToken::new();
        let (ctx, _rx) = OperationContext::channel(token.clone());
        assert!(ctx.ensure_active("download").is_ok());
        token.cancel();
        let err = ctx.ensure_active("commit").unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[test]
    fn test_history_entry_wire_format() {
        let entry = HistoryEntry::now(HistoryAction::Rollback, "Foo", "1.0");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["action"], "rollback");
        assert_eq!(json["pluginName"], "Foo");
    }
}

//! Job model.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, Utc};
use plugin_system::{validate_plugin_name, ResolveAction};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

pub type JobId = Uuid;

/// Plugin operation requested by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Install,
    Uninstall,
    Update,
    Enable,
    Disable,
    Rollback,
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobAction::Install => "install",
            JobAction::Uninstall => "uninstall",
            JobAction::Update => "update",
            JobAction::Enable => "enable",
            JobAction::Disable => "disable",
            JobAction::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Allowed moves: queued to running or cancelled, running to completed or failed.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Job creation request as submitted by the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub action: JobAction,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl JobSpec {
    pub fn new(action: JobAction) -> Self {
        Self {
            action,
            name: None,
            url: None,
            options: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// Trims inputs and checks the fields `action` needs.
    pub fn validate(mut self) -> JobResult<Self> {
        self.name = non_blank(self.name.take());
        self.url = non_blank(self.url.take());

        let missing = match self.action {
            JobAction::Install => self.url.is_none().then_some("url is required for install"),
            JobAction::Update => (self.url.is_none() && self.name.is_none())
                .then_some("name or url is required for update"),
            JobAction::Uninstall | JobAction::Enable | JobAction::Disable | JobAction::Rollback => {
                self.name.is_none().then_some("name is required for this action")
            }
        };
        if let Some(message) = missing {
            return Err(JobError::Validation(message.to_string()));
        }

        if let Some(name) = &self.name {
            validate_plugin_name(name).map_err(|e| JobError::Validation(e.to_string()))?;
        }
        if let Some(confirm) = option_token(&self.options, "confirm") {
            confirm
                .parse::<ResolveAction>()
                .map_err(|e| JobError::Validation(e.to_string()))?;
        }
        Ok(self)
    }
}

/// A queued or executed plugin operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    /// Submission order, used for FIFO dispatch
    pub seq: u64,
    pub action: JobAction,
    pub plugin_name: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub options: Map<String, Value>,
    pub status: JobStatus,
    #[serde(default)]
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(spec: JobSpec, seq: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            action: spec.action,
            plugin_name: spec.name,
            url: spec.url,
            options: spec.options,
            status: JobStatus::Queued,
            logs: Vec::new(),
            error: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Moves the job to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: JobStatus) -> JobResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidState(format!(
                "Job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        let now = Utc::now();
        match next {
            JobStatus::Running => self.started_at = Some(now),
            _ => self.completed_at = Some(now),
        }
        self.status = next;
        Ok(())
    }

    /// String or numeric option value.
    pub fn option(&self, key: &str) -> Option<String> {
        option_token(&self.options, key)
    }

    pub fn option_flag(&self, key: &str) -> bool {
        match self.options.get(key) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Confirmation carried in `options.confirm`.
    pub fn confirmation(&self) -> Result<Option<ResolveAction>, plugin_system::PluginError> {
        self.option("confirm").map(|c| c.parse()).transpose()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn option_token(options: &Map<String, Value>, key: &str) -> Option<String> {
    match options.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

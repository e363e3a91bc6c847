//! Maps a job's action onto the plugin manager call that performs it.

use crate::job::{Job, JobAction};
use plugin_system::{
    InstallOutcome, InstallRequest, OperationContext, PluginError, PluginManager, ResolveAction,
};
use serde::Serialize;
use serde_json::Value;

/// What a finished operation hands back to the queue.
#[derive(Debug)]
pub(crate) struct Dispatched {
    /// Plugin name learned during execution
    pub plugin_name: Option<String>,
    pub result: Value,
}

pub(crate) async fn dispatch(
    manager: &mut PluginManager,
    job: &Job,
    ctx: OperationContext,
) -> Result<Dispatched, PluginError> {
    match job.action {
        JobAction::Install => {
            let url = job
                .url
                .clone()
                .ok_or_else(|| PluginError::Validation("url is required for install".to_string()))?;
            let request = install_request(job, url);
            let outcome = match job.confirmation()? {
                Some(action) => manager.proceed_with_install(request, action, &ctx).await?,
                None => manager.install_from_url(request, &ctx).await?,
            };
            Ok(from_install(outcome))
        }
        JobAction::Update => {
            let url = match &job.url {
                Some(url) => url.clone(),
                None => recorded_source(manager, required_name(job)?)?,
            };
            let action = job.confirmation()?.unwrap_or(ResolveAction::Update);
            let outcome = manager
                .proceed_with_install(install_request(job, url), action, &ctx)
                .await?;
            Ok(from_install(outcome))
        }
        JobAction::Uninstall => {
            let name = required_name(job)?;
            let outcome = manager
                .uninstall_plugin(name, job.option_flag("deleteConfigs"), &ctx)
                .await?;
            Ok(named(name, &outcome))
        }
        JobAction::Enable | JobAction::Disable => {
            let name = required_name(job)?;
            let enabled = job.action == JobAction::Enable;
            let outcome = manager.toggle_plugin(name, enabled, &ctx).await?;
            Ok(named(name, &outcome))
        }
        JobAction::Rollback => {
            let name = required_name(job)?;
            let outcome = manager.rollback_plugin(name, &ctx).await?;
            Ok(named(name, &outcome))
        }
    }
}

fn install_request(job: &Job, url: String) -> InstallRequest {
    InstallRequest {
        url,
        custom_name: job.plugin_name.clone(),
        selection: job.option("selectedOption"),
    }
}

fn required_name(job: &Job) -> Result<&str, PluginError> {
    job.plugin_name
        .as_deref()
        .ok_or_else(|| PluginError::Validation(format!("name is required for {}", job.action)))
}

fn recorded_source(manager: &PluginManager, name: &str) -> Result<String, PluginError> {
    let record = manager
        .get_plugin(name)
        .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
    record.source.clone().ok_or_else(|| {
        PluginError::Validation(format!("{} has no recorded source URL, provide one", name))
    })
}

fn from_install(outcome: InstallOutcome) -> Dispatched {
    let plugin_name = match &outcome {
        InstallOutcome::Installed { plugin_name, .. } | InstallOutcome::Conflict { plugin_name, .. } => {
            Some(plugin_name.clone())
        }
        InstallOutcome::SelectionRequired { .. } => None,
    };
    Dispatched {
        plugin_name,
        result: to_value(&outcome),
    }
}

fn named<T: Serialize>(name: &str, outcome: &T) -> Dispatched {
    Dispatched {
        plugin_name: Some(name.to_string()),
        result: to_value(outcome),
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

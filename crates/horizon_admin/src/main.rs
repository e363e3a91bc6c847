//! Horizon admin job service.
//!
//! Loads configuration, opens the plugin manager and the durable job queue,
//! and runs the single job worker until a shutdown signal arrives.

mod cli;
mod config;
mod logging;
mod signals;

use cli::CliArgs;
use config::AppConfig;
use job_queue::{JobFilter, JobQueue, JobStatus, JsonJobStorage, Worker, WorkerHandle};
use plugin_system::{HistoryEntry, PluginManager, ReqwestTransport};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Wired-up service.
pub struct Application {
    config: AppConfig,
    queue: JobQueue,
    worker: WorkerHandle,
    history: JoinHandle<()>,
}

impl Application {
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(plugin_dir) = args.plugin_dir {
            config.plugins.directory = plugin_dir.to_string_lossy().to_string();
        }
        if let Some(data_dir) = args.data_dir {
            config.plugins.data_dir = data_dir.to_string_lossy().to_string();
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {}", e).into());
        }

        logging::setup_logging(&config.logging)?;
        info!(
            "Horizon Admin v{} | Config: {} | Plugins: {} | Data: {}",
            env!("CARGO_PKG_VERSION"),
            args.config_path.display(),
            config.plugins.directory,
            config.plugins.data_dir
        );

        let transport = Arc::new(ReqwestTransport::new(config.to_transport_config())?);
        let manager = PluginManager::open(config.to_manager_config(), transport).await?;
        let history = spawn_history_logger(manager.subscribe_history());

        let storage = Arc::new(JsonJobStorage::new(config.jobs_file()));
        let queue = JobQueue::open(storage, config.to_queue_config()).await?;
        let worker = Worker::spawn(queue.clone(), manager, config.to_worker_config()).await?;

        Ok(Self {
            config,
            queue,
            worker,
            history,
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let pending = self
            .queue
            .get_jobs(JobFilter {
                status: Some(JobStatus::Queued),
                limit: None,
            })
            .await;
        info!(
            "Job service running | {} queued jobs | history limit {}",
            pending.len(),
            self.config.jobs.history_limit
        );
        info!("Press Ctrl+C to shut down");

        signals::wait_for_shutdown().await?;

        info!("Shutdown signal received, stopping job worker");
        if let Some(id) = self.worker.current_job_id() {
            warn!("[{}] Job is still running and will be cancelled", id);
        }
        self.worker.shutdown().await;
        self.history.abort();

        info!("Horizon Admin shutdown complete");
        Ok(())
    }
}

/// Mirrors plugin history events into the log for the console's audit trail.
fn spawn_history_logger(mut events: broadcast::Receiver<HistoryEntry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(entry) => info!(
                    "Plugin history: {} {} {}",
                    entry.action, entry.plugin_name, entry.version
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Plugin history logger skipped {} events", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("Application error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Failed to start application: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

//! The single job consumer.
//!
//! [`Worker::spawn`] moves the [`PluginManager`] into a background task that
//! executes queued jobs one at a time in submission order. Because the task
//! is the manager's only owner, no two plugin mutations can ever overlap.

use crate::dispatch::dispatch;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId};
use crate::queue::JobQueue;
use parking_lot::Mutex;
use plugin_system::{OperationContext, OperationEvent, PluginError, PluginManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Fallback store poll when no wake-up arrives
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Control handle for a running worker.
pub struct WorkerHandle {
    current: Arc<Mutex<Option<JobId>>>,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn is_processing(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn current_job_id(&self) -> Option<JobId> {
        *self.current.lock()
    }

    /// Stops the loop. A running job observes cancellation at its next
    /// checkpoint and is recorded as failed.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!("Job worker task ended abnormally: {}", e);
        }
        info!("Job worker stopped");
    }
}

pub struct Worker {
    queue: JobQueue,
    manager: PluginManager,
    config: WorkerConfig,
    current: Arc<Mutex<Option<JobId>>>,
    shutdown: CancellationToken,
}

impl Worker {
    /// Reconciles interrupted jobs and starts consuming `queue`.
    ///
    /// Fails if another worker already consumes this queue.
    pub async fn spawn(queue: JobQueue, manager: PluginManager, config: WorkerConfig) -> JobResult<WorkerHandle> {
        let wake = queue.take_wake_receiver().ok_or_else(|| {
            JobError::InvalidState("a worker is already consuming this job queue".to_string())
        })?;

        let recovered = queue.recover_interrupted().await?;
        if recovered > 0 {
            warn!("Marked {} interrupted jobs as failed", recovered);
        }

        let current = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();
        let worker = Worker {
            queue,
            manager,
            config,
            current: current.clone(),
            shutdown: shutdown.clone(),
        };
        let join = tokio::spawn(worker.run(wake));
        info!("Job worker started");

        Ok(WorkerHandle {
            current,
            shutdown,
            join,
        })
    }

    async fn run(mut self, mut wake: tokio::sync::mpsc::UnboundedReceiver<JobId>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.queue.claim_next(&self.shutdown).await {
                Ok(Some(job)) => {
                    self.execute(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!("Failed to claim next job: {}", e),
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(id) = wake.recv() => debug!("[{}] Worker woken", id),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn execute(&mut self, job: Job) {
        let job_id = job.id;
        *self.current.lock() = Some(job_id);
        info!("[{}] Running {} job", job_id, job.action);

        let (ctx, mut events) = OperationContext::channel(self.shutdown.child_token());
        let mut progress = ProgressLines::default();
        let queue = self.queue.clone();

        let operation = dispatch(&mut self.manager, &job, ctx);
        tokio::pin!(operation);

        let outcome = loop {
            tokio::select! {
                outcome = &mut operation => break outcome,
                Some(event) = events.recv() => {
                    if let Some(line) = progress.line(event) {
                        record(&queue, job_id, line).await;
                    }
                }
            }
        };
        while let Ok(event) = events.try_recv() {
            if let Some(line) = progress.line(event) {
                record(&queue, job_id, line).await;
            }
        }

        let (plugin_name, result) = match outcome {
            Ok(dispatched) => (dispatched.plugin_name, Ok(dispatched.result)),
            Err(e) => {
                log_failure(job_id, &e);
                (None, Err(e.to_string()))
            }
        };

        match self.queue.finish(job_id, plugin_name, result).await {
            Ok(done) => info!("[{}] Job {}", job_id, done.status),
            Err(e) => error!("[{}] Failed to record job outcome: {}", job_id, e),
        }
        *self.current.lock() = None;
    }
}

async fn record(queue: &JobQueue, job_id: JobId, line: String) {
    info!("[{}] {}", job_id, line);
    queue.append_log(job_id, line).await;
}

fn log_failure(job_id: JobId, err: &PluginError) {
    match err {
        PluginError::Permission(_) | PluginError::Storage { .. } | PluginError::Corrupt { .. } => {
            error!("[{}] Job failed: {}", job_id, err)
        }
        _ => warn!("[{}] Job failed ({}): {}", job_id, err.kind(), err),
    }
}

/// Turns operation events into log lines, skipping repeated progress values.
#[derive(Default)]
struct ProgressLines {
    last_percentage: Option<u8>,
}

impl ProgressLines {
    fn line(&mut self, event: OperationEvent) -> Option<String> {
        match event {
            OperationEvent::Log(line) => Some(line),
            OperationEvent::Progress(p) => match p.percentage {
                Some(pct) if self.last_percentage == Some(pct) => None,
                Some(pct) => {
                    self.last_percentage = Some(pct);
                    Some(format!("Download progress: {}%", pct))
                }
                None => Some(format!("Downloaded {} bytes", p.downloaded)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_system::DownloadProgress;

    fn progress(pct: u8) -> OperationEvent {
        OperationEvent::Progress(DownloadProgress {
            downloaded: pct as u64,
            total: Some(100),
            percentage: Some(pct),
        })
    }

    #[test]
    fn test_progress_lines_are_deduplicated() {
        let mut lines = ProgressLines::default();
        assert_eq!(lines.line(progress(10)).as_deref(), Some("Download progress: 10%"));
        assert_eq!(lines.line(progress(10)), None);
        assert_eq!(lines.line(OperationEvent::Log("x".into())).as_deref(), Some("x"));
        assert_eq!(lines.line(progress(20)).as_deref(), Some("Download progress: 20%"));
    }
}

//! Durable FIFO queue of plugin jobs.
//!
//! The queue is cheap to clone and shared between request handlers and the
//! worker. Handlers only create, read and cancel jobs; every other status
//! change is made by the worker through the crate-private methods below.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobSpec, JobStatus};
use crate::store::JobStorage;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Error recorded on jobs interrupted by a process exit.
pub const INTERRUPTED_ERROR: &str = "Worker restarted while the job was running";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Terminal jobs kept before the oldest are pruned
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { history_limit: 500 }
    }
}

/// Query for [`JobQueue::get_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

struct QueueState {
    jobs: Vec<Job>,
    next_seq: u64,
}

impl QueueState {
    fn find_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }
}

struct Inner {
    storage: Arc<dyn JobStorage>,
    state: Mutex<QueueState>,
    wake_tx: mpsc::UnboundedSender<JobId>,
    wake_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
    config: QueueConfig,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// Loads persisted jobs from `storage`.
    pub async fn open(storage: Arc<dyn JobStorage>, config: QueueConfig) -> JobResult<Self> {
        let mut jobs = storage.load_all().await?;
        jobs.sort_by_key(|j| j.seq);
        let next_seq = jobs.last().map_or(1, |j| j.seq + 1);
        info!("Job queue opened with {} persisted jobs", jobs.len());

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                state: Mutex::new(QueueState { jobs, next_seq }),
                wake_tx,
                wake_rx: parking_lot::Mutex::new(Some(wake_rx)),
                config,
            }),
        })
    }

    /// Validates `spec`, persists a new queued job and wakes the worker.
    pub async fn create_job(&self, spec: JobSpec) -> JobResult<Job> {
        let spec = spec.validate()?;
        let mut state = self.inner.state.lock().await;
        let job = Job::new(spec, state.next_seq);
        state.jobs.push(job.clone());

        if let Err(e) = self.inner.storage.save_all(&state.jobs).await {
            state.jobs.pop();
            error!("Failed to persist new {} job: {}", job.action, e);
            return Err(e.into());
        }
        state.next_seq += 1;
        drop(state);

        info!("[{}] Queued {} job", job.id, job.action);
        let _ = self.inner.wake_tx.send(job.id);
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> JobResult<Job> {
        let state = self.inner.state.lock().await;
        state
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or(JobError::NotFound(id))
    }

    /// Jobs matching `filter`, newest first.
    pub async fn get_jobs(&self, filter: JobFilter) -> Vec<Job> {
        let state = self.inner.state.lock().await;
        state
            .jobs
            .iter()
            .rev()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Cancels a queued job. Running and finished jobs are left untouched.
    pub async fn cancel_job(&self, id: JobId) -> JobResult<Job> {
        let mut state = self.inner.state.lock().await;
        let job = state.find_mut(id).ok_or(JobError::NotFound(id))?;
        if job.status != JobStatus::Queued {
            return Err(JobError::InvalidState(format!(
                "Cannot cancel job {} in status {}",
                id, job.status
            )));
        }

        let before = job.clone();
        job.transition(JobStatus::Cancelled)?;
        job.logs.push("Cancelled before execution".to_string());
        let cancelled = job.clone();

        if let Err(e) = self.inner.storage.save_all(&state.jobs).await {
            if let Some(job) = state.find_mut(id) {
                *job = before;
            }
            return Err(e.into());
        }
        prune(&mut state, self.inner.config.history_limit);
        drop(state);

        info!("[{}] Job cancelled", id);
        Ok(cancelled)
    }

    /// Hands out the wake-up receiver. Only the first caller gets it, which
    /// keeps a queue to a single worker.
    pub fn take_wake_receiver(&self) -> Option<mpsc::UnboundedReceiver<JobId>> {
        self.inner.wake_rx.lock().take()
    }

    /// Fails jobs that were running when the previous process stopped.
    pub(crate) async fn recover_interrupted(&self) -> JobResult<usize> {
        let mut state = self.inner.state.lock().await;
        let mut recovered = 0;
        for job in state.jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
            job.transition(JobStatus::Failed)?;
            job.error = Some(INTERRUPTED_ERROR.to_string());
            job.logs.push(INTERRUPTED_ERROR.to_string());
            warn!("[{}] {}", job.id, INTERRUPTED_ERROR);
            recovered += 1;
        }
        if recovered > 0 {
            self.inner.storage.save_all(&state.jobs).await?;
        }
        Ok(recovered)
    }

    /// Marks the oldest queued job running and returns it.
    ///
    /// Claims nothing once `shutdown` fires, even if it fired while waiting
    /// for the lock.
    pub(crate) async fn claim_next(&self, shutdown: &CancellationToken) -> JobResult<Option<Job>> {
        let mut state = self.inner.state.lock().await;
        if shutdown.is_cancelled() {
            return Ok(None);
        }
        let Some(job) = state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by_key(|j| j.seq)
        else {
            return Ok(None);
        };
        job.transition(JobStatus::Running)?;
        let claimed = job.clone();
        self.persist(&state).await;
        Ok(Some(claimed))
    }

    pub(crate) async fn append_log(&self, id: JobId, line: String) {
        let mut state = self.inner.state.lock().await;
        match state.find_mut(id) {
            Some(job) => job.logs.push(line),
            None => return,
        }
        self.persist(&state).await;
    }

    /// Records the outcome of a running job.
    pub(crate) async fn finish(
        &self,
        id: JobId,
        plugin_name: Option<String>,
        outcome: Result<Value, String>,
    ) -> JobResult<Job> {
        let mut state = self.inner.state.lock().await;
        let job = state.find_mut(id).ok_or(JobError::NotFound(id))?;
        if plugin_name.is_some() {
            job.plugin_name = plugin_name;
        }
        match outcome {
            Ok(result) => {
                job.transition(JobStatus::Completed)?;
                job.result = Some(result);
            }
            Err(message) => {
                job.transition(JobStatus::Failed)?;
                job.logs.push(format!("Error: {}", message));
                job.error = Some(message);
            }
        }
        let finished = job.clone();
        prune(&mut state, self.inner.config.history_limit);
        self.persist(&state).await;
        Ok(finished)
    }

    /// Saves the worker's changes. A failed save is logged and retried with
    /// the next write, since the in-memory state stays authoritative.
    async fn persist(&self, state: &QueueState) {
        if let Err(e) = self.inner.storage.save_all(&state.jobs).await {
            error!("Failed to persist job queue: {}", e);
        }
    }
}

/// Drops the oldest terminal jobs beyond `limit`. Pruned jobs leave the file
/// on the next save.
fn prune(state: &mut QueueState, limit: usize) {
    let terminal = state.jobs.iter().filter(|j| j.status.is_terminal()).count();
    let mut excess = terminal.saturating_sub(limit);
    if excess == 0 {
        return;
    }
    state.jobs.retain(|job| {
        if excess > 0 && job.status.is_terminal() {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobAction;
    use crate::store::JsonJobStorage;
    use tempfile::TempDir;

    async fn open(dir: &TempDir, history_limit: usize) -> JobQueue {
        let storage = Arc::new(JsonJobStorage::new(dir.path().join("jobs.json")));
        JobQueue::open(storage, QueueConfig { history_limit }).await.unwrap()
    }

    fn enable(name: &str) -> JobSpec {
        JobSpec::new(JobAction::Enable).with_name(name)
    }

    #[tokio::test]
    async fn test_created_job_reads_back_queued() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 10).await;
        let job = queue.create_job(enable("Foo")).await.unwrap();
        let read = queue.get_job(job.id).await.unwrap();
        assert_eq!(read.status, JobStatus::Queued);
        assert_eq!(read.plugin_name.as_deref(), Some("Foo"));
    }

    #[tokio::test]
    async fn test_invalid_spec_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 10).await;
        let err = queue.create_job(JobSpec::new(JobAction::Install)).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert!(queue.get_jobs(JobFilter::default()).await.is_empty());
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen_in_order() {
        let dir = TempDir::new().unwrap();
        let ids = {
            let queue = open(&dir, 10).await;
            let a = queue.create_job(enable("A")).await.unwrap().id;
            let b = queue.create_job(enable("B")).await.unwrap().id;
            vec![a, b]
        };

        let queue = open(&dir, 10).await;
        let jobs = queue.get_jobs(JobFilter::default()).await;
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![ids[1], ids[0]]);

        let c = queue.create_job(enable("C")).await.unwrap();
        assert_eq!(c.seq, 3);
        assert_eq!(queue.claim_next(&CancellationToken::new()).await.unwrap().unwrap().id, ids[0]);
    }

    #[tokio::test]
    async fn test_filter_by_status_and_limit() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 10).await;
        let first = queue.create_job(enable("A")).await.unwrap();
        queue.create_job(enable("B")).await.unwrap();
        queue.create_job(enable("C")).await.unwrap();
        queue.cancel_job(first.id).await.unwrap();

        let queued = queue
            .get_jobs(JobFilter {
                status: Some(JobStatus::Queued),
                limit: None,
            })
            .await;
        assert_eq!(queued.len(), 2);

        let newest = queue
            .get_jobs(JobFilter {
                status: None,
                limit: Some(1),
            })
            .await;
        assert_eq!(newest[0].plugin_name.as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 10).await;
        let a = queue.create_job(enable("A")).await.unwrap();
        let b = queue.create_job(enable("B")).await.unwrap();

        let cancelled = queue.cancel_job(b.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        let running = queue.claim_next(&CancellationToken::new()).await.unwrap().unwrap();
        assert_eq!(running.id, a.id);
        let err = queue.cancel_job(a.id).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Cannot cancel job {} in status running", a.id));

        let done = queue.finish(a.id, None, Ok(serde_json::json!({"ok": true}))).await.unwrap();
        let err = queue.cancel_job(a.id).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState(_)));
        assert_eq!(queue.get_job(a.id).await.unwrap(), done);

        assert!(matches!(queue.cancel_job(b.id).await, Err(JobError::InvalidState(_))));
        assert!(matches!(queue.cancel_job(uuid::Uuid::new_v4()).await, Err(JobError::NotFound(_))));
        assert!(queue.claim_next(&CancellationToken::new()).await.unwrap().is_none(), "cancelled job is never dispatched");
    }

    #[tokio::test]
    async fn test_no_claim_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 10).await;
        let job = queue.create_job(enable("A")).await.unwrap();

        let shutdown = CancellationToken::new();
        let guard = queue.inner.state.lock().await;
        let claim = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { queue.claim_next(&shutdown).await })
        };
        tokio::task::yield_now().await;
        shutdown.cancel();
        drop(guard);

        assert!(claim.await.unwrap().unwrap().is_none());
        assert_eq!(queue.get_job(job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_recover_interrupted_fails_running_jobs() {
        let dir = TempDir::new().unwrap();
        let id = {
            let queue = open(&dir, 10).await;
            let job = queue.create_job(enable("A")).await.unwrap();
            queue.create_job(enable("B")).await.unwrap();
            queue.claim_next(&CancellationToken::new()).await.unwrap();
            job.id
        };

        let queue = open(&dir, 10).await;
        assert_eq!(queue.recover_interrupted().await.unwrap(), 1);
        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert_eq!(
            queue
                .get_jobs(JobFilter {
                    status: Some(JobStatus::Queued),
                    limit: None
                })
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_history_limit_prunes_oldest_terminal_jobs() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 2).await;
        let mut ids = Vec::new();
        for name in ["A", "B", "C", "D"] {
            ids.push(queue.create_job(enable(name)).await.unwrap().id);
        }
        for id in &ids[..3] {
            queue.cancel_job(*id).await.unwrap();
        }

        assert!(matches!(queue.get_job(ids[0]).await, Err(JobError::NotFound(_))));
        assert!(queue.get_job(ids[1]).await.is_ok());
        assert!(queue.get_job(ids[2]).await.is_ok());
        assert_eq!(queue.get_job(ids[3]).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_wake_receiver_is_handed_out_once() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, 10).await;
        let mut rx = queue.take_wake_receiver().unwrap();
        assert!(queue.clone().take_wake_receiver().is_none());

        let job = queue.create_job(enable("A")).await.unwrap();
        assert_eq!(rx.recv().await, Some(job.id));
    }
}

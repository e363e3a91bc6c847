use futures::future::join_all;
use job_queue::{
    Job, JobAction, JobError, JobFilter, JobId, JobQueue, JobSpec, JobStatus, JobStorage, JsonJobStorage, QueueConfig,
    Worker, WorkerConfig, WorkerHandle, INTERRUPTED_ERROR,
};
use plugin_system::testing::{build_jar, build_plugin_jar, StaticTransport};
use plugin_system::{HistoryAction, HistoryEntry, ManagerConfig, PluginCatalog, PluginManager};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Harness {
    dir: TempDir,
    transport: Arc<StaticTransport>,
    queue: JobQueue,
    worker: WorkerHandle,
    catalog: PluginCatalog,
    history: broadcast::Receiver<HistoryEntry>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_in(TempDir::new().unwrap()).await
    }

    async fn start_in(dir: TempDir) -> Self {
        let transport = Arc::new(StaticTransport::new());
        let config = manager_config(&dir);
        let catalog = PluginCatalog::new(&config.registry_file, &config.backup_dir);
        let manager = PluginManager::open(config, transport.clone()).await.unwrap();
        let history = manager.subscribe_history();

        let storage = Arc::new(JsonJobStorage::new(dir.path().join("data").join("jobs.json")));
        let queue = JobQueue::open(storage, QueueConfig::default()).await.unwrap();
        let worker = Worker::spawn(queue.clone(), manager, worker_config()).await.unwrap();

        Self {
            dir,
            transport,
            queue,
            worker,
            catalog,
            history,
        }
    }

    fn plugin_dir(&self) -> PathBuf {
        self.dir.path().join("plugins")
    }

    fn serve(&self, file: &str, name: &str, version: &str) -> String {
        let url = format!("https://cdn.test/{}", file);
        self.transport.serve_bytes(&url, build_plugin_jar(name, version));
        url
    }

    fn serve_slowly(&self, file: &str, name: &str, delay: Duration) -> String {
        let url = format!("https://cdn.test/{}", file);
        self.transport
            .serve_bytes_slowly(&url, build_plugin_jar(name, "1.0"), delay);
        url
    }

    async fn run(&self, spec: JobSpec) -> Job {
        let job = self.queue.create_job(spec).await.unwrap();
        wait_terminal(&self.queue, job.id).await
    }
}

fn manager_config(dir: &TempDir) -> ManagerConfig {
    ManagerConfig::new(dir.path().join("plugins"), dir.path().join("data"))
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(50),
    }
}

fn install(url: &str) -> JobSpec {
    JobSpec::new(JobAction::Install).with_url(url)
}

async fn wait_terminal(queue: &JobQueue, id: JobId) -> Job {
    wait_for(queue, id, |job| job.status.is_terminal()).await
}

async fn wait_for(queue: &JobQueue, id: JobId, done: impl Fn(&Job) -> bool) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = queue.get_job(id).await.unwrap();
        if done(&job) {
            return job;
        }
        assert!(tokio::time::Instant::now() < deadline, "job {} stuck in {}", id, job.status);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_install_conflict_update_rollback_scenario() {
    let mut h = Harness::start().await;
    let v1 = h.serve("Foo-1.0.jar", "Foo", "1.0");
    let v2 = h.serve("Foo-1.1.jar", "Foo", "1.1");
    let v1_bytes = build_plugin_jar("Foo", "1.0");

    let job = h.run(install(&v1)).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.plugin_name.as_deref(), Some("Foo"));
    assert_eq!(job.result.as_ref().unwrap()["status"], "installed");
    assert!(job.logs.iter().any(|l| l == "Download progress: 100%"));
    assert!(job.started_at.is_some() && job.completed_at.is_some());

    let job = h.run(install(&v2)).await;
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result["status"], "conflict");
    assert_eq!(result["conflict"], "older_installed");
    assert_eq!(result["action"], "update");
    assert!(!h.catalog.has_backup("Foo").await);

    let job = h.run(install(&v2).with_option("confirm", "update")).await;
    assert_eq!(job.result.as_ref().unwrap()["status"], "installed");
    let view = h.catalog.get("Foo").await.unwrap().unwrap();
    assert_eq!(view.record.version, "1.1");
    assert!(view.has_backup);

    let job = h.run(JobSpec::new(JobAction::Rollback).with_name("Foo")).await;
    assert_eq!(job.status, JobStatus::Completed);
    let view = h.catalog.get("Foo").await.unwrap().unwrap();
    assert_eq!(view.record.version, "1.0");
    assert!(!view.has_backup);
    assert_eq!(std::fs::read(h.plugin_dir().join("Foo.jar")).unwrap(), v1_bytes);

    let actions: Vec<HistoryAction> = std::iter::from_fn(|| h.history.try_recv().ok())
        .map(|entry| entry.action)
        .collect();
    assert_eq!(
        actions,
        vec![HistoryAction::Install, HistoryAction::Update, HistoryAction::Rollback]
    );
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_update_without_url_uses_recorded_source() {
    let h = Harness::start().await;
    let url = h.serve("Foo.jar", "Foo", "1.0");
    h.run(install(&url)).await;

    h.transport.serve_bytes(&url, build_plugin_jar("Foo", "2.0"));
    let job = h.run(JobSpec::new(JobAction::Update).with_name("Foo")).await;
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result["status"], "installed");
    assert_eq!(result["action"], "update");
    assert_eq!(result["previousVersion"], "1.0");

    let job = h.run(JobSpec::new(JobAction::Update).with_name("Ghost")).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("Plugin not found"));
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_at_most_one_job_running_under_concurrent_enqueues() {
    let h = Harness::start().await;
    let urls: Vec<String> = (0..5)
        .map(|i| h.serve_slowly(&format!("P{}.jar", i), &format!("P{}", i), Duration::from_millis(120)))
        .collect();

    let created = join_all(urls.iter().map(|url| h.queue.create_job(install(url)))).await;
    let ids: Vec<_> = created.into_iter().map(|r| r.unwrap().id).collect();

    loop {
        let running = h
            .queue
            .get_jobs(JobFilter {
                status: Some(JobStatus::Running),
                limit: None,
            })
            .await;
        assert!(running.len() <= 1, "{} jobs running at once", running.len());
        if let Some(job) = running.first() {
            if let Some(current) = h.worker.current_job_id() {
                assert!(ids.contains(&current));
            }
            assert!(ids.contains(&job.id));
        }

        let jobs = join_all(ids.iter().map(|id| h.queue.get_job(*id))).await;
        if jobs.iter().all(|j| j.as_ref().unwrap().status.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut jobs: Vec<Job> = join_all(ids.iter().map(|id| h.queue.get_job(*id)))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    jobs.sort_by_key(|j| j.seq);
    for job in &jobs {
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    }
    for pair in jobs.windows(2) {
        assert!(pair[0].completed_at.unwrap() <= pair[1].started_at.unwrap(), "jobs overlapped or ran out of order");
    }
    assert_eq!(h.catalog.list().await.unwrap().len(), 5);
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_cancel_queued_and_refuse_running_or_finished() {
    let h = Harness::start().await;
    let slow = h.serve_slowly("Slow.jar", "Slow", Duration::from_millis(300));
    let other = h.serve("Bar.jar", "Bar", "1.0");

    let first = h.queue.create_job(install(&slow)).await.unwrap();
    let second = h.queue.create_job(install(&other)).await.unwrap();
    wait_for(&h.queue, first.id, |j| j.status == JobStatus::Running).await;
    assert!(h.worker.is_processing());
    assert_eq!(h.worker.current_job_id(), Some(first.id));

    let cancelled = h.queue.cancel_job(second.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let err = h.queue.cancel_job(first.id).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidState(ref m) if m.contains("running")));

    let finished = wait_terminal(&h.queue, first.id).await;
    assert_eq!(finished.status, JobStatus::Completed);
    let err = h.queue.cancel_job(first.id).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidState(_)));
    assert_eq!(h.queue.get_job(first.id).await.unwrap(), finished);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = h.queue.get_job(second.id).await.unwrap();
    assert_eq!(second.status, JobStatus::Cancelled);
    assert!(second.started_at.is_none());
    assert!(h.catalog.get("Bar").await.unwrap().is_none());
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_failures_are_recorded_on_the_job() {
    let h = Harness::start().await;
    h.transport
        .serve_bytes("https://cdn.test/empty.jar", build_jar(&[("README.md", "nothing here")]));

    let job = h.run(install("https://cdn.test/empty.jar")).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().starts_with("Invalid plugin file"));
    assert!(job.logs.last().unwrap().starts_with("Error: "));

    let job = h.run(install("https://cdn.test/missing.jar")).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().starts_with("Network error"));

    let url = h.serve("Foo.jar", "Foo", "1.0");
    h.run(install(&url)).await;
    let job = h.run(JobSpec::new(JobAction::Rollback).with_name("Foo")).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("No backup available for plugin Foo"));

    let job = h
        .run(JobSpec::new(JobAction::Uninstall).with_name("Foo").with_option("deleteConfigs", true))
        .await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!h.plugin_dir().join("Foo.jar").exists());
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_toggle_jobs() {
    let h = Harness::start().await;
    let url = h.serve("Foo.jar", "Foo", "1.0");
    h.run(install(&url)).await;

    let job = h.run(JobSpec::new(JobAction::Enable).with_name("Foo")).await;
    assert_eq!(job.result.unwrap()["changed"], false);

    let job = h.run(JobSpec::new(JobAction::Disable).with_name("Foo")).await;
    assert_eq!(job.result.unwrap(), json!({"pluginName": "Foo", "enabled": false, "changed": true}));
    assert!(h.plugin_dir().join("Foo.jar.disabled").exists());
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_selection_required_result() {
    let h = Harness::start().await;
    h.transport.serve_json(
        "https://api.github.com/repos/acme/tool/releases/latest",
        json!({"tag_name": "v1", "assets": [
            {"id": 1, "name": "tool-paper.jar", "browser_download_url": "https://cdn.test/tool-paper.jar"},
            {"id": 2, "name": "tool-velocity.jar", "browser_download_url": "https://cdn.test/tool-velocity.jar"}
        ]}),
    );
    h.serve("tool-velocity.jar", "Tool", "1.0");

    let job = h.run(install("https://github.com/acme/tool")).await;
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result["status"], "selection_required");
    assert_eq!(result["options"].as_array().unwrap().len(), 2);
    assert!(job.plugin_name.is_none());

    let job = h
        .run(install("https://github.com/acme/tool").with_option("selectedOption", "2"))
        .await;
    assert_eq!(job.result.unwrap()["status"], "installed");
    assert_eq!(job.plugin_name.as_deref(), Some("Tool"));
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_restart_fails_interrupted_jobs_and_resumes_queue() {
    let dir = TempDir::new().unwrap();
    let storage = JsonJobStorage::new(dir.path().join("data").join("jobs.json"));

    let mut interrupted = Job::new(JobSpec::new(JobAction::Enable).with_name("Foo"), 1);
    interrupted.transition(JobStatus::Running).unwrap();
    let pending = Job::new(JobSpec::new(JobAction::Disable).with_name("Foo"), 2);
    storage
        .save_all(&[interrupted.clone(), pending.clone()])
        .await
        .unwrap();

    let h = Harness::start_in(dir).await;
    let recovered = h.queue.get_job(interrupted.id).await.unwrap();
    assert_eq!(recovered.status, JobStatus::Failed);
    assert_eq!(recovered.error.as_deref(), Some(INTERRUPTED_ERROR));

    let pending = wait_terminal(&h.queue, pending.id).await;
    assert_eq!(pending.status, JobStatus::Failed);
    assert_eq!(pending.error.as_deref(), Some("Plugin not found: Foo"));
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_second_worker_is_refused() {
    let h = Harness::start().await;
    let transport = Arc::new(StaticTransport::new());
    let manager = PluginManager::open(manager_config(&h.dir), transport).await.unwrap();
    let err = Worker::spawn(h.queue.clone(), manager, worker_config())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, JobError::InvalidState(_)));
    h.worker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_job_without_writes() {
    let h = Harness::start().await;
    let url = h.serve_slowly("Foo.jar", "Foo", Duration::from_secs(30));
    let job = h.queue.create_job(install(&url)).await.unwrap();
    wait_for(&h.queue, job.id, |j| j.status == JobStatus::Running).await;

    let queue = h.queue.clone();
    h.worker.shutdown().await;

    let job = queue.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().starts_with("Operation cancelled"));
    assert!(!h.dir.path().join("plugins").join("Foo.jar").exists());
}

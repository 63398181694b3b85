use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};

use crate::config::BrokerSettings;
use crate::models::job::{Job, JobId, JobPayload, JobResult, JobStatus};
use crate::models::webhook::WebhookEvent;
use crate::services::broker;
use crate::services::executor::{JobError, JobExecutor};
use crate::services::webhooks::WebhookService;

const PENDING_KEY: &str = "docproc:jobs:pending";
const PROCESSING_KEY: &str = "docproc:jobs:processing";
const JOB_KEY_PREFIX: &str = "docproc:job:";

/// How long an idle durable worker sleeps before polling again.
const POLL_INTERVAL_MS: u64 = 1000;

/// How often `wait_for_result` re-reads the job status.
const WAIT_POLL_INTERVAL_MS: u64 = 100;

/// Which backend the queue settled on at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackendKind {
    Redis,
    InMemory,
}

/// Tuning for the queue workers.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Concurrent workers on the durable backend. The in-process backend
    /// always runs exactly one.
    pub worker_concurrency: usize,
    /// How long terminal job records are kept on the durable backend.
    pub result_ttl: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            result_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Status and result of a job, readable even when the payload is not.
#[derive(Debug, Deserialize)]
struct JobSnapshot {
    status: JobStatus,
    #[serde(default)]
    result: Option<JobResult>,
}

/// Storage and hand-off operations both backends provide. The public queue
/// contract is written once on top of this.
#[async_trait]
trait QueueBackend: Send + Sync {
    /// Persist a new `waiting` job and make it available to workers.
    async fn push(&self, job: &Job) -> Result<(), QueueError>;

    /// Claim the next pending job id, if any.
    async fn pop(&self) -> Result<Option<JobId>, QueueError>;

    async fn load(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    async fn snapshot(&self, id: JobId) -> Result<Option<JobSnapshot>, QueueError>;

    async fn save(&self, job: &Job) -> Result<(), QueueError>;

    /// Release a claimed job once its outcome is recorded.
    async fn ack(&self, _id: JobId) -> Result<(), QueueError> {
        Ok(())
    }

    /// Hand a claimed job back to the pending list without running it.
    async fn requeue(&self, _id: JobId) -> Result<(), QueueError> {
        Ok(())
    }

    /// Record a terminal failure for a job whose stored payload cannot be decoded.
    async fn fail_undecodable(&self, _id: JobId, _error: &str) -> Result<(), QueueError> {
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError>;
}

/// Redis-backed queue. Job records live under `docproc:job:{id}` as JSON,
/// ids move from the pending list to the processing list when claimed.
struct RedisQueue {
    conn: ConnectionManager,
    result_ttl: Duration,
}

impl RedisQueue {
    fn job_key(id: JobId) -> String {
        format!("{}{}", JOB_KEY_PREFIX, id)
    }

    async fn raw(&self, id: JobId) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::job_key(id)).await?;
        Ok(raw)
    }

    /// Return claims left in the processing list by a previous process.
    ///
    /// Ids whose record is still `waiting` go back to the front of the pending
    /// list; ids with no record or a terminal one are dropped. Ids of `active`
    /// jobs are left where they are.
    async fn recover_stranded(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let claimed: Vec<String> = conn.lrange(PROCESSING_KEY, 0, -1).await?;
        let mut requeued = 0;
        for raw in claimed {
            let snapshot = match raw.parse::<JobId>() {
                Ok(id) => match self.snapshot(id).await {
                    Ok(snapshot) => snapshot,
                    Err(QueueError::Serialize(_)) => {
                        // Let a worker pick it up and record the decode failure.
                        Some(JobSnapshot {
                            status: JobStatus::Waiting,
                            result: None,
                        })
                    }
                    Err(e) => return Err(e),
                },
                Err(_) => None,
            };
            match snapshot.map(|s| s.status) {
                Some(JobStatus::Waiting) => {
                    self.move_to_pending(&raw).await?;
                    requeued += 1;
                }
                Some(JobStatus::Active) => {
                    tracing::warn!(job_id = %raw, "Job was active when the previous process stopped");
                }
                _ => {
                    conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &raw).await?;
                }
            }
        }
        Ok(requeued)
    }

    /// Pending is consumed from the right, so RPUSH makes the id next in line.
    async fn move_to_pending(&self, raw: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, raw)
            .ignore()
            .rpush(PENDING_KEY, raw)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn write(&self, id: JobId, terminal: bool, record: String) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        if terminal {
            conn.set_ex::<_, _, ()>(Self::job_key(id), record, self.result_ttl.as_secs().max(1))
                .await?;
        } else {
            conn.set::<_, _, ()>(Self::job_key(id), record).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        let record = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set(Self::job_key(job.id), record)
            .ignore()
            .lpush(PENDING_KEY, job.id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<JobId>, QueueError> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = conn.rpoplpush(PENDING_KEY, PROCESSING_KEY).await?;
        match claimed {
            Some(raw) => match raw.parse::<JobId>() {
                Ok(id) => Ok(Some(id)),
                Err(_) => {
                    tracing::error!(entry = %raw, "Discarding malformed queue entry");
                    conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &raw).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        match self.raw(id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn snapshot(&self, id: JobId) -> Result<Option<JobSnapshot>, QueueError> {
        match self.raw(id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        let record = serde_json::to_string(job)?;
        self.write(job.id, job.status.is_terminal(), record).await
    }

    async fn ack(&self, id: JobId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, id.to_string()).await?;
        Ok(())
    }

    async fn requeue(&self, id: JobId) -> Result<(), QueueError> {
        self.move_to_pending(&id.to_string()).await
    }

    async fn fail_undecodable(&self, id: JobId, error: &str) -> Result<(), QueueError> {
        let Some(raw) = self.raw(id).await? else {
            return Ok(());
        };
        let mut record: Value = serde_json::from_str(&raw)?;
        if let Some(fields) = record.as_object_mut() {
            fields.insert("status".to_string(), json!(JobStatus::Failed));
            fields.insert("result".to_string(), json!(JobResult::failure(error)));
            fields.insert("completedAt".to_string(), json!(Utc::now()));
        }
        self.write(id, true, record.to_string()).await
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn.llen(PENDING_KEY).await?;
        Ok(depth)
    }
}

/// Volatile in-process queue. Job ids are handed to the single worker over
/// a channel so `push` never runs the job in the caller's task.
struct MemoryQueue {
    jobs: RwLock<HashMap<JobId, Job>>,
    sender: mpsc::UnboundedSender<JobId>,
    receiver: Mutex<mpsc::UnboundedReceiver<JobId>>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            jobs: RwLock::new(HashMap::new()),
            sender,
            receiver: Mutex::new(receiver),
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        self.jobs.write().await.insert(job.id, job.clone());
        self.sender.send(job.id).map_err(|_| QueueError::Closed)
    }

    async fn pop(&self) -> Result<Option<JobId>, QueueError> {
        Ok(self.receiver.lock().await.recv().await)
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn snapshot(&self, id: JobId) -> Result<Option<JobSnapshot>, QueueError> {
        Ok(self.jobs.read().await.get(&id).map(|job| JobSnapshot {
            status: job.status,
            result: job.result.clone(),
        }))
    }

    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| job.status == JobStatus::Waiting)
            .count() as u64)
    }
}

/// The backend chosen once at startup.
enum Backend {
    Durable(Arc<RedisQueue>),
    Fallback(Arc<MemoryQueue>),
}

impl Backend {
    fn ops(&self) -> Arc<dyn QueueBackend> {
        match self {
            Backend::Durable(queue) => queue.clone() as Arc<dyn QueueBackend>,
            Backend::Fallback(queue) => queue.clone() as Arc<dyn QueueBackend>,
        }
    }

    fn kind(&self) -> QueueBackendKind {
        match self {
            Backend::Durable(_) => QueueBackendKind::Redis,
            Backend::Fallback(_) => QueueBackendKind::InMemory,
        }
    }
}

/// Runs claimed jobs through the executor and records their outcome.
struct JobRunner {
    executor: Arc<dyn JobExecutor>,
    webhooks: Arc<WebhookService>,
}

impl JobRunner {
    async fn run(&self, backend: &dyn QueueBackend, id: JobId) {
        let mut job = match backend.load(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id = %id, "Claimed job has no record, skipping");
                self.ack(backend, id).await;
                return;
            }
            Err(QueueError::Serialize(e)) => {
                let error = JobError::UnknownJobType(e.to_string()).to_string();
                tracing::error!(job_id = %id, error = %error, "Stored job could not be decoded");
                metrics::counter!("jobs_failed_total", "type" => "unknown").increment(1);
                if let Err(e) = backend.fail_undecodable(id, &error).await {
                    tracing::error!(job_id = %id, error = %e, "Failed to record job failure");
                }
                self.ack(backend, id).await;
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Failed to load claimed job, requeueing");
                if let Err(e) = backend.requeue(id).await {
                    tracing::error!(job_id = %id, error = %e, "Failed to requeue claimed job");
                }
                return;
            }
        };

        if !job.start() {
            tracing::warn!(job_id = %id, status = %job.status, "Job already started, skipping");
            self.ack(backend, id).await;
            return;
        }
        if let Err(e) = backend.save(&job).await {
            tracing::error!(job_id = %id, error = %e, "Failed to mark job active");
        }

        let job_type = job.job_type.to_string();
        tracing::info!(job_id = %id, job_type = %job_type, "Processing job");
        let started = Instant::now();

        let executor = self.executor.clone();
        let payload = job.payload.clone();
        let result = match tokio::spawn(async move { executor.execute(id, &payload).await }).await {
            Ok(result) => result,
            Err(e) => JobResult::failure(format!("Executor panicked: {}", panic_message(e))),
        };

        let elapsed = started.elapsed().as_secs_f64();
        metrics::histogram!("job_processing_seconds", "type" => job_type.clone()).record(elapsed);

        let error = result.error.clone();
        job.finish(result);
        if let Err(e) = backend.save(&job).await {
            tracing::error!(job_id = %id, error = %e, "Failed to record job outcome");
        }
        self.ack(backend, id).await;

        match job.status {
            JobStatus::Completed => {
                tracing::info!(job_id = %id, job_type = %job_type, elapsed_secs = elapsed, "Job completed");
                metrics::counter!("jobs_completed_total", "type" => job_type.clone()).increment(1);
                self.webhooks
                    .trigger(
                        WebhookEvent::JobCompleted,
                        json!({
                            "jobId": id,
                            "type": job_type,
                            "documentId": job.payload.document_id(),
                        }),
                    )
                    .await;
            }
            _ => {
                let error = error.unwrap_or_else(|| "Unknown error".to_string());
                tracing::error!(job_id = %id, job_type = %job_type, error = %error, "Job failed");
                metrics::counter!("jobs_failed_total", "type" => job_type.clone()).increment(1);
                self.webhooks
                    .trigger(
                        WebhookEvent::JobFailed,
                        json!({
                            "jobId": id,
                            "type": job_type,
                            "documentId": job.payload.document_id(),
                            "error": error,
                        }),
                    )
                    .await;
            }
        }
    }

    async fn ack(&self, backend: &dyn QueueBackend, id: JobId) {
        if let Err(e) = backend.ack(id).await {
            tracing::error!(job_id = %id, error = %e, "Failed to release claimed job");
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let panic = err.into_panic();
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn worker_loop(backend: Arc<dyn QueueBackend>, runner: Arc<JobRunner>, worker: usize) {
    tracing::info!(worker, "Queue worker started");
    loop {
        match backend.pop().await {
            Ok(Some(id)) => runner.run(backend.as_ref(), id).await,
            Ok(None) => tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await,
            Err(e) => {
                tracing::error!(worker, error = %e, "Failed to claim next job");
                tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Accepts typed jobs, runs them out-of-band, and reports status and results
/// by id. Works the same over Redis or the in-process fallback.
pub struct JobQueue {
    backend: Backend,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl JobQueue {
    /// Try the broker once. On any failure the in-process backend is used
    /// for the rest of the process lifetime; it is never retried.
    pub async fn connect(
        broker_settings: &BrokerSettings,
        settings: QueueSettings,
        executor: Arc<dyn JobExecutor>,
        webhooks: Arc<WebhookService>,
    ) -> Self {
        match broker::connect(broker_settings).await {
            Ok(conn) => {
                tracing::info!(
                    host = %broker_settings.host,
                    port = broker_settings.port,
                    workers = settings.worker_concurrency,
                    "Job queue using Redis"
                );
                let queue = RedisQueue {
                    conn,
                    result_ttl: settings.result_ttl,
                };
                match queue.recover_stranded().await {
                    Ok(0) => {}
                    Ok(requeued) => {
                        tracing::info!(requeued, "Requeued jobs claimed before the last shutdown")
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to recover claimed jobs"),
                }
                let backend = Backend::Durable(Arc::new(queue));
                Self::start(backend, settings.worker_concurrency.max(1), executor, webhooks)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, job queue using in-memory fallback");
                Self::in_memory(executor, webhooks)
            }
        }
    }

    /// Queue on the in-process backend with its single worker.
    pub fn in_memory(executor: Arc<dyn JobExecutor>, webhooks: Arc<WebhookService>) -> Self {
        Self::start(
            Backend::Fallback(Arc::new(MemoryQueue::new())),
            1,
            executor,
            webhooks,
        )
    }

    fn start(
        backend: Backend,
        workers: usize,
        executor: Arc<dyn JobExecutor>,
        webhooks: Arc<WebhookService>,
    ) -> Self {
        let runner = Arc::new(JobRunner { executor, webhooks });
        let handles = (0..workers)
            .map(|worker| tokio::spawn(worker_loop(backend.ops(), runner.clone(), worker)))
            .collect();
        Self {
            backend,
            workers: Mutex::new(handles),
            closed: AtomicBool::new(false),
        }
    }

    pub fn backend_kind(&self) -> QueueBackendKind {
        self.backend.kind()
    }

    /// Record a new job and return its id without waiting for execution.
    pub async fn enqueue(&self, payload: JobPayload) -> Result<JobId, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let job = Job::new(payload);
        self.backend.ops().push(&job).await?;

        tracing::info!(job_id = %job.id, job_type = %job.job_type, "Job enqueued");
        metrics::counter!("jobs_enqueued_total", "type" => job.job_type.to_string()).increment(1);
        Ok(job.id)
    }

    /// `Unknown` for ids this queue never issued (or whose record expired).
    pub async fn status(&self, id: JobId) -> Result<JobStatus, QueueError> {
        let snapshot = self.backend.ops().snapshot(id).await?;
        Ok(snapshot.map_or(JobStatus::Unknown, |s| s.status))
    }

    /// The outcome, once the job reached `completed` or `failed`.
    pub async fn result(&self, id: JobId) -> Result<Option<JobResult>, QueueError> {
        let snapshot = self.backend.ops().snapshot(id).await?;
        Ok(snapshot
            .filter(|s| s.status.is_terminal())
            .and_then(|s| s.result))
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.backend.ops().load(id).await
    }

    /// Poll until the job finishes or `timeout` elapses. Timing out does not
    /// cancel the job.
    pub async fn wait_for_result(&self, id: JobId, timeout: Duration) -> Result<JobResult, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self
                .backend
                .ops()
                .snapshot(id)
                .await?
                .ok_or(QueueError::JobNotFound(id))?;
            if snapshot.status.is_terminal() {
                if let Some(result) = snapshot.result {
                    return Ok(result);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(QueueError::Timeout {
                    job_id: id,
                    waited: timeout,
                });
            }
            tokio::time::sleep(Duration::from_millis(WAIT_POLL_INTERVAL_MS)).await;
        }
    }

    /// Jobs waiting to be claimed.
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        self.backend.ops().depth().await
    }

    /// Stop the workers. Jobs still pending on the in-process backend are
    /// abandoned; on Redis they stay queued for the next start.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.workers.lock().await.drain(..) {
            handle.abort();
        }
        tracing::info!(backend = ?self.backend_kind(), "Job queue closed");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Timed out after {waited:?} waiting for job {job_id}")]
    Timeout { job_id: JobId, waited: Duration },

    #[error("Job queue is closed")]
    Closed,
}

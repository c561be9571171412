//! Worker-pool task scheduler with bounded retries and a stuck-job sweeper.
//!
//! Jobs are enqueued fire-and-forget onto a flume channel and drained by a
//! fixed pool of worker tasks. Transient failures retry with exponential
//! backoff plus jitter; terminal failures and retry exhaustion mark the job
//! failed and hand the executor a chance to record the failure on the
//! target entity. A background sweeper forces jobs stuck in `Running`
//! beyond a timeout into `Failed` with an explicit timeout message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rand::RngExt;
use tracing::{error, info, warn};

use super::{Job, JobError, JobKind, JobStatus};
use crate::types::JobId;

/// Executes one job kind; implemented by the service layer.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(&self, kind: &JobKind) -> Result<(), JobError>;

    /// Called once when a job lands on `Failed` (terminal error, retry
    /// exhaustion, or sweep); records the failure on the target entity.
    async fn on_failed(&self, kind: &JobKind, message: &str);
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub stuck_job_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            stuck_job_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

type Registry = Arc<RwLock<HashMap<JobId, Job>>>;

pub struct TaskScheduler {
    sender: flume::Sender<JobId>,
    registry: Registry,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("jobs", &self.registry.read().len())
            .finish()
    }
}

impl TaskScheduler {
    /// Spawn the worker pool and sweeper; must run inside a tokio runtime.
    pub fn start(config: SchedulerConfig, executor: Arc<dyn JobExecutor>) -> Self {
        let (sender, receiver) = flume::unbounded::<JobId>();
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));

        for worker in 0..config.workers.max(1) {
            let receiver = receiver.clone();
            let registry = Arc::clone(&registry);
            let executor = Arc::clone(&executor);
            let config = config.clone();
            tokio::spawn(async move {
                while let Ok(job_id) = receiver.recv_async().await {
                    run_job(worker, job_id, &registry, executor.as_ref(), &config).await;
                }
            });
        }

        let sweep_registry = Arc::clone(&registry);
        let sweep_executor = Arc::clone(&executor);
        let stuck_timeout = config.stuck_job_timeout;
        let sweep_interval = config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sweep_stuck_jobs(&sweep_registry, sweep_executor.as_ref(), stuck_timeout).await;
            }
        });

        Self { sender, registry }
    }

    /// Enqueue a job and return its id immediately.
    pub fn enqueue(&self, kind: JobKind) -> JobId {
        let job = Job {
            id: JobId::new(),
            kind,
            status: JobStatus::Queued,
            attempts: 0,
            error: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let id = job.id;
        info!(job = %id, kind = job.kind.label(), "job enqueued");
        self.registry.write().insert(id, job);
        // Send cannot fail while the workers hold the receiver.
        let _ = self.sender.send(id);
        id
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.registry.read().get(&id).cloned()
    }

    /// Poll until the job reaches a terminal status or `timeout` elapses.
    pub async fn wait(&self, id: JobId, timeout: Duration) -> Option<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.job(id) {
                if job.status.is_terminal() {
                    return Some(job);
                }
            } else {
                return None;
            }
            if tokio::time::Instant::now() >= deadline {
                return self.job(id);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn run_job(
    worker: usize,
    job_id: JobId,
    registry: &Registry,
    executor: &dyn JobExecutor,
    config: &SchedulerConfig,
) {
    let Some(kind) = registry.read().get(&job_id).map(|j| j.kind.clone()) else {
        return;
    };

    {
        let mut jobs = registry.write();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        }
    }

    let max_attempts = config.max_retries.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Some(job) = registry.write().get_mut(&job_id) {
            job.attempts = attempt;
        }

        match executor.execute(&kind).await {
            Ok(()) => {
                finish(registry, job_id, JobStatus::Succeeded, None);
                info!(worker, job = %job_id, kind = kind.label(), attempt, "job succeeded");
                return;
            }
            Err(JobError::Transient(message)) if attempt < max_attempts => {
                let delay = backoff_delay(config.retry_base_delay, attempt);
                warn!(
                    worker,
                    job = %job_id,
                    kind = kind.label(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %message,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(JobError::Transient(message)) => {
                error!(worker, job = %job_id, kind = kind.label(), attempt, %message, "retries exhausted");
                let message = format!("retries exhausted after {attempt} attempts: {message}");
                // Record on the entity first so the failure is visible by
                // the time the job reads as terminal.
                executor.on_failed(&kind, &message).await;
                finish(registry, job_id, JobStatus::Failed, Some(message));
                return;
            }
            Err(JobError::Terminal(message)) => {
                error!(worker, job = %job_id, kind = kind.label(), attempt, %message, "job failed");
                executor.on_failed(&kind, &message).await;
                finish(registry, job_id, JobStatus::Failed, Some(message));
                return;
            }
        }
    }
}

fn finish(registry: &Registry, job_id: JobId, status: JobStatus, error: Option<String>) {
    let mut jobs = registry.write();
    if let Some(job) = jobs.get_mut(&job_id) {
        job.status = status;
        job.error = error;
        job.finished_at = Some(Utc::now());
    }
}

/// Exponential backoff with up to 25% jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    let jitter_cap = (exp.as_millis() as u64 / 4).max(1);
    let jitter = rand::rng().random_range(0..jitter_cap);
    exp + Duration::from_millis(jitter)
}

async fn sweep_stuck_jobs(registry: &Registry, executor: &dyn JobExecutor, timeout: Duration) {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::minutes(30));
    let mut swept: Vec<(JobId, JobKind)> = Vec::new();
    {
        let mut jobs = registry.write();
        for job in jobs.values_mut() {
            if job.status == JobStatus::Running
                && job.started_at.is_some_and(|started| started < cutoff)
            {
                job.status = JobStatus::Failed;
                job.error = Some(
                    "processing timeout - job was stuck in running state".to_string(),
                );
                job.finished_at = Some(Utc::now());
                swept.push((job.id, job.kind.clone()));
            }
        }
    }
    for (id, kind) in swept {
        warn!(job = %id, kind = kind.label(), "swept stuck job to failed");
        executor
            .on_failed(&kind, "processing timeout - job was stuck in running state")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyExecutor {
        failures_before_success: u32,
        calls: AtomicU32,
        failed: AtomicU32,
    }

    #[async_trait]
    impl JobExecutor for FlakyExecutor {
        async fn execute(&self, _kind: &JobKind) -> Result<(), JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(JobError::Transient("provider hiccup".into()))
            } else {
                Ok(())
            }
        }

        async fn on_failed(&self, _kind: &JobKind, _message: &str) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            workers: 2,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(5),
            stuck_job_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(600),
        }
    }

    fn sample_kind() -> JobKind {
        JobKind::GenerateSection {
            section_id: crate::types::SectionId::new(),
            instruction: None,
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let executor = Arc::new(FlakyExecutor {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
            failed: AtomicU32::new(0),
        });
        let scheduler = TaskScheduler::start(test_config(), executor.clone());
        let id = scheduler.enqueue(sample_kind());
        let job = scheduler.wait(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 3);
        assert_eq!(executor.failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_failed_and_notify() {
        let executor = Arc::new(FlakyExecutor {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
            failed: AtomicU32::new(0),
        });
        let scheduler = TaskScheduler::start(test_config(), executor.clone());
        let id = scheduler.enqueue(sample_kind());
        let job = scheduler.wait(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.error.as_deref().unwrap().contains("retries exhausted"));
        assert_eq!(executor.failed.load(Ordering::SeqCst), 1);
    }

    struct TerminalExecutor;

    #[async_trait]
    impl JobExecutor for TerminalExecutor {
        async fn execute(&self, _kind: &JobKind) -> Result<(), JobError> {
            Err(JobError::Terminal("unsupported file extension: .bin".into()))
        }

        async fn on_failed(&self, _kind: &JobKind, _message: &str) {}
    }

    #[tokio::test]
    async fn terminal_errors_do_not_retry() {
        let scheduler = TaskScheduler::start(test_config(), Arc::new(TerminalExecutor));
        let id = scheduler.enqueue(sample_kind());
        let job = scheduler.wait(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }
}

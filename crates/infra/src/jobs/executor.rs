//! Worker pool executing queued jobs.
//!
//! Each worker is an independent tokio task that claims one job at a time,
//! runs its handler (through the dependency's circuit breaker and retry
//! policy, under a hard timeout), and settles the job. A supervisor task
//! periodically recovers jobs stuck in `processing`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use bulwark_core::{ErrorKind, UpstreamError};

use crate::cache::{CacheManager, SetOptions};
use crate::quota::{QuotaLedger, UsageSample};
use crate::resilience::{guarded_call, BreakerRegistry, CallError, RetryPolicy};

use super::queue::{JobQueue, QueueError};
use super::registry::{JobHandler, JobOutput};
use super::types::{Job, JobKind};

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// How often an idle worker polls for new jobs
    pub poll_interval: Duration,
    /// Pause after a loop-level (store) error
    pub error_backoff: Duration,
    /// Hard limit on a single handler invocation
    pub handler_timeout: Duration,
    /// How often the supervisor looks for stuck jobs
    pub supervisor_interval: Duration,
    /// Name for logging
    pub name: String,
    /// Optional kind filter
    pub kinds: Option<Vec<JobKind>>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(120),
            supervisor_interval: Duration::from_secs(60),
            name: "job-executor".to_string(),
            kinds: None,
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<JobKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    /// Settlements rejected because the claim had moved on.
    pub claims_lost: u64,
    pub stuck_recovered: u64,
    /// Terminal jobs deleted past the retention window.
    pub jobs_cleaned: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for every task to finish.
    ///
    /// Workers finish the job they are running before exiting.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "executor task panicked");
            }
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Background job executor.
#[derive(Clone)]
pub struct JobExecutor {
    queue: JobQueue,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    cache: Option<Arc<CacheManager>>,
    ledger: Option<Arc<QuotaLedger>>,
    config: JobExecutorConfig,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// How a handler run ended.
enum Outcome {
    Success(JobOutput),
    Failure { error: UpstreamError, retryable: bool },
}

impl JobExecutor {
    pub fn new(queue: JobQueue, breakers: Arc<BreakerRegistry>, config: JobExecutorConfig) -> Self {
        Self {
            queue,
            breakers,
            retry: RetryPolicy::default(),
            cache: None,
            ledger: None,
            config,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Apply handlers' [`CacheWrite`](super::registry::CacheWrite)s to `cache`.
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Record usage of completed caller-attributed jobs in `ledger`.
    pub fn with_ledger(mut self, ledger: Arc<QuotaLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Spawn the worker tasks and the stuck-job supervisor.
    pub fn spawn(self) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.config.workers + 1);

        for n in 0..self.config.workers.max(1) {
            let worker_id = format!("{}-{}", self.config.name, n);
            let executor = self.clone();
            let rx = shutdown_rx.clone();
            let span = tracing::info_span!("worker", worker = %worker_id);
            tasks.push(tokio::spawn(
                async move { executor.worker_loop(worker_id, rx).await }.instrument(span),
            ));
        }

        let supervisor = self.clone();
        tasks.push(tokio::spawn(async move {
            supervisor.supervisor_loop(shutdown_rx).await
        }));

        info!(executor = %self.config.name, workers = self.config.workers, "job executor started");

        JobExecutorHandle {
            shutdown: shutdown_tx,
            tasks,
            stats: self.stats.clone(),
            started: Instant::now(),
        }
    }

    /// Claim and run one job.
    ///
    /// Returns `Ok(false)` when nothing was eligible.
    pub async fn process_next(&self, worker_id: &str) -> Result<bool, QueueError> {
        let Some(job) = self
            .queue
            .claim_next(worker_id, self.config.kinds.as_deref())
            .await?
        else {
            return Ok(false);
        };

        self.update_stats(|s| s.current_running += 1);
        let result = self.execute(&job).await;
        self.update_stats(|s| s.current_running = s.current_running.saturating_sub(1));

        match result {
            Err(QueueError::ClaimLost(id)) => {
                warn!(job_id = %id, worker = worker_id, "claim lost before settling job");
                self.update_stats(|s| s.claims_lost += 1);
                Ok(true)
            }
            Err(e) => Err(e),
            Ok(()) => Ok(true),
        }
    }

    async fn execute(&self, job: &Job) -> Result<(), QueueError> {
        let started = Instant::now();
        let outcome = match self.queue.handlers().get(job.kind) {
            Some(handler) => self.run_handler(handler.as_ref(), job).await,
            None => Outcome::Failure {
                error: UpstreamError::new(
                    ErrorKind::NotFound,
                    format!("no handler registered for job kind {}", job.kind),
                ),
                retryable: false,
            },
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Success(output) => {
                self.queue.complete(job, output.value.clone()).await?;
                self.update_stats(|s| {
                    s.jobs_processed += 1;
                    s.jobs_succeeded += 1;
                });
                self.after_success(job, output, elapsed_ms).await;
            }
            Outcome::Failure { error, retryable } => {
                let failed = self.queue.fail(job, &error, retryable).await?;
                let terminal = failed.status.is_terminal();
                self.update_stats(|s| {
                    s.jobs_processed += 1;
                    if terminal {
                        s.jobs_failed += 1;
                    } else {
                        s.jobs_retried += 1;
                    }
                });
            }
        }
        Ok(())
    }

    async fn run_handler(&self, handler: &dyn JobHandler, job: &Job) -> Outcome {
        let call = async {
            match handler.dependency() {
                Some(dependency) => {
                    let breaker = self.breakers.get(dependency);
                    guarded_call(&breaker, &self.retry, move || handler.handle(&job.payload, job)).await
                }
                None => handler.handle(&job.payload, job).await.map_err(|e| {
                    if e.is_retryable() {
                        CallError::Exhausted { attempts: 1, last: e }
                    } else {
                        CallError::Permanent(e)
                    }
                }),
            }
        };

        match tokio::time::timeout(self.config.handler_timeout, call).await {
            Ok(Ok(output)) => Outcome::Success(output),
            Ok(Err(err)) => {
                let retryable = err.is_transient();
                debug!(job_id = %job.id, kind = %job.kind, error = %err, retryable, "handler failed");
                Outcome::Failure {
                    error: err.into_upstream(),
                    retryable,
                }
            }
            Err(_) => {
                warn!(
                    job_id = %job.id,
                    kind = %job.kind,
                    timeout_ms = self.config.handler_timeout.as_millis() as u64,
                    "handler timed out"
                );
                Outcome::Failure {
                    error: UpstreamError::timeout(format!(
                        "handler exceeded {}ms",
                        self.config.handler_timeout.as_millis()
                    )),
                    retryable: true,
                }
            }
        }
    }

    /// Side effects of a completed job. Failures here never fail the job.
    async fn after_success(&self, job: &Job, output: JobOutput, elapsed_ms: u64) {
        if let (Some(cache), Some(write)) = (&self.cache, output.cache) {
            cache
                .set(&write.key, output.value, write.ttl, SetOptions { tags: write.tags })
                .await;
        }

        if let (Some(ledger), Some(caller)) = (&self.ledger, &job.metadata.caller_id) {
            let sample = UsageSample {
                endpoint: format!("job:{}", job.kind),
                cost: 1,
                success: true,
                response_time_ms: elapsed_ms,
            };
            if let Err(e) = ledger.record_usage(caller, sample).await {
                warn!(job_id = %job.id, caller_id = %caller, error = %e, "failed to record job usage");
            }
        }
    }

    async fn worker_loop(self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %worker_id, "worker started");
        let notify = self.queue.notifier();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next(&worker_id).await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        res = shutdown.changed() => {
                            if res.is_err() {
                                break;
                            }
                        }
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "worker loop error");
                    tokio::select! {
                        res = shutdown.changed() => {
                            if res.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        debug!(worker = %worker_id, "worker stopped");
    }

    async fn supervisor_loop(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.supervisor_interval) => self.supervise().await,
            }
        }
        info!(executor = %self.config.name, "job executor stopped");
    }

    /// One supervisor pass: recover stuck jobs, then apply retention.
    pub async fn supervise(&self) {
        match self.queue.recover_stuck().await {
            Ok(n) => self.update_stats(|s| s.stuck_recovered += n as u64),
            Err(e) => error!(error = %e, "stuck job recovery failed"),
        }
        match self.queue.cleanup().await {
            Ok(n) => self.update_stats(|s| s.jobs_cleaned += n),
            Err(e) => error!(error = %e, "job cleanup failed"),
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut ExecutorStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

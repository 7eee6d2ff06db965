//! Priority job queue over a [`JobStore`].
//!
//! All transitions after enqueue are conditional on the job's
//! [`JobVersion`](super::types::JobVersion) observed at claim time. A worker
//! whose claim was recovered from under it (stuck-job recovery) and re-claimed
//! by someone else gets [`QueueError::ClaimLost`] instead of clobbering the
//! newer state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use bulwark_core::{chrono_duration, ErrorKind, JobId, SharedClock, UpstreamError};

use crate::resilience::exponential_backoff;

use super::registry::HandlerRegistry;
use super::store::{JobStore, JobStoreError};
use super::types::{
    EnqueueOptions, Job, JobFilter, JobKind, JobStats, JobStatus, HIGHEST_PRIORITY, LOWEST_PRIORITY,
};

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub default_priority: u8,
    pub default_max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// A job `processing` for longer than this is presumed crashed.
    pub stuck_threshold: Duration,
    /// Terminal jobs older than this are deleted by cleanup.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_priority: super::types::DEFAULT_PRIORITY,
            default_max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            stuck_threshold: Duration::from_secs(600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("no handler registered for job kind {0}")]
    UnregisteredKind(JobKind),
    #[error("priority {0} is outside {HIGHEST_PRIORITY}..={LOWEST_PRIORITY}")]
    InvalidPriority(u8),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} cannot be cancelled while {status}")]
    NotCancellable { id: JobId, status: JobStatus },
    /// The job moved on since this worker claimed it.
    #[error("claim on job {0} was lost")]
    ClaimLost(JobId),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// The job queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    clock: SharedClock,
    config: QueueConfig,
    job_added: Arc<Notify>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        clock: SharedClock,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            clock,
            config,
            job_added: Arc::new(Notify::new()),
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Signalled once per enqueued job.
    pub fn notifier(&self) -> Arc<Notify> {
        self.job_added.clone()
    }

    /// Enqueue a job.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Job, QueueError> {
        if !self.handlers.contains(kind) {
            return Err(QueueError::UnregisteredKind(kind));
        }
        let priority = opts.priority.unwrap_or(self.config.default_priority);
        if !(HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&priority) {
            return Err(QueueError::InvalidPriority(priority));
        }

        let now = self.clock.now();
        let mut job = Job::new(kind, payload, now);
        job.priority = priority;
        job.max_attempts = opts
            .max_attempts
            .unwrap_or(self.config.default_max_attempts)
            .max(1);
        job.scheduled_at = now + opts.delay.map(chrono_duration).unwrap_or_else(chrono::Duration::zero);
        job.tags = opts.tags;
        job.metadata = opts.metadata;

        self.store.insert(&job).await?;
        self.job_added.notify_one();

        debug!(
            job_id = %job.id,
            kind = %job.kind,
            priority = job.priority,
            scheduled_at = %job.scheduled_at,
            "job enqueued"
        );
        Ok(job)
    }

    /// Claim the next eligible job for `worker_id`.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        kinds: Option<&[JobKind]>,
    ) -> Result<Option<Job>, QueueError> {
        let job = self
            .store
            .claim_next(worker_id, kinds, self.clock.now())
            .await?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, kind = %job.kind, worker = worker_id, attempt = job.attempts, "job claimed");
        }
        Ok(job)
    }

    /// Mark a claimed job completed with `result`.
    pub async fn complete(&self, job: &Job, result: serde_json::Value) -> Result<Job, QueueError> {
        if job.status != JobStatus::Processing {
            return Err(QueueError::ClaimLost(job.id));
        }
        let mut done = job.clone();
        done.mark_completed(result, self.clock.now());
        self.write_if(&done, job).await?;

        info!(
            job_id = %done.id,
            kind = %done.kind,
            attempts = done.attempts,
            processing_time_ms = ?done.processing_time_ms,
            "job completed"
        );
        Ok(done)
    }

    /// Record a failed attempt of a claimed job.
    ///
    /// A retryable failure with attempts left schedules the job again after
    /// `backoff(attempts)`; anything else fails it permanently.
    pub async fn fail(&self, job: &Job, error: &UpstreamError, retryable: bool) -> Result<Job, QueueError> {
        if job.status != JobStatus::Processing {
            return Err(QueueError::ClaimLost(job.id));
        }
        let now = self.clock.now();
        let mut failed = job.clone();

        let has_budget = job.attempts < job.max_attempts;
        if retryable && has_budget {
            let delay = self.backoff(job.attempts);
            failed.mark_failed(error.message.clone(), error.kind, Some(now + chrono_duration(delay)), now);
            self.write_if(&failed, job).await?;
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                error_kind = %error.kind,
                retry_in_ms = delay.as_millis() as u64,
                error = %error.message,
                "job failed, will retry"
            );
        } else {
            let kind = if retryable {
                ErrorKind::AttemptsExhausted
            } else {
                error.kind
            };
            failed.mark_failed(error.message.clone(), kind, None, now);
            self.write_if(&failed, job).await?;
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempts = job.attempts,
                error_kind = %kind,
                error = %error.message,
                "job failed permanently"
            );
        }
        Ok(failed)
    }

    /// Cancel a job that has not been claimed yet.
    pub async fn cancel(&self, id: JobId) -> Result<Job, QueueError> {
        let job = self.store.get(id).await?.ok_or(QueueError::NotFound(id))?;
        if !job.status.is_waiting() {
            return Err(QueueError::NotCancellable {
                id,
                status: job.status,
            });
        }

        let mut cancelled = job.clone();
        cancelled.mark_cancelled(self.clock.now());
        if !self.store.update_if(&cancelled, job.version()).await? {
            // Claimed (or cancelled) concurrently.
            let status = self
                .store
                .get(id)
                .await?
                .map_or(JobStatus::Cancelled, |j| j.status);
            return Err(QueueError::NotCancellable { id, status });
        }

        info!(job_id = %id, kind = %job.kind, "job cancelled");
        Ok(cancelled)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.store.stats().await?)
    }

    /// Whether a job of `kind` is pending, retrying or processing.
    pub async fn has_active(&self, kind: JobKind) -> Result<bool, QueueError> {
        let filter = JobFilter {
            kind: Some(kind),
            statuses: JobStatus::ACTIVE.to_vec(),
            caller_id: None,
            limit: 1,
        };
        Ok(!self.store.list(&filter).await?.is_empty())
    }

    /// Route jobs stuck in `processing` through the failure path.
    ///
    /// Returns how many jobs were recovered.
    pub async fn recover_stuck(&self) -> Result<usize, QueueError> {
        let cutoff = self.clock.now() - chrono_duration(self.config.stuck_threshold);
        let stuck = self.store.find_stuck(cutoff).await?;

        let mut recovered = 0;
        for job in stuck {
            let error = UpstreamError::timeout(format!(
                "job stuck in processing on worker {}",
                job.worker_id.as_deref().unwrap_or("unknown")
            ));
            match self.fail(&job, &error, true).await {
                Ok(_) => recovered += 1,
                Err(QueueError::ClaimLost(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if recovered > 0 {
            warn!(recovered, "recovered stuck jobs");
        }
        Ok(recovered)
    }

    /// Delete terminal jobs older than the retention window.
    pub async fn cleanup(&self) -> Result<u64, QueueError> {
        let cutoff = self.clock.now() - chrono_duration(self.config.retention);
        let deleted = self.store.delete_terminal_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "cleaned up old jobs");
        }
        Ok(deleted)
    }

    /// Retry delay after the given number of attempts.
    pub fn backoff(&self, attempts: u32) -> Duration {
        exponential_backoff(self.config.backoff_base, self.config.backoff_cap, attempts)
    }

    async fn write_if(&self, updated: &Job, claimed: &Job) -> Result<(), QueueError> {
        if self.store.update_if(updated, claimed.version()).await? {
            Ok(())
        } else {
            Err(QueueError::ClaimLost(claimed.id))
        }
    }
}

//! Periodic scheduler for recurring maintenance jobs.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use bulwark_core::chrono_duration;

use super::queue::{JobQueue, QueueError};
use super::types::{EnqueueOptions, JobKind};

/// A job enqueued every `interval`.
#[derive(Debug, Clone)]
pub struct RecurringJob {
    pub kind: JobKind,
    pub interval: Duration,
    pub payload: serde_json::Value,
    pub priority: u8,
}

impl RecurringJob {
    pub fn new(kind: JobKind, interval: Duration) -> Self {
        Self {
            kind,
            interval,
            payload: serde_json::json!({}),
            priority: super::types::LOWEST_PRIORITY,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug)]
struct Entry {
    job: RecurringJob,
    next_due: DateTime<Utc>,
}

/// Enqueues [`RecurringJob`]s when they fall due.
///
/// A recurring job is skipped while a job of the same kind is still pending,
/// retrying or processing, so a slow maintenance job never piles up copies of
/// itself.
#[derive(Debug)]
pub struct Scheduler {
    queue: JobQueue,
    entries: Mutex<Vec<Entry>>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            entries: Mutex::new(Vec::new()),
            tick: Duration::from_secs(1),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Add a recurring job; first due one `interval` from now.
    pub fn every(self, job: RecurringJob) -> Self {
        let next_due = self.queue.clock().now() + chrono_duration(job.interval);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry { job, next_due });
        self
    }

    /// Enqueue every recurring job that is due. Returns the kinds enqueued.
    pub async fn run_due(&self) -> Result<Vec<JobKind>, QueueError> {
        let now = self.queue.clock().now();
        let due: Vec<RecurringJob> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter_mut()
                .filter(|e| e.next_due <= now)
                .map(|e| {
                    e.next_due = now + chrono_duration(e.job.interval);
                    e.job.clone()
                })
                .collect()
        };

        let mut enqueued = Vec::new();
        for job in due {
            if self.queue.has_active(job.kind).await? {
                debug!(kind = %job.kind, "recurring job still active, skipping");
                continue;
            }
            self.queue
                .enqueue(
                    job.kind,
                    job.payload.clone(),
                    EnqueueOptions::default().priority(job.priority).tag("recurring"),
                )
                .await?;
            enqueued.push(job.kind);
        }
        Ok(enqueued)
    }

    /// Run the scheduler until the handle is shut down.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(recurring = self.entries.lock().unwrap_or_else(PoisonError::into_inner).len(), "scheduler started");
            loop {
                tokio::select! {
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.tick) => {
                        if let Err(e) = self.run_due().await {
                            error!(error = %e, "failed to enqueue recurring jobs");
                        }
                    }
                }
            }
            info!("scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to stop a running [`Scheduler`].
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "scheduler task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bulwark_core::ManualClock;

    use crate::jobs::queue::QueueConfig;
    use crate::jobs::registry::{FnHandler, HandlerRegistry, JobOutput};
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::Job;

    fn queue(clock: Arc<ManualClock>) -> JobQueue {
        let handlers = Arc::new(HandlerRegistry::new());
        for kind in [JobKind::JobCleanup, JobKind::Analytics] {
            handlers.register(
                kind,
                Arc::new(FnHandler::new(|_p: serde_json::Value, _j: Job| async move {
                    Ok(JobOutput::new(serde_json::Value::Null))
                })),
            );
        }
        JobQueue::new(InMemoryJobStore::arc(), handlers, clock, QueueConfig::default())
    }

    #[tokio::test]
    async fn enqueues_when_due_and_deduplicates() {
        let clock = ManualClock::starting_now();
        let queue = queue(clock.clone());
        let scheduler = Scheduler::new(queue.clone())
            .every(RecurringJob::new(JobKind::JobCleanup, Duration::from_secs(60)))
            .every(RecurringJob::new(JobKind::Analytics, Duration::from_secs(300)));

        assert!(scheduler.run_due().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(scheduler.run_due().await.unwrap(), vec![JobKind::JobCleanup]);

        // The first cleanup job is still pending.
        clock.advance(chrono::Duration::seconds(60));
        assert!(scheduler.run_due().await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().pending, 1);

        let claimed = queue.claim_next("w", None).await.unwrap().unwrap();
        queue.complete(&claimed, serde_json::Value::Null).await.unwrap();

        clock.advance(chrono::Duration::seconds(180));
        let mut kinds = scheduler.run_due().await.unwrap();
        kinds.sort();
        assert_eq!(kinds, vec![JobKind::JobCleanup, JobKind::Analytics]);
    }
}

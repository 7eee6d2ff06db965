//! Job storage.
//!
//! A [`JobStore`] is the single source of truth for job state. Every state
//! transition after enqueue is a conditional write ([`JobStore::claim_next`],
//! [`JobStore::update_if`]) so that concurrent workers, possibly in different
//! processes, never both act on the same claim.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bulwark_core::JobId;

use super::types::{Job, JobFilter, JobKind, JobStats, JobStatus, JobVersion};

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Persist a newly enqueued job.
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically claim the next eligible job.
    ///
    /// Eligible jobs are ordered by `priority ASC, scheduled_at ASC`; the
    /// winner is moved to `processing` with `attempts` incremented in the same
    /// write. Returns `None` if nothing is eligible.
    async fn claim_next(
        &self,
        worker_id: &str,
        kinds: Option<&[JobKind]>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Replace the stored job iff it still matches `expected`.
    ///
    /// Returns `false` when another writer got there first.
    async fn update_if(&self, job: &Job, expected: JobVersion) -> Result<bool, JobStoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs in `processing` whose claim started before `started_before`.
    async fn find_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Delete terminal jobs last touched before `cutoff`.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("failed to decode stored job: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
///
/// Every mutation happens under one write lock, which makes `claim_next` and
/// `update_if` atomic for all tasks sharing the store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read().get(&id).cloned())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        kinds: Option<&[JobKind]>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write();

        let next = jobs
            .values()
            .filter(|j| j.is_eligible(now) && kinds.map_or(true, |ks| ks.contains(&j.kind)))
            .min_by_key(|j| j.claim_order())
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_claimed(worker_id, now);
                job.clone()
            })
        }))
    }

    async fn update_if(&self, job: &Job, expected: JobVersion) -> Result<bool, JobStoreError> {
        let mut jobs = self.write();
        let stored = jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if stored.version() != expected {
            return Ok(false);
        }
        *stored = job.clone();
        Ok(true)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read();
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(filter.limit);
        Ok(result)
    }

    async fn find_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read();
        let mut stuck: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing && j.started_at.map_or(true, |s| s < started_before)
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.started_at);
        Ok(stuck)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status.is_terminal() && j.updated_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.read();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(kind: JobKind, priority: u8, now: DateTime<Utc>) -> Job {
        let mut job = Job::new(kind, serde_json::json!({}), now);
        job.priority = priority;
        job
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let j = job(JobKind::Scrape, 5, now);
        store.insert(&j).await.unwrap();

        let claimed = store.claim_next("w1", None, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, j.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));

        // No more jobs
        assert!(store.claim_next("w2", None, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::new();
        let j = job(JobKind::Scrape, 5, Utc::now());
        store.insert(&j).await.unwrap();
        assert!(matches!(
            store.insert(&j).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn claims_by_priority_then_schedule_time() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let low = job(JobKind::Scrape, 5, now - Duration::seconds(10));
        let high = job(JobKind::Scrape, 1, now);
        let high_older = job(JobKind::Scrape, 1, now - Duration::seconds(5));
        for j in [&low, &high, &high_older] {
            store.insert(j).await.unwrap();
        }

        let order: Vec<_> = [
            store.claim_next("w", None, now).await.unwrap().unwrap().id,
            store.claim_next("w", None, now).await.unwrap().unwrap().id,
            store.claim_next("w", None, now).await.unwrap().unwrap().id,
        ]
        .to_vec();
        assert_eq!(order, vec![high_older.id, high.id, low.id]);
    }

    #[tokio::test]
    async fn future_jobs_and_kind_filter_are_respected() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        store.insert(&job(JobKind::Scrape, 1, now + Duration::minutes(1))).await.unwrap();
        let cleanup = job(JobKind::JobCleanup, 9, now);
        store.insert(&cleanup).await.unwrap();

        assert!(store
            .claim_next("w", Some(&[JobKind::Scrape]), now)
            .await
            .unwrap()
            .is_none());
        let claimed = store.claim_next("w", None, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, cleanup.id);
    }

    #[tokio::test]
    async fn update_if_rejects_stale_versions() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert(&job(JobKind::Scrape, 5, now)).await.unwrap();

        let claimed = store.claim_next("w1", None, now).await.unwrap().unwrap();
        let version = claimed.version();

        let mut done = claimed.clone();
        done.mark_completed(serde_json::json!(1), now);
        assert!(store.update_if(&done, version).await.unwrap());

        // The same transition again is now stale.
        assert!(!store.update_if(&done, version).await.unwrap());
    }

    #[tokio::test]
    async fn stuck_detection_and_cleanup() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let started = now - Duration::days(9);
        store.insert(&job(JobKind::Scrape, 5, started)).await.unwrap();
        let claimed = store.claim_next("w1", None, started).await.unwrap().unwrap();

        // A fresh claim is not stuck.
        store.insert(&job(JobKind::Scrape, 5, now)).await.unwrap();
        store.claim_next("w2", None, now).await.unwrap().unwrap();

        let stuck = store.find_stuck(now - Duration::minutes(10)).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, claimed.id);

        let mut done = claimed.clone();
        done.mark_completed(serde_json::json!(null), now - Duration::days(8));
        assert!(store.update_if(&done, claimed.version()).await.unwrap());

        assert_eq!(store.delete_terminal_before(now - Duration::days(7)).await.unwrap(), 1);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total(), 1);
        assert_eq!(stats.processing, 1);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        for _ in 0..5 {
            store.insert(&job(JobKind::Scrape, 5, now)).await.unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 5);

        store.claim_next("w", None, now).await.unwrap();
        store.claim_next("w", None, now).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_workers_claim_each_job_once() {
        let store = InMemoryJobStore::arc();
        let now = Utc::now();
        for _ in 0..200 {
            store.insert(&job(JobKind::Scrape, 5, now)).await.unwrap();
        }

        let mut tasks = Vec::new();
        for w in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let worker = format!("w{w}");
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next(&worker, None, now).await.unwrap() {
                    claimed.push(job.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 200);
        assert_eq!(unique.len(), 200);
        assert_eq!(store.stats().await.unwrap().processing, 200);
    }
}

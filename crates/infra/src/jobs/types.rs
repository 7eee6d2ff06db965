//! Core job types.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bulwark_core::{CallerId, CorrelationId, ErrorKind, JobId};

/// Highest priority (claimed first).
pub const HIGHEST_PRIORITY: u8 = 1;
/// Lowest priority (claimed last).
pub const LOWEST_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Job kind, used to route a job to its registered handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fetch one subject from an upstream source.
    Scrape,
    /// Fetch many subjects from an upstream source in one job.
    BatchScrape,
    /// Drain the cache preload queue.
    CacheWarmup,
    /// Delete terminal jobs past the retention window.
    JobCleanup,
    /// Repair drifted concurrency counters in the quota ledger.
    QuotaReconcile,
    /// Snapshot queue/cache/breaker statistics.
    Analytics,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Scrape,
        JobKind::BatchScrape,
        JobKind::CacheWarmup,
        JobKind::JobCleanup,
        JobKind::QuotaReconcile,
        JobKind::Analytics,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Scrape => "scrape",
            JobKind::BatchScrape => "batch_scrape",
            JobKind::CacheWarmup => "cache_warmup",
            JobKind::JobCleanup => "job_cleanup",
            JobKind::QuotaReconcile => "quota_reconcile",
            JobKind::Analytics => "analytics",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("job kind", s))
    }
}

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for `scheduled_at`.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    Completed,
    /// Failed permanently.
    Failed,
    /// Failed, waiting for `next_retry_at`.
    Retrying,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
        JobStatus::Cancelled,
    ];

    /// Statuses a job can still leave (not yet settled).
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Retrying, JobStatus::Processing];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Waiting to be claimed (and therefore cancellable).
    pub fn is_waiting(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("job status", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: {value}")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Who asked for the job and which request it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub caller_id: Option<CallerId>,
    pub correlation_id: Option<CorrelationId>,
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// 1 (highest) to 10 (lowest).
    pub priority: u8,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Claims so far; never exceeds `max_attempts`.
    pub attempts: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<u64>,
    pub tags: Vec<String>,
    pub metadata: JobMetadata,
    /// Worker currently (or last) holding the claim.
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The part of a job's state a conditional write is checked against.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct JobVersion {
    pub status: JobStatus,
    pub attempts: u32,
}

impl Job {
    /// Create a pending job scheduled for `now`.
    pub fn new(kind: JobKind, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            priority: DEFAULT_PRIORITY,
            status: JobStatus::Pending,
            payload,
            result: None,
            error: None,
            error_kind: None,
            attempts: 0,
            max_attempts: 3,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
            processing_time_ms: None,
            tags: Vec::new(),
            metadata: JobMetadata::default(),
            worker_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn version(&self) -> JobVersion {
        JobVersion {
            status: self.status,
            attempts: self.attempts,
        }
    }

    /// Whether a worker may claim this job at `now`.
    ///
    /// A pending job waits for `scheduled_at`; a retrying job waits out its
    /// backoff (`next_retry_at`).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        match self.status {
            JobStatus::Pending => self.scheduled_at <= now,
            JobStatus::Retrying => self.next_retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    /// Ordering key for claiming: priority, then schedule time, then id.
    pub fn claim_order(&self) -> (u8, DateTime<Utc>, JobId) {
        (self.priority, self.scheduled_at, self.id)
    }

    pub fn mark_claimed(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
        self.completed_at = None;
        self.worker_id = Some(worker_id.to_string());
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.error_kind = None;
        self.next_retry_at = None;
        self.completed_at = Some(now);
        self.processing_time_ms = self.started_at.map(|s| (now - s).num_milliseconds().max(0) as u64);
        self.updated_at = now;
    }

    /// Record a failed attempt.
    ///
    /// `retry_at = Some(..)` schedules another attempt; `None` fails the job
    /// permanently.
    pub fn mark_failed(
        &mut self,
        error: String,
        kind: ErrorKind,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.error = Some(error);
        self.error_kind = Some(kind);
        self.processing_time_ms = self.started_at.map(|s| (now - s).num_milliseconds().max(0) as u64);
        self.updated_at = now;
        match retry_at {
            Some(at) => {
                self.status = JobStatus::Retrying;
                self.next_retry_at = Some(at);
            }
            None => {
                self.status = JobStatus::Failed;
                self.next_retry_at = None;
                self.completed_at = Some(now);
            }
        }
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.next_retry_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

/// Options accepted by `JobQueue::enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<u8>,
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub tags: Vec<String>,
    pub metadata: JobMetadata,
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn caller(mut self, caller_id: CallerId) -> Self {
        self.metadata.caller_id = Some(caller_id);
        self
    }

    pub fn correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.metadata.correlation_id = Some(correlation_id);
        self
    }
}

/// Query over stored jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    /// Empty = any status.
    pub statuses: Vec<JobStatus>,
    pub caller_id: Option<CallerId>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            kind: None,
            statuses: Vec::new(),
            caller_id: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.kind.map_or(true, |k| job.kind == k)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self
                .caller_id
                .as_ref()
                .map_or(true, |c| job.metadata.caller_id.as_ref() == Some(c))
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retrying: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Retrying => &mut self.retrying,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.retrying + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn job_lifecycle() {
        let now = Utc::now();
        let mut job = Job::new(JobKind::Scrape, serde_json::json!({"subject": "a"}), now);
        assert!(job.is_eligible(now));

        job.mark_claimed("w1", now);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert!(!job.is_eligible(now));

        let done = now + ChronoDuration::milliseconds(250);
        job.mark_completed(serde_json::json!({"ok": true}), done);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processing_time_ms, Some(250));
        assert!(job.status.is_terminal());
    }

    #[test]
    fn retrying_job_waits_for_its_backoff() {
        let now = Utc::now();
        let mut job = Job::new(JobKind::Scrape, serde_json::json!({}), now);
        job.mark_claimed("w1", now);
        let retry_at = now + ChronoDuration::seconds(2);
        job.mark_failed("reset".into(), ErrorKind::Network, Some(retry_at), now);

        assert_eq!(job.status, JobStatus::Retrying);
        assert!(!job.is_eligible(now + ChronoDuration::seconds(1)));
        assert!(job.is_eligible(retry_at));
    }

    #[test]
    fn exhausted_job_is_never_eligible() {
        let now = Utc::now();
        let mut job = Job::new(JobKind::Scrape, serde_json::json!({}), now);
        job.max_attempts = 1;
        job.mark_claimed("w1", now);
        job.status = JobStatus::Retrying;
        assert!(!job.is_eligible(now + ChronoDuration::hours(1)));
    }

    #[test]
    fn kinds_and_statuses_parse_from_their_names() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<JobKind>().is_err());
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_value(JobKind::BatchScrape).unwrap();
        assert_eq!(json, serde_json::json!("batch_scrape"));
        let json = serde_json::to_value(JobStatus::Retrying).unwrap();
        assert_eq!(json, serde_json::json!("retrying"));
    }

    #[test]
    fn filter_matches_on_kind_status_and_caller() {
        let now = Utc::now();
        let mut job = Job::new(JobKind::Scrape, serde_json::json!({}), now);
        job.metadata.caller_id = Some(CallerId::new("c1"));

        let filter = JobFilter {
            kind: Some(JobKind::Scrape),
            statuses: vec![JobStatus::Pending],
            caller_id: Some(CallerId::new("c1")),
            limit: 10,
        };
        assert!(filter.matches(&job));

        let other = JobFilter {
            caller_id: Some(CallerId::new("c2")),
            ..filter
        };
        assert!(!other.matches(&job));
    }
}

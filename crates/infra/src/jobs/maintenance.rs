//! Built-in handlers for the recurring maintenance kinds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use bulwark_core::{ErrorKind, UpstreamError};

use crate::cache::{CacheError, CacheManager};
use crate::quota::QuotaLedger;
use crate::resilience::BreakerRegistry;

use super::queue::JobQueue;
use super::registry::{HandlerRegistry, JobHandler, JobOutput};
use super::scheduler::RecurringJob;
use super::types::{Job, JobKind};

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, UpstreamError> {
    serde_json::to_value(value).map_err(|e| UpstreamError::parsing(e.to_string()))
}

fn internal(e: impl std::fmt::Display) -> UpstreamError {
    UpstreamError::new(ErrorKind::Server, e.to_string())
}

/// Deletes terminal jobs past the retention window.
#[derive(Debug, Clone)]
pub struct JobCleanupHandler {
    queue: JobQueue,
}

#[async_trait]
impl JobHandler for JobCleanupHandler {
    async fn handle(&self, _payload: &serde_json::Value, _job: &Job) -> Result<JobOutput, UpstreamError> {
        let deleted = self.queue.cleanup().await.map_err(internal)?;
        Ok(JobOutput::new(serde_json::json!({ "deleted": deleted })))
    }
}

/// Resets concurrency counters of callers that have gone quiet.
#[derive(Debug, Clone)]
pub struct QuotaReconcileHandler {
    ledger: Arc<QuotaLedger>,
}

#[async_trait]
impl JobHandler for QuotaReconcileHandler {
    async fn handle(&self, _payload: &serde_json::Value, _job: &Job) -> Result<JobOutput, UpstreamError> {
        let reset = self.ledger.reconcile_concurrency().await.map_err(internal)?;
        Ok(JobOutput::new(serde_json::json!({ "reset": reset })))
    }
}

/// Drains one batch of the cache preload queue.
#[derive(Debug, Clone)]
pub struct CacheWarmupHandler {
    cache: Arc<CacheManager>,
}

#[async_trait]
impl JobHandler for CacheWarmupHandler {
    async fn handle(&self, _payload: &serde_json::Value, _job: &Job) -> Result<JobOutput, UpstreamError> {
        let report = self.cache.warm_queued().await.map_err(|e| match e {
            CacheError::NoFetcher => UpstreamError::not_found(e.to_string()),
            other => internal(other),
        })?;
        Ok(JobOutput::new(to_json(&report)?))
    }
}

/// Point-in-time statistics of the queue, cache and breakers.
#[derive(Debug, Clone)]
pub struct AnalyticsHandler {
    queue: JobQueue,
    cache: Option<Arc<CacheManager>>,
    breakers: Arc<BreakerRegistry>,
}

#[async_trait]
impl JobHandler for AnalyticsHandler {
    async fn handle(&self, _payload: &serde_json::Value, _job: &Job) -> Result<JobOutput, UpstreamError> {
        let jobs = self.queue.stats().await.map_err(internal)?;
        let cache = self.cache.as_ref().map(|c| c.stats());
        let breakers = self.breakers.snapshot();

        info!(
            pending = jobs.pending,
            processing = jobs.processing,
            failed = jobs.failed,
            cache_local_hits = cache.as_ref().map(|c| c.local_hits),
            cache_misses = cache.as_ref().map(|c| c.misses),
            open_breakers = breakers
                .iter()
                .filter(|b| b.state == crate::resilience::BreakerState::Open)
                .count(),
            "analytics snapshot"
        );

        Ok(JobOutput::new(serde_json::json!({
            "jobs": to_json(&jobs)?,
            "cache": to_json(&cache)?,
            "breakers": to_json(&breakers)?,
        })))
    }
}

/// Register the maintenance handlers whose collaborators are available.
///
/// `CacheWarmup` needs a cache and `QuotaReconcile` a ledger; the other two
/// are always registered.
pub fn register_maintenance_handlers(
    registry: &HandlerRegistry,
    queue: &JobQueue,
    breakers: Arc<BreakerRegistry>,
    ledger: Option<Arc<QuotaLedger>>,
    cache: Option<Arc<CacheManager>>,
) {
    registry.register(
        JobKind::JobCleanup,
        Arc::new(JobCleanupHandler {
            queue: queue.clone(),
        }),
    );
    registry.register(
        JobKind::Analytics,
        Arc::new(AnalyticsHandler {
            queue: queue.clone(),
            cache: cache.clone(),
            breakers,
        }),
    );
    if let Some(ledger) = ledger {
        registry.register(JobKind::QuotaReconcile, Arc::new(QuotaReconcileHandler { ledger }));
    }
    if let Some(cache) = cache {
        registry.register(JobKind::CacheWarmup, Arc::new(CacheWarmupHandler { cache }));
    }
}

/// How often each maintenance job recurs.
#[derive(Debug, Clone)]
pub struct MaintenanceIntervals {
    pub cache_warmup: Duration,
    pub job_cleanup: Duration,
    pub quota_reconcile: Duration,
    pub analytics: Duration,
}

impl Default for MaintenanceIntervals {
    fn default() -> Self {
        Self {
            cache_warmup: Duration::from_secs(5 * 60),
            job_cleanup: Duration::from_secs(60 * 60),
            quota_reconcile: Duration::from_secs(10 * 60),
            analytics: Duration::from_secs(15 * 60),
        }
    }
}

impl MaintenanceIntervals {
    /// Recurring jobs for every maintenance kind registered in `registry`.
    pub fn recurring_jobs(&self, registry: &HandlerRegistry) -> Vec<RecurringJob> {
        [
            (JobKind::CacheWarmup, self.cache_warmup),
            (JobKind::JobCleanup, self.job_cleanup),
            (JobKind::QuotaReconcile, self.quota_reconcile),
            (JobKind::Analytics, self.analytics),
        ]
        .into_iter()
        .filter(|(kind, _)| registry.contains(*kind))
        .map(|(kind, interval)| RecurringJob::new(kind, interval))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{CallerId, ManualClock, SharedClock};

    use crate::cache::{CacheConfig, PreloadPriority, PreloadSpec, TierFlags};
    use crate::jobs::queue::QueueConfig;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::EnqueueOptions;
    use crate::quota::{InMemoryQuotaStore, LedgerConfig, TierTable};
    use crate::resilience::BreakerConfig;

    struct Fixture {
        registry: Arc<HandlerRegistry>,
        queue: JobQueue,
        ledger: Arc<QuotaLedger>,
        cache: Arc<CacheManager>,
    }

    fn fixture(clock: SharedClock) -> Fixture {
        let registry = Arc::new(HandlerRegistry::new());
        let queue = JobQueue::new(
            InMemoryJobStore::arc(),
            registry.clone(),
            clock.clone(),
            QueueConfig::default(),
        );
        let ledger = Arc::new(QuotaLedger::new(
            Arc::new(InMemoryQuotaStore::new()),
            TierTable::default(),
            clock.clone(),
            LedgerConfig::default(),
        ));
        let cache = Arc::new(CacheManager::new(
            CacheConfig {
                warm_throttle: Duration::ZERO,
                ..CacheConfig::default()
            },
            clock.clone(),
        ));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default(), clock));
        register_maintenance_handlers(
            &registry,
            &queue,
            breakers,
            Some(ledger.clone()),
            Some(cache.clone()),
        );
        Fixture {
            registry,
            queue,
            ledger,
            cache,
        }
    }

    async fn run(fx: &Fixture, kind: JobKind) -> Result<JobOutput, UpstreamError> {
        let job = fx
            .queue
            .enqueue(kind, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let handler = fx.registry.get(kind).unwrap();
        handler.handle(&job.payload, &job).await
    }

    struct EchoFetcher;

    #[async_trait]
    impl crate::cache::Fetcher for EchoFetcher {
        async fn fetch(&self, key: &str) -> Result<serde_json::Value, UpstreamError> {
            Ok(serde_json::json!(key))
        }
    }

    #[tokio::test]
    async fn every_maintenance_kind_is_scheduled() {
        let fx = fixture(ManualClock::starting_now());
        let kinds: Vec<JobKind> = MaintenanceIntervals::default()
            .recurring_jobs(&fx.registry)
            .into_iter()
            .map(|j| j.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                JobKind::CacheWarmup,
                JobKind::JobCleanup,
                JobKind::QuotaReconcile,
                JobKind::Analytics
            ]
        );
    }

    #[tokio::test]
    async fn warmup_drains_preload_queue() {
        let fx = fixture(ManualClock::starting_now());
        fx.cache
            .preload(PreloadSpec {
                platforms: vec!["github".into()],
                identifiers: vec!["alice".into(), "bob".into()],
                priority: PreloadPriority::Low,
            })
            .await
            .unwrap();

        let err = run(&fx, JobKind::CacheWarmup).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        fx.cache.set_fetcher(Arc::new(EchoFetcher));
        let output = run(&fx, JobKind::CacheWarmup).await.unwrap();
        assert_eq!(output.value["success"], 2);
        assert!(fx.cache.get("github:bob", TierFlags::ALL).await.is_some());
    }

    #[tokio::test]
    async fn reconcile_resets_idle_slots() {
        let clock = ManualClock::starting_now();
        let fx = fixture(clock.clone());
        let caller = CallerId::new("idle");
        assert!(fx.ledger.check_admission(&caller).await.allowed);

        clock.advance(chrono::Duration::minutes(30));
        let output = run(&fx, JobKind::QuotaReconcile).await.unwrap();
        assert_eq!(output.value["reset"], 1);
    }

    #[tokio::test]
    async fn analytics_reports_queue_and_cache() {
        let fx = fixture(ManualClock::starting_now());
        let output = run(&fx, JobKind::Analytics).await.unwrap();
        assert_eq!(output.value["jobs"]["pending"], 1);
        assert_eq!(output.value["cache"]["misses"], 0);
        assert!(output.value["breakers"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_reports_deleted_count() {
        let fx = fixture(ManualClock::starting_now());
        let output = run(&fx, JobKind::JobCleanup).await.unwrap();
        assert_eq!(output.value["deleted"], 0);
    }
}

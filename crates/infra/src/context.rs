//! Application context: one owner for every shared component.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use bulwark_core::{SharedClock, SystemClock};

use crate::cache::CacheManager;
use crate::config::BulwarkConfig;
use crate::jobs::{
    register_maintenance_handlers, HandlerRegistry, InMemoryJobStore, JobExecutor, JobHandler, JobKind, JobQueue,
    JobStore, JobStoreError, PostgresJobStore, Scheduler,
};
use crate::quota::{
    InMemoryQuotaStore, InMemoryWindowCounter, PostgresQuotaStore, QuotaLedger, QuotaStore, QuotaStoreError,
    WindowCounter,
};
use crate::resilience::BreakerRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("persistent stores requested but DATABASE_URL is not set")]
    MissingDatabaseUrl,
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job store migration failed: {0}")]
    JobStore(#[from] JobStoreError),
    #[error("quota store migration failed: {0}")]
    QuotaStore(#[from] QuotaStoreError),
    #[error("redis connection failed: {0}")]
    Redis(String),
}

/// Owns the queue, ledger, cache, breakers and clock.
///
/// Cloning is cheap; every component is behind an `Arc`.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: Arc<BulwarkConfig>,
    pub clock: SharedClock,
    pub handlers: Arc<HandlerRegistry>,
    pub queue: JobQueue,
    pub ledger: Arc<QuotaLedger>,
    pub cache: Arc<CacheManager>,
    pub breakers: Arc<BreakerRegistry>,
}

struct Parts {
    jobs: Arc<dyn JobStore>,
    quotas: Arc<dyn QuotaStore>,
    counter: Arc<dyn WindowCounter>,
    cache: CacheManager,
}

impl AppContext {
    /// Everything in process memory, on the system clock.
    pub fn in_memory(config: BulwarkConfig) -> Self {
        Self::in_memory_with_clock(config, SystemClock::shared())
    }

    pub fn in_memory_with_clock(config: BulwarkConfig, clock: SharedClock) -> Self {
        let parts = Parts {
            jobs: InMemoryJobStore::arc(),
            quotas: Arc::new(InMemoryQuotaStore::new()),
            counter: Arc::new(InMemoryWindowCounter::new(clock.clone())),
            cache: CacheManager::new(config.cache.clone(), clock.clone()),
        };
        Self::assemble(config, clock, parts)
    }

    /// Postgres-backed job and quota stores; Redis counters and shared cache
    /// tier when `REDIS_URL` is set and the `redis` feature is enabled.
    pub async fn connect(config: BulwarkConfig) -> Result<Self, ContextError> {
        let clock = SystemClock::shared();
        let url = config
            .database_url
            .as_deref()
            .ok_or(ContextError::MissingDatabaseUrl)?;
        let pool = PgPool::connect(url).await?;

        let jobs = PostgresJobStore::new(pool.clone());
        jobs.migrate().await?;
        let quotas = PostgresQuotaStore::new(pool);
        quotas.migrate().await?;
        info!("postgres stores ready");

        #[cfg_attr(not(feature = "redis"), allow(unused_mut))]
        let mut parts = Parts {
            jobs: Arc::new(jobs),
            quotas: Arc::new(quotas),
            counter: Arc::new(InMemoryWindowCounter::new(clock.clone())),
            cache: CacheManager::new(config.cache.clone(), clock.clone()),
        };

        match config.redis_url.as_deref() {
            #[cfg(feature = "redis")]
            Some(redis_url) => {
                let conn = crate::redis_conn::RedisConnection::open(redis_url)
                    .map_err(|e| ContextError::Redis(e.to_string()))?;
                parts.counter = Arc::new(crate::quota::RedisWindowCounter::new(conn.clone()));
                parts.cache = parts
                    .cache
                    .with_shared(Arc::new(crate::cache::RedisSharedTier::new(conn)));
                info!("redis counters and shared cache tier enabled");
            }
            #[cfg(not(feature = "redis"))]
            Some(_) => {
                warn!("REDIS_URL set but redis feature not enabled; counters and cache stay in process");
            }
            None => {
                warn!("REDIS_URL not set; counters and cache stay in process");
            }
        }

        Ok(Self::assemble(config, clock, parts))
    }

    fn assemble(config: BulwarkConfig, clock: SharedClock, parts: Parts) -> Self {
        let handlers = Arc::new(HandlerRegistry::new());
        let queue = JobQueue::new(parts.jobs, handlers.clone(), clock.clone(), config.queue.clone());
        let ledger = Arc::new(
            QuotaLedger::new(parts.quotas, config.tiers.clone(), clock.clone(), config.ledger.clone())
                .with_counter(parts.counter),
        );
        let cache = Arc::new(parts.cache);
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone(), clock.clone()));

        register_maintenance_handlers(
            &handlers,
            &queue,
            breakers.clone(),
            Some(ledger.clone()),
            Some(cache.clone()),
        );

        Self {
            config: Arc::new(config),
            clock,
            handlers,
            queue,
            ledger,
            cache,
            breakers,
        }
    }

    pub fn register_handler(&self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.register(kind, handler);
    }

    /// Worker pool wired to this context's cache and ledger.
    pub fn executor(&self) -> JobExecutor {
        JobExecutor::new(self.queue.clone(), self.breakers.clone(), self.config.executor.clone())
            .with_retry_policy(self.config.retry.clone())
            .with_cache(self.cache.clone())
            .with_ledger(self.ledger.clone())
    }

    /// Scheduler for every registered maintenance kind.
    pub fn scheduler(&self) -> Scheduler {
        self.config
            .maintenance
            .recurring_jobs(&self.handlers)
            .into_iter()
            .fold(Scheduler::new(self.queue.clone()), Scheduler::every)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_context_registers_maintenance() {
        let ctx = AppContext::in_memory(BulwarkConfig::default());
        assert_eq!(
            ctx.handlers.kinds(),
            vec![
                JobKind::CacheWarmup,
                JobKind::JobCleanup,
                JobKind::QuotaReconcile,
                JobKind::Analytics
            ]
        );
        assert!(ctx.cache.shared_state().is_none());
    }
}

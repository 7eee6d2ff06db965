//! Environment-driven configuration.
//!
//! Every setting has a default, so an empty environment yields a working
//! in-memory deployment. Durations are read from variables whose suffix names
//! the unit (`_MS`, `_SECS`, `_DAYS`).

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::jobs::{JobExecutorConfig, MaintenanceIntervals, QueueConfig, HIGHEST_PRIORITY, LOWEST_PRIORITY};
use crate::quota::{LedgerConfig, Tier, TierTable};
use crate::resilience::{BreakerConfig, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct BulwarkConfig {
    pub bind_addr: String,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub queue: QueueConfig,
    pub executor: JobExecutorConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub ledger: LedgerConfig,
    pub tiers: TierTable,
    pub maintenance: MaintenanceIntervals,
}

impl Default for BulwarkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            use_persistent_stores: false,
            database_url: None,
            redis_url: None,
            queue: QueueConfig::default(),
            executor: JobExecutorConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            ledger: LedgerConfig::default(),
            tiers: TierTable::default(),
            maintenance: MaintenanceIntervals::default(),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(_) => self.parse::<u64>(key, 0).map(Duration::from_millis),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(_) => self.parse::<u64>(key, 0).map(Duration::from_secs),
        }
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: v,
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }
}

fn invalid(key: &str, value: impl Display, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl BulwarkConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let d = BulwarkConfig::default();

        let queue = QueueConfig {
            default_priority: env.parse("BULWARK_DEFAULT_PRIORITY", d.queue.default_priority)?,
            default_max_attempts: env.parse("BULWARK_MAX_ATTEMPTS", d.queue.default_max_attempts)?,
            backoff_base: env.millis("BULWARK_BACKOFF_BASE_MS", d.queue.backoff_base)?,
            backoff_cap: env.secs("BULWARK_BACKOFF_CAP_SECS", d.queue.backoff_cap)?,
            stuck_threshold: env.secs("BULWARK_STUCK_THRESHOLD_SECS", d.queue.stuck_threshold)?,
            retention: Duration::from_secs(
                env.parse::<u64>("BULWARK_JOB_RETENTION_DAYS", d.queue.retention.as_secs() / 86_400)?
                    .saturating_mul(86_400),
            ),
        };
        if !(HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&queue.default_priority) {
            return Err(invalid(
                "BULWARK_DEFAULT_PRIORITY",
                queue.default_priority,
                "priority must be between 1 and 10",
            ));
        }
        if queue.default_max_attempts == 0 {
            return Err(invalid("BULWARK_MAX_ATTEMPTS", 0, "at least one attempt is required"));
        }

        let workers: usize = env.parse("BULWARK_WORKERS", d.executor.workers)?;
        if workers == 0 {
            return Err(invalid("BULWARK_WORKERS", 0, "at least one worker is required"));
        }
        let executor = JobExecutorConfig {
            workers,
            poll_interval: env.millis("BULWARK_POLL_INTERVAL_MS", d.executor.poll_interval)?,
            error_backoff: env.millis("BULWARK_ERROR_BACKOFF_MS", d.executor.error_backoff)?,
            handler_timeout: env.secs("BULWARK_HANDLER_TIMEOUT_SECS", d.executor.handler_timeout)?,
            supervisor_interval: env.secs("BULWARK_SUPERVISOR_INTERVAL_SECS", d.executor.supervisor_interval)?,
            ..d.executor
        };

        let breaker = BreakerConfig {
            failure_threshold: env.parse("BULWARK_BREAKER_FAILURE_THRESHOLD", d.breaker.failure_threshold)?,
            reset_timeout: env.secs("BULWARK_BREAKER_RESET_SECS", d.breaker.reset_timeout)?,
        };

        let jitter: f64 = env.parse("BULWARK_RETRY_JITTER", d.retry.jitter)?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(invalid("BULWARK_RETRY_JITTER", jitter, "jitter must be between 0 and 1"));
        }
        let retry = RetryPolicy {
            max_retries: env.parse("BULWARK_RETRY_MAX", d.retry.max_retries)?,
            base_delay: env.millis("BULWARK_RETRY_BASE_MS", d.retry.base_delay)?,
            max_delay: env.millis("BULWARK_RETRY_CAP_MS", d.retry.max_delay)?,
            jitter,
        };

        let cache = CacheConfig {
            local_capacity: env.parse("BULWARK_CACHE_LOCAL_CAPACITY", d.cache.local_capacity)?,
            local_promotion_ttl: env.secs("BULWARK_CACHE_PROMOTION_TTL_SECS", d.cache.local_promotion_ttl)?,
            default_ttl: env.secs("BULWARK_CACHE_TTL_SECS", d.cache.default_ttl)?,
            warm_throttle: env.millis("BULWARK_WARM_THROTTLE_MS", d.cache.warm_throttle)?,
            warm_batch: env.parse("BULWARK_WARM_BATCH", d.cache.warm_batch)?,
            reconnect_after: env.secs("BULWARK_SHARED_RECONNECT_SECS", d.cache.reconnect_after)?,
        };

        let ledger = LedgerConfig {
            default_tier: env.parse("BULWARK_DEFAULT_TIER", d.ledger.default_tier)?,
            usage_history_cap: env.parse("BULWARK_USAGE_HISTORY_CAP", d.ledger.usage_history_cap)?,
            counter_degrade: env.parse("BULWARK_COUNTER_DEGRADE", d.ledger.counter_degrade)?,
            store_degrade: env.parse("BULWARK_STORE_DEGRADE", d.ledger.store_degrade)?,
            stale_slot_after: env.secs("BULWARK_STALE_SLOT_SECS", d.ledger.stale_slot_after)?,
        };

        let mut tiers = d.tiers.clone();
        for tier in [Tier::Free, Tier::Basic, Tier::Premium, Tier::Enterprise] {
            let prefix = format!("BULWARK_TIER_{}", tier.as_str().to_ascii_uppercase());
            let limits = tiers.limits_mut(tier);
            limits.daily = env.parse(&format!("{prefix}_DAILY"), limits.daily)?;
            limits.monthly = env.parse(&format!("{prefix}_MONTHLY"), limits.monthly)?;
            limits.concurrent = env.parse(&format!("{prefix}_CONCURRENT"), limits.concurrent)?;
            limits.per_minute = env.parse(&format!("{prefix}_PER_MINUTE"), limits.per_minute)?;
            limits.per_hour = env.parse(&format!("{prefix}_PER_HOUR"), limits.per_hour)?;
        }

        let maintenance = MaintenanceIntervals {
            cache_warmup: env.secs("BULWARK_CACHE_WARMUP_EVERY_SECS", d.maintenance.cache_warmup)?,
            job_cleanup: env.secs("BULWARK_JOB_CLEANUP_EVERY_SECS", d.maintenance.job_cleanup)?,
            quota_reconcile: env.secs("BULWARK_QUOTA_RECONCILE_EVERY_SECS", d.maintenance.quota_reconcile)?,
            analytics: env.secs("BULWARK_ANALYTICS_EVERY_SECS", d.maintenance.analytics)?,
        };

        let use_persistent_stores = env.bool("USE_PERSISTENT_STORES", d.use_persistent_stores)?;
        let database_url = env.raw("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(Self {
            bind_addr: env.raw("BIND_ADDR").unwrap_or(d.bind_addr),
            use_persistent_stores,
            database_url,
            redis_url: env.raw("REDIS_URL"),
            queue,
            executor,
            breaker,
            retry,
            cache,
            ledger,
            tiers,
            maintenance,
        })
    }
}

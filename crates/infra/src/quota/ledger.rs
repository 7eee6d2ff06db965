//! Per-caller quota and rate-limit enforcement.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use bulwark_core::{chrono_duration, CallerId, SharedClock};

use crate::resilience::DegradeTo;

use super::counter::WindowCounter;
use super::store::{QuotaStore, QuotaStoreError};
use super::types::{
    Admission, Block, DenyReason, QuotaRecord, QuotaSummary, Tier, TierTable, UsageSample,
};

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Tier assigned to callers seen for the first time.
    pub default_tier: Tier,
    pub usage_history_cap: usize,
    /// Policy when the short-window counter store is unreachable.
    pub counter_degrade: DegradeTo,
    /// Policy when the durable quota store is unreachable during admission.
    pub store_degrade: DegradeTo,
    /// A caller idle this long holds no real in-flight requests.
    pub stale_slot_after: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_tier: Tier::Free,
            usage_history_cap: 1000,
            counter_degrade: DegradeTo::Allow,
            store_degrade: DegradeTo::Allow,
            stale_slot_after: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QuotaError {
    #[error(transparent)]
    Store(#[from] QuotaStoreError),
}

/// The quota ledger.
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    counter: Option<Arc<dyn WindowCounter>>,
    tiers: TierTable,
    clock: SharedClock,
    config: LedgerConfig,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, tiers: TierTable, clock: SharedClock, config: LedgerConfig) -> Self {
        Self {
            store,
            counter: None,
            tiers,
            clock,
            config,
        }
    }

    /// Enable per-minute / per-hour limits backed by `counter`.
    pub fn with_counter(mut self, counter: Arc<dyn WindowCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    fn fresh_record(&self, caller: &CallerId, now: DateTime<Utc>) -> QuotaRecord {
        let tier = self.config.default_tier;
        QuotaRecord::new(caller.clone(), tier, self.tiers.limits(tier), now)
    }

    /// Decide whether `caller` may start a request now.
    ///
    /// On success a concurrency slot is reserved (`slot_reserved`) and must be
    /// released with [`complete_request`](Self::complete_request).
    pub async fn check_admission(&self, caller: &CallerId) -> Admission {
        let now = self.clock.now();
        let result = self
            .store
            .upsert_with(
                caller,
                self.fresh_record(caller, now),
                Box::new(move |r: &mut QuotaRecord| {
                    r.roll_windows(now);
                    r.clear_expired_block(now);
                    r.last_activity = now;
                    if r.block.is_some() {
                        return Some(DenyReason::Blocked);
                    }
                    if r.daily.is_exhausted() {
                        return Some(DenyReason::DailyQuotaExceeded);
                    }
                    if r.monthly.is_exhausted() {
                        return Some(DenyReason::MonthlyQuotaExceeded);
                    }
                    if r.concurrent.current >= r.concurrent.limit {
                        return Some(DenyReason::ConcurrencyLimitExceeded);
                    }
                    r.concurrent.current += 1;
                    None
                }),
            )
            .await;

        let (record, verdict) = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    caller_id = %caller,
                    error = %e,
                    policy = ?self.config.store_degrade,
                    "quota store unavailable during admission"
                );
                return match self.config.store_degrade {
                    DegradeTo::Allow => Admission::degraded_allow(),
                    DegradeTo::Deny => Admission::denied(DenyReason::QuotaUnavailable, QuotaSummary::default()),
                };
            }
        };

        let quotas = record.summary();
        if let Some(reason) = verdict {
            let mut admission = Admission::denied(reason, quotas);
            match reason {
                DenyReason::Blocked => admission.block_until = record.block.as_ref().map(|b| b.until),
                DenyReason::DailyQuotaExceeded => admission.reset_at = Some(record.daily.reset_at),
                DenyReason::MonthlyQuotaExceeded => admission.reset_at = Some(record.monthly.reset_at),
                _ => {}
            }
            info!(caller_id = %caller, reason = %reason, "admission denied");
            return admission;
        }

        if let Some(denial) = self.check_short_windows(caller, &record, now).await {
            self.release_slot(caller).await;
            return denial;
        }

        debug!(caller_id = %caller, concurrent = record.concurrent.current, "admitted");
        Admission {
            allowed: true,
            reason: None,
            quotas,
            reset_at: Some(record.daily.reset_at),
            block_until: None,
            slot_reserved: true,
        }
    }

    async fn check_short_windows(
        &self,
        caller: &CallerId,
        record: &QuotaRecord,
        now: DateTime<Utc>,
    ) -> Option<Admission> {
        let counter = self.counter.as_ref()?;
        let limits = self.tiers.limits(record.tier);
        let windows = [
            ("minute", 60i64, limits.per_minute, DenyReason::MinuteRateExceeded),
            ("hour", 3600i64, limits.per_hour, DenyReason::HourRateExceeded),
        ];

        for (name, secs, limit, reason) in windows {
            let bucket = now.timestamp().div_euclid(secs);
            let key = format!("quota:{caller}:{name}:{bucket}");
            match counter.incr(&key, Duration::from_secs(secs as u64)).await {
                Ok(count) if count > limit => {
                    info!(caller_id = %caller, window = name, count, limit, "rate limit exceeded");
                    let mut admission = Admission::denied(reason, record.summary());
                    admission.reset_at = Utc.timestamp_opt((bucket + 1) * secs, 0).single();
                    return Some(admission);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        caller_id = %caller,
                        error = %e,
                        policy = ?self.config.counter_degrade,
                        "rate counter unavailable"
                    );
                    return match self.config.counter_degrade {
                        DegradeTo::Allow => None,
                        DegradeTo::Deny => Some(Admission::denied(DenyReason::QuotaUnavailable, record.summary())),
                    };
                }
            }
        }
        None
    }

    async fn release_slot(&self, caller: &CallerId) {
        if let Err(e) = self.complete_request(caller).await {
            warn!(caller_id = %caller, error = %e, "failed to release concurrency slot");
        }
    }

    /// Charge a unit of work to `caller`.
    pub async fn record_usage(&self, caller: &CallerId, sample: UsageSample) -> Result<QuotaRecord, QuotaError> {
        let now = self.clock.now();
        let cap = self.config.usage_history_cap;
        let (record, _) = self
            .store
            .upsert_with(
                caller,
                self.fresh_record(caller, now),
                Box::new(move |r: &mut QuotaRecord| {
                    r.roll_windows(now);
                    r.push_usage(sample, now, cap);
                    None
                }),
            )
            .await?;
        debug!(
            caller_id = %caller,
            daily_used = record.daily.used,
            monthly_used = record.monthly.used,
            "usage recorded"
        );
        Ok(record)
    }

    /// Release the concurrency slot reserved by a successful admission.
    pub async fn complete_request(&self, caller: &CallerId) -> Result<(), QuotaError> {
        let now = self.clock.now();
        self.store
            .upsert_with(
                caller,
                self.fresh_record(caller, now),
                Box::new(move |r: &mut QuotaRecord| {
                    r.concurrent.current = r.concurrent.current.saturating_sub(1);
                    r.last_activity = now;
                    None
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn upgrade_tier(&self, caller: &CallerId, tier: Tier) -> Result<QuotaRecord, QuotaError> {
        let now = self.clock.now();
        let limits = self.tiers.limits(tier);
        let (record, _) = self
            .store
            .upsert_with(
                caller,
                self.fresh_record(caller, now),
                Box::new(move |r: &mut QuotaRecord| {
                    r.apply_tier(tier, limits);
                    None
                }),
            )
            .await?;
        info!(caller_id = %caller, tier = %tier, "tier changed");
        Ok(record)
    }

    /// Deny every admission for `caller` for `duration`.
    pub async fn block(
        &self,
        caller: &CallerId,
        reason: impl Into<String>,
        duration: Duration,
    ) -> Result<QuotaRecord, QuotaError> {
        let now = self.clock.now();
        let block = Block {
            reason: reason.into(),
            until: now + chrono_duration(duration),
        };
        info!(caller_id = %caller, reason = %block.reason, until = %block.until, "caller blocked");
        let (record, _) = self
            .store
            .upsert_with(
                caller,
                self.fresh_record(caller, now),
                Box::new(move |r: &mut QuotaRecord| {
                    r.block = Some(block);
                    None
                }),
            )
            .await?;
        Ok(record)
    }

    pub async fn unblock(&self, caller: &CallerId) -> Result<QuotaRecord, QuotaError> {
        let now = self.clock.now();
        let (record, _) = self
            .store
            .upsert_with(
                caller,
                self.fresh_record(caller, now),
                Box::new(|r: &mut QuotaRecord| {
                    r.block = None;
                    None
                }),
            )
            .await?;
        info!(caller_id = %caller, "caller unblocked");
        Ok(record)
    }

    /// Current state of `caller`, with expired windows and blocks shown as
    /// reset. Does not create a record.
    pub async fn snapshot(&self, caller: &CallerId) -> Result<Option<QuotaRecord>, QuotaError> {
        let now = self.clock.now();
        Ok(self.store.get(caller).await?.map(|mut r| {
            r.roll_windows(now);
            r.clear_expired_block(now);
            r
        }))
    }

    /// Zero concurrency counters of callers idle longer than
    /// `stale_slot_after`. Returns how many records were repaired.
    pub async fn reconcile_concurrency(&self) -> Result<usize, QuotaError> {
        let now = self.clock.now();
        let stale_before = now - chrono_duration(self.config.stale_slot_after);
        let mut repaired = 0;

        for caller in self.store.list_callers().await? {
            let Some(record) = self.store.get(&caller).await? else {
                continue;
            };
            if record.concurrent.current == 0 || record.last_activity > stale_before {
                continue;
            }
            self.store
                .upsert_with(
                    &caller,
                    self.fresh_record(&caller, now),
                    Box::new(move |r: &mut QuotaRecord| {
                        if r.last_activity <= stale_before {
                            r.concurrent.current = 0;
                        }
                        None
                    }),
                )
                .await?;
            warn!(caller_id = %caller, leaked = record.concurrent.current, "reset stale concurrency slots");
            repaired += 1;
        }
        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{Clock, ManualClock};

    use crate::quota::counter::InMemoryWindowCounter;
    use crate::quota::store::InMemoryQuotaStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryQuotaStore>,
        counter: Arc<InMemoryWindowCounter>,
    }

    impl Fixture {
        fn new() -> Self {
            // Mid-month, so a day's rollover never touches the monthly window.
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
            ));
            Self {
                store: Arc::new(InMemoryQuotaStore::new()),
                counter: Arc::new(InMemoryWindowCounter::new(clock.clone())),
                clock,
            }
        }

        fn ledger(&self, config: LedgerConfig) -> QuotaLedger {
            QuotaLedger::new(self.store.clone(), TierTable::default(), self.clock.clone(), config)
                .with_counter(self.counter.clone())
        }
    }

    fn sample(cost: u64) -> UsageSample {
        UsageSample {
            endpoint: "profile".into(),
            cost,
            success: true,
            response_time_ms: 12,
        }
    }

    #[tokio::test]
    async fn concurrency_slots_are_reserved_and_released() {
        let fx = Fixture::new();
        let ledger = fx.ledger(LedgerConfig::default());
        let caller = CallerId::new("alice");

        let first = ledger.check_admission(&caller).await;
        assert!(first.allowed && first.slot_reserved);
        assert!(ledger.check_admission(&caller).await.allowed);

        let third = ledger.check_admission(&caller).await;
        assert!(!third.allowed);
        assert_eq!(third.reason, Some(DenyReason::ConcurrencyLimitExceeded));
        assert!(!third.slot_reserved);

        ledger.complete_request(&caller).await.unwrap();
        assert!(ledger.check_admission(&caller).await.allowed);
    }

    #[tokio::test]
    async fn complete_request_never_goes_negative() {
        let fx = Fixture::new();
        let ledger = fx.ledger(LedgerConfig::default());
        let caller = CallerId::new("bob");
        ledger.complete_request(&caller).await.unwrap();
        ledger.complete_request(&caller).await.unwrap();
        let record = ledger.snapshot(&caller).await.unwrap().unwrap();
        assert_eq!(record.concurrent.current, 0);
    }

    #[tokio::test]
    async fn daily_quota_denies_until_rollover() {
        let fx = Fixture::new();
        let ledger = fx.ledger(LedgerConfig::default());
        let caller = CallerId::new("carol");

        let admission = ledger.check_admission(&caller).await;
        for _ in 0..100 {
            ledger.record_usage(&caller, sample(1)).await.unwrap();
        }
        ledger.complete_request(&caller).await.unwrap();

        let denied = ledger.check_admission(&caller).await;
        assert_eq!(denied.reason, Some(DenyReason::DailyQuotaExceeded));
        assert_eq!(denied.reset_at, admission.reset_at);
        assert_eq!(denied.quotas.daily.used, 100);

        fx.clock.advance(chrono::Duration::hours(24));
        let allowed = ledger.check_admission(&caller).await;
        assert!(allowed.allowed);
        assert_eq!(allowed.quotas.daily.used, 0);
        assert_eq!(allowed.quotas.monthly.used, 100);
    }

    #[tokio::test]
    async fn blocks_expire() {
        let fx = Fixture::new();
        let ledger = fx.ledger(LedgerConfig::default());
        let caller = CallerId::new("dave");

        ledger.block(&caller, "abuse", Duration::from_secs(600)).await.unwrap();
        let denied = ledger.check_admission(&caller).await;
        assert_eq!(denied.reason, Some(DenyReason::Blocked));
        assert_eq!(denied.block_until, Some(fx.clock.now() + chrono::Duration::minutes(10)));

        fx.clock.advance(chrono::Duration::minutes(10));
        assert!(ledger.check_admission(&caller).await.allowed);

        ledger.block(&caller, "abuse", Duration::from_secs(600)).await.unwrap();
        ledger.unblock(&caller).await.unwrap();
        assert!(ledger.snapshot(&caller).await.unwrap().unwrap().block.is_none());
    }

    #[tokio::test]
    async fn per_minute_denial_releases_the_slot() {
        let fx = Fixture::new();
        let ledger = fx.ledger(LedgerConfig::default());
        let caller = CallerId::new("erin");

        for _ in 0..10 {
            assert!(ledger.check_admission(&caller).await.allowed);
            ledger.complete_request(&caller).await.unwrap();
        }
        let denied = ledger.check_admission(&caller).await;
        assert_eq!(denied.reason, Some(DenyReason::MinuteRateExceeded));
        assert!(denied.reset_at.unwrap() > fx.clock.now());

        let record = ledger.snapshot(&caller).await.unwrap().unwrap();
        assert_eq!(record.concurrent.current, 0);
    }

    #[tokio::test]
    async fn counter_outage_follows_policy() {
        let fx = Fixture::new();
        fx.counter.set_available(false);
        let caller = CallerId::new("frank");

        let open = fx.ledger(LedgerConfig::default());
        assert!(open.check_admission(&caller).await.allowed);

        let closed = fx.ledger(LedgerConfig {
            counter_degrade: DegradeTo::Deny,
            ..LedgerConfig::default()
        });
        let denied = closed.check_admission(&caller).await;
        assert_eq!(denied.reason, Some(DenyReason::QuotaUnavailable));

        // The open admission still holds its slot; the denied one released its own.
        let record = closed.snapshot(&caller).await.unwrap().unwrap();
        assert_eq!(record.concurrent.current, 1);
    }

    #[tokio::test]
    async fn store_outage_follows_policy() {
        let fx = Fixture::new();
        fx.store.set_available(false);
        let caller = CallerId::new("grace");

        let open = fx.ledger(LedgerConfig::default()).check_admission(&caller).await;
        assert!(open.allowed);
        assert!(!open.slot_reserved);

        let closed = fx
            .ledger(LedgerConfig {
                store_degrade: DegradeTo::Deny,
                ..LedgerConfig::default()
            })
            .check_admission(&caller)
            .await;
        assert_eq!(closed.reason, Some(DenyReason::QuotaUnavailable));

        let ledger = fx.ledger(LedgerConfig::default());
        assert!(matches!(
            ledger.record_usage(&caller, sample(1)).await,
            Err(QuotaError::Store(_))
        ));
    }

    #[tokio::test]
    async fn reconcile_resets_leaked_slots() {
        let fx = Fixture::new();
        let ledger = fx.ledger(LedgerConfig::default());
        let leaky = CallerId::new("leaky");
        let active = CallerId::new("active");

        ledger.check_admission(&leaky).await;
        fx.clock.advance(chrono::Duration::minutes(20));
        ledger.check_admission(&active).await;

        assert_eq!(ledger.reconcile_concurrency().await.unwrap(), 1);
        assert_eq!(ledger.snapshot(&leaky).await.unwrap().unwrap().concurrent.current, 0);
        assert_eq!(ledger.snapshot(&active).await.unwrap().unwrap().concurrent.current, 1);
    }

    #[tokio::test]
    async fn tier_upgrade_raises_limits() {
        let fx = Fixture::new();
        let ledger = fx.ledger(LedgerConfig::default());
        let caller = CallerId::new("heidi");

        let record = ledger.upgrade_tier(&caller, Tier::Premium).await.unwrap();
        assert_eq!(record.tier, Tier::Premium);
        assert_eq!(record.daily.limit, 10_000);
        assert_eq!(record.concurrent.limit, 20);
    }
}

//! Quota records, tiers and admission results.

use std::collections::VecDeque;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use bulwark_core::CallerId;

/// Service tier of a caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "premium" => Ok(Tier::Premium),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

/// Limits granted by a tier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub daily: u64,
    pub monthly: u64,
    pub concurrent: u32,
    pub per_minute: u64,
    pub per_hour: u64,
}

/// Limits for every tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    pub free: TierLimits,
    pub basic: TierLimits,
    pub premium: TierLimits,
    pub enterprise: TierLimits,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: TierLimits {
                daily: 100,
                monthly: 2_000,
                concurrent: 2,
                per_minute: 10,
                per_hour: 60,
            },
            basic: TierLimits {
                daily: 1_000,
                monthly: 25_000,
                concurrent: 5,
                per_minute: 30,
                per_hour: 500,
            },
            premium: TierLimits {
                daily: 10_000,
                monthly: 250_000,
                concurrent: 20,
                per_minute: 120,
                per_hour: 3_000,
            },
            enterprise: TierLimits {
                daily: 100_000,
                monthly: 2_500_000,
                concurrent: 100,
                per_minute: 600,
                per_hour: 20_000,
            },
        }
    }
}

impl TierTable {
    pub fn limits(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Free => self.free,
            Tier::Basic => self.basic,
            Tier::Premium => self.premium,
            Tier::Enterprise => self.enterprise,
        }
    }

    pub fn limits_mut(&mut self, tier: Tier) -> &mut TierLimits {
        match tier {
            Tier::Free => &mut self.free,
            Tier::Basic => &mut self.basic,
            Tier::Premium => &mut self.premium,
            Tier::Enterprise => &mut self.enterprise,
        }
    }
}

/// A counted usage window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub limit: u64,
    pub used: u64,
    pub reset_at: DateTime<Utc>,
}

impl Window {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    pub limit: u32,
    pub current: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub reason: String,
    pub until: DateTime<Utc>,
}

/// One metered unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    pub endpoint: String,
    pub cost: u64,
    pub success: bool,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedUsage {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub sample: UsageSample,
}

/// Per-caller quota state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub caller_id: CallerId,
    pub tier: Tier,
    pub daily: Window,
    pub monthly: Window,
    pub concurrent: Concurrency,
    /// Most recent samples, oldest first.
    pub recent: VecDeque<RecordedUsage>,
    pub block: Option<Block>,
    pub last_activity: DateTime<Utc>,
}

/// First instant of the calendar month after `now` (UTC).
pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(|| now + Duration::days(31))
}

impl QuotaRecord {
    pub fn new(caller_id: CallerId, tier: Tier, limits: TierLimits, now: DateTime<Utc>) -> Self {
        Self {
            caller_id,
            tier,
            daily: Window {
                limit: limits.daily,
                used: 0,
                reset_at: now + Duration::hours(24),
            },
            monthly: Window {
                limit: limits.monthly,
                used: 0,
                reset_at: next_month_start(now),
            },
            concurrent: Concurrency {
                limit: limits.concurrent,
                current: 0,
            },
            recent: VecDeque::new(),
            block: None,
            last_activity: now,
        }
    }

    /// Reset windows whose `reset_at` has passed. Returns whether any rolled.
    pub fn roll_windows(&mut self, now: DateTime<Utc>) -> bool {
        let mut rolled = false;
        if now >= self.daily.reset_at {
            self.daily.used = 0;
            self.daily.reset_at = now + Duration::hours(24);
            rolled = true;
        }
        if now >= self.monthly.reset_at {
            self.monthly.used = 0;
            self.monthly.reset_at = next_month_start(now);
            rolled = true;
        }
        rolled
    }

    /// Drop a block that has run out.
    pub fn clear_expired_block(&mut self, now: DateTime<Utc>) {
        if self.block.as_ref().is_some_and(|b| now >= b.until) {
            self.block = None;
        }
    }

    pub fn apply_tier(&mut self, tier: Tier, limits: TierLimits) {
        self.tier = tier;
        self.daily.limit = limits.daily;
        self.monthly.limit = limits.monthly;
        self.concurrent.limit = limits.concurrent;
    }

    /// Charge `sample` against both windows and remember it.
    pub fn push_usage(&mut self, sample: UsageSample, now: DateTime<Utc>, history_cap: usize) {
        self.daily.used = self.daily.used.saturating_add(sample.cost);
        self.monthly.used = self.monthly.used.saturating_add(sample.cost);
        self.recent.push_back(RecordedUsage { at: now, sample });
        while self.recent.len() > history_cap {
            self.recent.pop_front();
        }
        self.last_activity = now;
    }

    pub fn summary(&self) -> QuotaSummary {
        QuotaSummary {
            daily: WindowSummary {
                limit: self.daily.limit,
                used: self.daily.used,
            },
            monthly: WindowSummary {
                limit: self.monthly.limit,
                used: self.monthly.used,
            },
        }
    }
}

/// Why admission was denied.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Blocked,
    DailyQuotaExceeded,
    MonthlyQuotaExceeded,
    ConcurrencyLimitExceeded,
    MinuteRateExceeded,
    HourRateExceeded,
    /// A quota dependency was down and its policy is `DegradeTo::Deny`.
    QuotaUnavailable,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::Blocked => "blocked",
            DenyReason::DailyQuotaExceeded => "daily_quota_exceeded",
            DenyReason::MonthlyQuotaExceeded => "monthly_quota_exceeded",
            DenyReason::ConcurrencyLimitExceeded => "concurrency_limit_exceeded",
            DenyReason::MinuteRateExceeded => "minute_rate_exceeded",
            DenyReason::HourRateExceeded => "hour_rate_exceeded",
            DenyReason::QuotaUnavailable => "quota_unavailable",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub limit: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSummary {
    pub daily: WindowSummary,
    pub monthly: WindowSummary,
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    pub quotas: QuotaSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_until: Option<DateTime<Utc>>,
    /// Whether a concurrency slot is held and must be released with
    /// `complete_request`.
    #[serde(skip)]
    pub slot_reserved: bool,
}

impl Admission {
    pub fn denied(reason: DenyReason, quotas: QuotaSummary) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            quotas,
            reset_at: None,
            block_until: None,
            slot_reserved: false,
        }
    }

    /// Admission granted without consulting quota state.
    pub fn degraded_allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            quotas: QuotaSummary::default(),
            reset_at: None,
            block_until: None,
            slot_reserved: false,
        }
    }
}

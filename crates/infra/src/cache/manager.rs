//! Two-tier cache front: local first, shared second.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use globset::Glob;
use tracing::{debug, info, warn};

use bulwark_core::{SharedClock, UpstreamError};

use super::invalidation::InvalidationStrategy;
use super::local::LocalTier;
use super::shared::{LinkState, SharedTier, SharedTierLink};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub local_capacity: usize,
    /// TTL given to a shared hit copied into the local tier.
    pub local_promotion_ttl: Duration,
    /// TTL used by `set` when the caller gives none.
    pub default_ttl: Duration,
    /// Pause between consecutive fetches while warming.
    pub warm_throttle: Duration,
    /// Keys drained from the preload queue per warm-up run.
    pub warm_batch: usize,
    /// How long a failed shared tier is skipped before being tried again.
    pub reconnect_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: 1000,
            local_promotion_ttl: Duration::from_secs(60),
            default_ttl: Duration::from_secs(3600),
            warm_throttle: Duration::from_millis(100),
            warm_batch: 50,
            reconnect_after: Duration::from_secs(30),
        }
    }
}

/// Which tiers a read may consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierFlags {
    pub local: bool,
    pub shared: bool,
}

impl TierFlags {
    pub const ALL: TierFlags = TierFlags {
        local: true,
        shared: true,
    };
    pub const LOCAL_ONLY: TierFlags = TierFlags {
        local: true,
        shared: false,
    };
    pub const SHARED_ONLY: TierFlags = TierFlags {
        local: false,
        shared: true,
    };
}

impl Default for TierFlags {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn tagged<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub local_entries: usize,
    pub queued_warmups: usize,
}

#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("no fetcher registered for cache warming")]
    NoFetcher,
}

/// Loads the value for a cache key from its source of truth.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<serde_json::Value, UpstreamError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WarmReport {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl WarmReport {
    fn absorb(&mut self, other: WarmReport) {
        self.success += other.success;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// Keys to preload: every `{platform}:{identifier}` combination.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PreloadSpec {
    pub platforms: Vec<String>,
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub priority: PreloadPriority,
}

impl PreloadSpec {
    pub fn keys(&self) -> Vec<String> {
        self.platforms
            .iter()
            .flat_map(|p| self.identifiers.iter().map(move |id| format!("{p}:{id}")))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadOutcome {
    Warmed(WarmReport),
    /// Number of keys newly added to the warm-up queue.
    Queued(usize),
}

pub struct CacheManager {
    config: CacheConfig,
    clock: SharedClock,
    local: Mutex<LocalTier>,
    shared: Option<SharedTierLink>,
    counters: Counters,
    fetcher: RwLock<Option<Arc<dyn Fetcher>>>,
    warm_queue: Mutex<VecDeque<String>>,
    pub(super) strategies: RwLock<HashMap<String, Vec<InvalidationStrategy>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// A local-only cache.
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            local: Mutex::new(LocalTier::new(config.local_capacity)),
            config,
            clock,
            shared: None,
            counters: Counters::default(),
            fetcher: RwLock::new(None),
            warm_queue: Mutex::new(VecDeque::new()),
            strategies: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_shared(mut self, tier: Arc<dyn SharedTier>) -> Self {
        self.shared = Some(SharedTierLink::new(
            tier,
            self.config.reconnect_after,
            self.clock.clone(),
        ));
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn set_fetcher(&self, fetcher: Arc<dyn Fetcher>) {
        *self.fetcher.write().unwrap_or_else(PoisonError::into_inner) = Some(fetcher);
    }

    /// `None` when no shared tier is configured.
    pub fn shared_state(&self) -> Option<LinkState> {
        self.shared.as_ref().map(SharedTierLink::state)
    }

    fn local(&self) -> std::sync::MutexGuard<'_, LocalTier> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shared_tier(&self) -> Option<(&SharedTierLink, Arc<dyn SharedTier>)> {
        let link = self.shared.as_ref()?;
        link.tier().map(|tier| (link, tier))
    }

    pub async fn get(&self, key: &str, flags: TierFlags) -> Option<serde_json::Value> {
        let now = self.clock.now();
        if flags.local {
            if let Some(value) = self.local().get(key, now) {
                self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }

        if flags.shared {
            if let Some((link, tier)) = self.shared_tier() {
                if let Some(Some(value)) = link.settle("get", tier.get(key).await) {
                    self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
                    if flags.local {
                        let evicted = self.local().insert(
                            key,
                            value.clone(),
                            self.config.local_promotion_ttl,
                            Vec::new(),
                            self.clock.now(),
                        );
                        self.counters
                            .evictions
                            .fetch_add(evicted as u64, Ordering::Relaxed);
                    }
                    return Some(value);
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write to both tiers. A shared-tier fault leaves the local write in place.
    pub async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>, opts: SetOptions) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);

        if let Some((link, tier)) = self.shared_tier() {
            link.settle("set", tier.set(key, &value, ttl, &opts.tags).await);
        }

        let evicted = self
            .local()
            .insert(key, value, ttl, opts.tags, self.clock.now());
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
    }

    /// Present in either tier, without touching hit statistics.
    async fn is_present(&self, key: &str) -> bool {
        if self.local().contains(key, self.clock.now()) {
            return true;
        }
        match self.shared_tier() {
            Some((link, tier)) => matches!(link.settle("get", tier.get(key).await), Some(Some(_))),
            None => false,
        }
    }

    /// Remove every key matching a `*` glob from both tiers.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let matcher = Glob::new(pattern)
            .map_err(|e| CacheError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?
            .compile_matcher();

        let mut keys: BTreeSet<String> = {
            let mut local = self.local();
            let keys = local.keys_matching(&matcher);
            for key in &keys {
                local.remove(key);
            }
            keys.into_iter().collect()
        };

        if let Some((link, tier)) = self.shared_tier() {
            if let Some(shared_keys) = link.settle("scan", tier.scan(pattern).await) {
                if !shared_keys.is_empty() {
                    link.settle("delete", tier.delete(&shared_keys).await);
                }
                keys.extend(shared_keys);
            }
        }

        self.counters
            .invalidations
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        debug!(pattern, count = keys.len(), "invalidated cache keys by pattern");
        Ok(keys.len())
    }

    /// Remove every key registered under `tag`. With `cascade`, each removed
    /// key is also detached from the other tags it carried.
    pub async fn invalidate_by_tag(&self, tag: &str, cascade: bool) -> usize {
        let mut keys: BTreeSet<String> = {
            let mut local = self.local();
            let keys = local.keys_for_tag(tag);
            for key in &keys {
                local.remove(key);
            }
            keys.into_iter().collect()
        };

        if let Some((link, tier)) = self.shared_tier() {
            if let Some(members) = link.settle("tag_members", tier.tag_members(tag).await) {
                keys.extend(members);
                let all: Vec<String> = keys.iter().cloned().collect();
                if !all.is_empty() {
                    link.settle("delete", tier.delete(&all).await);
                }
                if cascade {
                    for key in &all {
                        if let Some(tags) = link.settle("key_tags", tier.key_tags(key).await) {
                            let others: Vec<String> = tags.into_iter().filter(|t| t != tag).collect();
                            link.settle("untag", tier.untag(key, &others).await);
                        }
                    }
                }
                link.settle("drop_tag", tier.drop_tag(tag).await);
            }
        }

        self.counters
            .invalidations
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        debug!(tag, cascade, count = keys.len(), "invalidated cache keys by tag");
        keys.len()
    }

    /// Fetch and cache every key not already present, pausing
    /// `warm_throttle` between fetches.
    pub async fn warm(&self, keys: &[String], fetcher: &dyn Fetcher) -> WarmReport {
        let mut report = WarmReport::default();
        let mut fetched_any = false;

        for key in keys {
            if self.is_present(key).await {
                report.skipped += 1;
                continue;
            }
            if fetched_any && !self.config.warm_throttle.is_zero() {
                tokio::time::sleep(self.config.warm_throttle).await;
            }
            fetched_any = true;

            match fetcher.fetch(key).await {
                Ok(value) => {
                    self.set(key, value, None, SetOptions::default()).await;
                    report.success += 1;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "cache warm fetch failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            success = report.success,
            failed = report.failed,
            skipped = report.skipped,
            "cache warm finished"
        );
        report
    }

    fn registered_fetcher(&self) -> Option<Arc<dyn Fetcher>> {
        self.fetcher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// High priority warms now; anything else joins the warm-up queue.
    pub async fn preload(&self, spec: PreloadSpec) -> Result<PreloadOutcome, CacheError> {
        let keys = spec.keys();
        if spec.priority == PreloadPriority::High {
            let fetcher = self.registered_fetcher().ok_or(CacheError::NoFetcher)?;
            return Ok(PreloadOutcome::Warmed(self.warm(&keys, fetcher.as_ref()).await));
        }

        let mut queue = self.warm_queue.lock().unwrap_or_else(PoisonError::into_inner);
        let before = queue.len();
        for key in keys {
            if !queue.contains(&key) {
                queue.push_back(key);
            }
        }
        Ok(PreloadOutcome::Queued(queue.len() - before))
    }

    /// Warm one batch from the preload queue.
    pub async fn warm_queued(&self) -> Result<WarmReport, CacheError> {
        let fetcher = match self.registered_fetcher() {
            Some(fetcher) => fetcher,
            None if self.queued_len() == 0 => return Ok(WarmReport::default()),
            None => return Err(CacheError::NoFetcher),
        };

        let batch: Vec<String> = {
            let mut queue = self.warm_queue.lock().unwrap_or_else(PoisonError::into_inner);
            let n = queue.len().min(self.config.warm_batch);
            queue.drain(..n).collect()
        };

        let mut report = WarmReport::default();
        if !batch.is_empty() {
            report.absorb(self.warm(&batch, fetcher.as_ref()).await);
        }
        Ok(report)
    }

    fn queued_len(&self) -> usize {
        self.warm_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            local_entries: self.local().len(),
            queued_warmups: self.queued_len(),
        }
    }
}

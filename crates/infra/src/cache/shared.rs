//! Shared (cross-process) cache tier.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::Glob;
use tracing::{info, warn};

use bulwark_core::{chrono_duration, SharedClock};

/// A shared cache tier with a tag index.
///
/// Tags map to sets of keys and keys to sets of tags so that tag
/// invalidation can run without scanning the keyspace.
#[async_trait]
pub trait SharedTier: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, SharedTierError>;

    async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), SharedTierError>;

    /// Delete `keys`; returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, SharedTierError>;

    /// Keys matching a glob with `*` wildcards.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, SharedTierError>;

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, SharedTierError>;

    async fn key_tags(&self, key: &str) -> Result<Vec<String>, SharedTierError>;

    /// Forget the tag's key set.
    async fn drop_tag(&self, tag: &str) -> Result<(), SharedTierError>;

    /// Detach `key` from each of `tags` and forget the key's tag set.
    async fn untag(&self, key: &str, tags: &[String]) -> Result<(), SharedTierError>;

    async fn ping(&self) -> Result<(), SharedTierError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SharedTierError {
    #[error("shared tier unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode/decode cached value: {0}")]
    Codec(String),
}

#[derive(Debug, Default)]
struct InMemoryState {
    entries: HashMap<String, (serde_json::Value, DateTime<Utc>)>,
    tags: HashMap<String, BTreeSet<String>>,
    key_tags: HashMap<String, BTreeSet<String>>,
}

/// In-process stand-in for the shared tier, with switchable availability.
#[derive(Debug)]
pub struct InMemorySharedTier {
    clock: SharedClock,
    state: Mutex<InMemoryState>,
    available: AtomicBool,
}

impl InMemorySharedTier {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: Mutex::new(InMemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>, SharedTierError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SharedTierError::Unavailable("in-memory shared tier switched off".into()));
        }
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl SharedTier for InMemorySharedTier {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, SharedTierError> {
        let now = self.clock.now();
        let mut state = self.state()?;
        match state.entries.get(key) {
            Some((value, expires)) if *expires > now => Ok(Some(value.clone())),
            Some(_) => {
                state.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), SharedTierError> {
        let expires = self.clock.now() + chrono_duration(ttl);
        let mut state = self.state()?;
        state.entries.insert(key.to_string(), (value.clone(), expires));
        for tag in tags {
            state.tags.entry(tag.clone()).or_default().insert(key.to_string());
            state.key_tags.entry(key.to_string()).or_default().insert(tag.clone());
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, SharedTierError> {
        let mut state = self.state()?;
        Ok(keys
            .iter()
            .filter(|k| state.entries.remove(k.as_str()).is_some())
            .count() as u64)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, SharedTierError> {
        let matcher = Glob::new(pattern)
            .map_err(|e| SharedTierError::Codec(e.to_string()))?
            .compile_matcher();
        let state = self.state()?;
        Ok(state
            .entries
            .keys()
            .filter(|k| matcher.is_match(k.as_str()))
            .cloned()
            .collect())
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, SharedTierError> {
        let state = self.state()?;
        Ok(state
            .tags
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn key_tags(&self, key: &str) -> Result<Vec<String>, SharedTierError> {
        let state = self.state()?;
        Ok(state
            .key_tags
            .get(key)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn drop_tag(&self, tag: &str) -> Result<(), SharedTierError> {
        self.state()?.tags.remove(tag);
        Ok(())
    }

    async fn untag(&self, key: &str, tags: &[String]) -> Result<(), SharedTierError> {
        let mut state = self.state()?;
        for tag in tags {
            if let Some(keys) = state.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    state.tags.remove(tag);
                }
            }
        }
        state.key_tags.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), SharedTierError> {
        self.state().map(|_| ())
    }
}

#[cfg(feature = "redis")]
pub use redis_tier::RedisSharedTier;

#[cfg(feature = "redis")]
mod redis_tier {
    use super::*;
    use crate::redis_conn::RedisConnection;

    const VALUE_PREFIX: &str = "cache:";
    const TAG_PREFIX: &str = "cache-tag:";
    const KEY_TAGS_PREFIX: &str = "cache-keytags:";

    /// Redis-backed shared tier.
    ///
    /// Values live under `cache:{key}` as JSON strings with `EX` expiry; the
    /// tag index is two families of sets, `cache-tag:{tag}` and
    /// `cache-keytags:{key}`.
    #[derive(Debug, Clone)]
    pub struct RedisSharedTier {
        conn: RedisConnection,
    }

    impl RedisSharedTier {
        pub fn new(conn: RedisConnection) -> Self {
            Self { conn }
        }
    }

    fn unavailable(e: redis::RedisError) -> SharedTierError {
        SharedTierError::Unavailable(e.to_string())
    }

    #[async_trait]
    impl SharedTier for RedisSharedTier {
        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, SharedTierError> {
            let raw: Option<String> = self
                .conn
                .cmd("cache_get", || {
                    let mut cmd = redis::cmd("GET");
                    cmd.arg(format!("{VALUE_PREFIX}{key}"));
                    cmd
                })
                .await
                .map_err(unavailable)?;
            raw.map(|s| serde_json::from_str(&s).map_err(|e| SharedTierError::Codec(e.to_string())))
                .transpose()
        }

        async fn set(
            &self,
            key: &str,
            value: &serde_json::Value,
            ttl: Duration,
            tags: &[String],
        ) -> Result<(), SharedTierError> {
            let payload = serde_json::to_string(value).map_err(|e| SharedTierError::Codec(e.to_string()))?;
            let ttl_secs = ttl.as_secs().max(1);
            let _: () = self
                .conn
                .pipe("cache_set", || {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .cmd("SET")
                        .arg(format!("{VALUE_PREFIX}{key}"))
                        .arg(&payload)
                        .arg("EX")
                        .arg(ttl_secs)
                        .ignore();
                    for tag in tags {
                        pipe.cmd("SADD").arg(format!("{TAG_PREFIX}{tag}")).arg(key).ignore();
                        pipe.cmd("SADD").arg(format!("{KEY_TAGS_PREFIX}{key}")).arg(tag).ignore();
                    }
                    pipe
                })
                .await
                .map_err(unavailable)?;
            Ok(())
        }

        async fn delete(&self, keys: &[String]) -> Result<u64, SharedTierError> {
            if keys.is_empty() {
                return Ok(0);
            }
            self.conn
                .cmd("cache_delete", || {
                    let mut cmd = redis::cmd("DEL");
                    for key in keys {
                        cmd.arg(format!("{VALUE_PREFIX}{key}"));
                    }
                    cmd
                })
                .await
                .map_err(unavailable)
        }

        async fn scan(&self, pattern: &str) -> Result<Vec<String>, SharedTierError> {
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = self
                    .conn
                    .cmd("cache_scan", || {
                        let mut cmd = redis::cmd("SCAN");
                        cmd.arg(cursor)
                            .arg("MATCH")
                            .arg(format!("{VALUE_PREFIX}{pattern}"))
                            .arg("COUNT")
                            .arg(500);
                        cmd
                    })
                    .await
                    .map_err(unavailable)?;
                keys.extend(
                    batch
                        .into_iter()
                        .filter_map(|k| k.strip_prefix(VALUE_PREFIX).map(str::to_string)),
                );
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            keys.sort();
            keys.dedup();
            Ok(keys)
        }

        async fn tag_members(&self, tag: &str) -> Result<Vec<String>, SharedTierError> {
            self.conn
                .cmd("cache_tag_members", || {
                    let mut cmd = redis::cmd("SMEMBERS");
                    cmd.arg(format!("{TAG_PREFIX}{tag}"));
                    cmd
                })
                .await
                .map_err(unavailable)
        }

        async fn key_tags(&self, key: &str) -> Result<Vec<String>, SharedTierError> {
            self.conn
                .cmd("cache_key_tags", || {
                    let mut cmd = redis::cmd("SMEMBERS");
                    cmd.arg(format!("{KEY_TAGS_PREFIX}{key}"));
                    cmd
                })
                .await
                .map_err(unavailable)
        }

        async fn drop_tag(&self, tag: &str) -> Result<(), SharedTierError> {
            let _: u64 = self
                .conn
                .cmd("cache_drop_tag", || {
                    let mut cmd = redis::cmd("DEL");
                    cmd.arg(format!("{TAG_PREFIX}{tag}"));
                    cmd
                })
                .await
                .map_err(unavailable)?;
            Ok(())
        }

        async fn untag(&self, key: &str, tags: &[String]) -> Result<(), SharedTierError> {
            let _: () = self
                .conn
                .pipe("cache_untag", || {
                    let mut pipe = redis::pipe();
                    for tag in tags {
                        pipe.cmd("SREM").arg(format!("{TAG_PREFIX}{tag}")).arg(key).ignore();
                    }
                    pipe.cmd("DEL").arg(format!("{KEY_TAGS_PREFIX}{key}")).ignore();
                    pipe
                })
                .await
                .map_err(unavailable)?;
            Ok(())
        }

        async fn ping(&self) -> Result<(), SharedTierError> {
            let _: String = self
                .conn
                .cmd("cache_ping", || redis::cmd("PING"))
                .await
                .map_err(unavailable)?;
            Ok(())
        }
    }
}

/// Connection state of the shared tier as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    Connected,
    Disconnected { since: DateTime<Utc> },
}

/// Tracks whether the shared tier is usable.
///
/// After a failure the tier is skipped entirely until `reconnect_after` has
/// passed; the next operation is then let through as a retry.
#[derive(Debug)]
pub struct SharedTierLink {
    tier: Arc<dyn SharedTier>,
    state: Mutex<LinkState>,
    reconnect_after: Duration,
    clock: SharedClock,
}

impl SharedTierLink {
    pub fn new(tier: Arc<dyn SharedTier>, reconnect_after: Duration, clock: SharedClock) -> Self {
        Self {
            tier,
            state: Mutex::new(LinkState::Connected),
            reconnect_after,
            clock,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The tier, if it should be tried right now.
    pub fn tier(&self) -> Option<Arc<dyn SharedTier>> {
        match self.state() {
            LinkState::Connected => Some(self.tier.clone()),
            LinkState::Disconnected { since } => {
                let retry_at = since + chrono_duration(self.reconnect_after);
                (self.clock.now() >= retry_at).then(|| self.tier.clone())
            }
        }
    }

    /// Record the outcome of an operation; `None` on failure.
    pub fn settle<T>(&self, operation: &'static str, result: Result<T, SharedTierError>) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(value) => {
                if let LinkState::Disconnected { since } = *state {
                    info!(operation, down_since = %since, "shared cache tier reconnected");
                    *state = LinkState::Connected;
                }
                Some(value)
            }
            Err(e) => {
                if *state == LinkState::Connected {
                    warn!(operation, error = %e, "shared cache tier unavailable; degrading to local tier");
                }
                *state = LinkState::Disconnected {
                    since: self.clock.now(),
                };
                None
            }
        }
    }
}

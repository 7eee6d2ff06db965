//! Short-window (per-minute / per-hour) request counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bulwark_core::{chrono_duration, SharedClock};

/// Atomic increment-with-expiry counter.
#[async_trait]
pub trait WindowCounter: Send + Sync + std::fmt::Debug {
    /// Increment `key`, creating it with a `ttl` expiry if absent, and return
    /// the new count.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, CounterError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CounterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// In-process counter keyed by window bucket.
#[derive(Debug)]
pub struct InMemoryWindowCounter {
    clock: SharedClock,
    counts: Mutex<HashMap<String, (u64, DateTime<Utc>)>>,
    available: AtomicBool,
}

impl InMemoryWindowCounter {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            counts: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl WindowCounter for InMemoryWindowCounter {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, CounterError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CounterError::Unavailable("in-memory counter switched off".into()));
        }
        let now = self.clock.now();
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.retain(|_, (_, expires)| *expires > now);
        let entry = counts
            .entry(key.to_string())
            .or_insert((0, now + chrono_duration(ttl)));
        entry.0 += 1;
        Ok(entry.0)
    }
}

#[cfg(feature = "redis")]
pub use redis_counter::RedisWindowCounter;

#[cfg(feature = "redis")]
mod redis_counter {
    use super::*;
    use crate::redis_conn::RedisConnection;

    /// Redis counter: `MULTI { SET key 0 NX EX ttl; INCR key }`.
    #[derive(Debug, Clone)]
    pub struct RedisWindowCounter {
        conn: RedisConnection,
    }

    impl RedisWindowCounter {
        pub fn new(conn: RedisConnection) -> Self {
            Self { conn }
        }
    }

    #[async_trait]
    impl WindowCounter for RedisWindowCounter {
        async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, CounterError> {
            let ttl_secs = ttl.as_secs().max(1);
            let (count,): (u64,) = self
                .conn
                .pipe("quota_window_incr", || {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .cmd("SET")
                        .arg(key)
                        .arg(0)
                        .arg("NX")
                        .arg("EX")
                        .arg(ttl_secs)
                        .ignore()
                        .cmd("INCR")
                        .arg(key);
                    pipe
                })
                .await
                .map_err(|e| CounterError::Unavailable(e.to_string()))?;
            Ok(count)
        }
    }
}

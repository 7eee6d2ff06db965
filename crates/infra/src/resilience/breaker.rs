//! Circuit breaker guarding one named dependency.
//!
//! State machine:
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: entered once `consecutive_failures >= failure_threshold`; calls
//!   short-circuit with [`BreakerOpen`] without touching the dependency.
//! - **HalfOpen**: entered once `now >= opened_at + reset_timeout`; exactly one
//!   trial call is admitted. Success closes the breaker, failure re-opens it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use bulwark_core::SharedClock;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Returned when a call is short-circuited.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker '{name}' is open until {retry_at}")]
pub struct BreakerOpen {
    pub name: String,
    pub retry_at: DateTime<Utc>,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub short_circuited: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    short_circuited: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                total_successes: 0,
                total_failures: 0,
                short_circuited: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reopen_at(&self, opened_at: DateTime<Utc>) -> DateTime<Utc> {
        opened_at + chrono::Duration::from_std(self.config.reset_timeout).unwrap_or_default()
    }

    /// Ask permission to make a call.
    ///
    /// The returned permit must be resolved with [`BreakerPermit::succeed`] or
    /// [`BreakerPermit::fail`]; dropping it unresolved counts as a failure so a
    /// cancelled half-open trial cannot wedge the breaker.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>, BreakerOpen> {
        let now = self.clock.now();
        let mut inner = self.lock();

        match inner.state {
            BreakerState::Closed => Ok(BreakerPermit::new(self, false)),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let retry_at = self.reopen_at(opened_at);
                if now >= retry_at {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "circuit half-open, admitting trial call");
                    Ok(BreakerPermit::new(self, true))
                } else {
                    inner.short_circuited += 1;
                    Err(BreakerOpen {
                        name: self.name.clone(),
                        retry_at,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.short_circuited += 1;
                    Err(BreakerOpen {
                        name: self.name.clone(),
                        retry_at: now,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(BreakerPermit::new(self, true))
                }
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        if trial {
            inner.trial_in_flight = false;
            inner.consecutive_failures = 0;
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            info!(breaker = %self.name, "circuit closed after successful trial");
        } else if inner.state == BreakerState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    /// Only the trial permit moves a half-open breaker; permits issued
    /// while closed that resolve later are counted and otherwise ignored.
    fn on_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.total_failures += 1;

        if trial {
            inner.trial_in_flight = false;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            warn!(breaker = %self.name, "trial call failed, circuit re-opened");
            return;
        }
        if inner.state != BreakerState::Closed {
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.consecutive_failures >= self.config.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            warn!(
                breaker = %self.name,
                consecutive_failures = inner.consecutive_failures,
                "circuit opened"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            short_circuited: inner.short_circuited,
        }
    }
}

/// Permission to make one call through a breaker.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_failure(self.trial);
        }
    }
}

/// One breaker per dependency name, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: SharedClock,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

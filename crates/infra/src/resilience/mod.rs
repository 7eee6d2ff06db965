//! Circuit breaking and retry around unreliable dependencies.
//!
//! The breaker wraps the retry loop: an open breaker short-circuits before
//! any retry delay is incurred, and an exhausted retry sequence counts as
//! exactly one failure toward the breaker.

pub mod breaker;
pub mod retry;

use std::future::Future;

use tracing::debug;

use bulwark_core::{ErrorKind, UpstreamError};

pub use breaker::{
    BreakerConfig, BreakerOpen, BreakerPermit, BreakerRegistry, BreakerSnapshot, BreakerState,
    CircuitBreaker,
};
pub use retry::{RetryPolicy, exponential_backoff};

/// What to do when a dependency needed for a decision is unreachable.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeTo {
    /// Fail open: proceed as if the dependency had said yes.
    #[default]
    Allow,
    /// Fail closed.
    Deny,
}

impl std::str::FromStr for DegradeTo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(DegradeTo::Allow),
            "deny" => Ok(DegradeTo::Deny),
            other => Err(format!("expected allow or deny, got {other:?}")),
        }
    }
}

/// Failure of a guarded call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    BreakerOpen(#[from] BreakerOpen),

    /// A non-retryable fault; raised immediately.
    #[error("permanent failure: {0}")]
    Permanent(UpstreamError),

    /// Retryable faults persisted through every allowed retry.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: UpstreamError },
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::BreakerOpen(_) => ErrorKind::BreakerOpen,
            CallError::Permanent(e) | CallError::Exhausted { last: e, .. } => e.kind,
        }
    }

    /// Whether the overall operation may be attempted again later.
    ///
    /// An open breaker heals itself after its reset timeout, so callers that
    /// reschedule work (the job queue) treat it as transient.
    pub fn is_transient(&self) -> bool {
        match self {
            CallError::BreakerOpen(_) => true,
            CallError::Permanent(_) => false,
            CallError::Exhausted { last, .. } => last.is_retryable(),
        }
    }

    pub fn into_upstream(self) -> UpstreamError {
        match self {
            CallError::BreakerOpen(open) => UpstreamError::new(ErrorKind::BreakerOpen, open.to_string()),
            CallError::Permanent(e) => e,
            CallError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` through `breaker` with `policy`'s retry loop.
pub async fn guarded_call<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let permit = breaker.acquire()?;

    let mut retries = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                permit.succeed();
                return Ok(value);
            }
            Err(error) if !error.is_retryable() => {
                permit.fail();
                return Err(CallError::Permanent(error));
            }
            Err(error) if policy.should_retry(retries, &error) => {
                retries += 1;
                let delay = policy.delay_for_retry(retries);
                debug!(
                    breaker = %breaker.name(),
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                permit.fail();
                return Err(CallError::Exhausted {
                    attempts: retries + 1,
                    last: error,
                });
            }
        }
    }
}

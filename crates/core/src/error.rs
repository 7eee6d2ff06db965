//! Error taxonomy for faults coming from unreliable dependencies.
//!
//! Everything that crosses the boundary to an upstream data source is reduced
//! to an [`UpstreamError`] carrying an [`ErrorKind`]. The kind alone decides
//! whether a call is retried, whether a job gets another attempt, and how the
//! failure is surfaced to callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused/reset, DNS failure and similar transport faults.
    Network,
    /// The call did not settle in time.
    Timeout,
    /// The upstream throttled us (HTTP 429 and friends).
    RateLimited,
    /// The requested subject does not exist upstream.
    NotFound,
    /// Credentials rejected or access forbidden upstream.
    Auth,
    /// 5xx-class upstream failure.
    Server,
    /// The upstream answered but the payload could not be understood.
    Parsing,
    /// A circuit breaker short-circuited the call.
    BreakerOpen,
    /// A caller exceeded its quota.
    QuotaExceeded,
    /// A job used all of its attempts.
    AttemptsExhausted,
}

impl ErrorKind {
    /// Whether a fault of this kind is worth another try.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server | ErrorKind::RateLimited
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Auth => "auth",
            ErrorKind::Server => "server",
            ErrorKind::Parsing => "parsing",
            ErrorKind::BreakerOpen => "breaker_open",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure reported by an upstream call, handler or fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct UpstreamError {
    pub kind: ErrorKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parsing, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Classify an HTTP status code returned by an upstream.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::Auth,
            404 | 410 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Parsing,
        };
        Self::new(kind, message)
    }

    /// Classify a free-form error message from a fetcher that does not report
    /// structured errors.
    ///
    /// Unknown messages are treated as network faults so that they are retried
    /// a bounded number of times rather than dropped on the floor.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        let kind = if has(&["timeout", "timed out", "etimedout"]) {
            ErrorKind::Timeout
        } else if has(&["not found", "404", "no such", "does not exist"]) {
            ErrorKind::NotFound
        } else if has(&["unauthorized", "forbidden", "401", "403", "login required", "blocked"]) {
            ErrorKind::Auth
        } else if has(&["rate limit", "too many requests", "429"]) {
            ErrorKind::RateLimited
        } else if has(&["parse", "unexpected token", "invalid json", "malformed"]) {
            ErrorKind::Parsing
        } else if has(&["500", "502", "503", "504", "internal server", "bad gateway", "unavailable"]) {
            ErrorKind::Server
        } else {
            ErrorKind::Network
        };

        Self { kind, message }
    }
}

/// An identifier failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identifier {kind}: {reason}")]
pub struct ParseIdError {
    pub kind: &'static str,
    pub reason: String,
}

impl ParseIdError {
    pub fn new(kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

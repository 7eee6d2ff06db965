use std::time::Duration;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use bulwark_infra::jobs::{EnqueueOptions, Job, JobKind, JobStats, JobStatus, UnknownVariant};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueJobRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: Option<u8>,
    pub delay_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Served from cache instead of enqueueing when present there.
    pub cache_key: Option<String>,
}

impl EnqueueJobRequest {
    pub fn options(&self) -> EnqueueOptions {
        let mut opts = EnqueueOptions::default();
        if let Some(p) = self.priority {
            opts = opts.priority(p);
        }
        if let Some(secs) = self.delay_secs {
            opts = opts.delay(Duration::from_secs(secs));
        }
        if let Some(n) = self.max_attempts {
            opts = opts.max_attempts(n);
        }
        self.tags.iter().fold(opts, |o, t| o.tag(t.clone()))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub kind: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct CachedResultResponse {
    pub cached: bool,
    pub value: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub stats: JobStats,
    pub jobs: Vec<Job>,
}

pub fn parse_kind(s: &str) -> Result<JobKind, axum::response::Response> {
    s.parse()
        .map_err(|e: UnknownVariant| {
            errors::json_error(StatusCode::BAD_REQUEST, "invalid_kind", e.to_string())
        })
}

pub fn parse_status(s: &str) -> Result<JobStatus, axum::response::Response> {
    s.parse()
        .map_err(|e: UnknownVariant| {
            errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string())
        })
}

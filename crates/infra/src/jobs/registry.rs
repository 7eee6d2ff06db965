//! Typed handler registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use bulwark_core::UpstreamError;

use super::types::{Job, JobKind};

/// Cache write requested by a successful handler.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheWrite {
    pub key: String,
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

/// What a handler produced.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    /// Stored as the job's `result`.
    pub value: serde_json::Value,
    /// When set, the worker also writes `value` into the cache.
    pub cache: Option<CacheWrite>,
}

impl JobOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value, cache: None }
    }

    pub fn cached(mut self, key: impl Into<String>, ttl: Option<Duration>, tags: Vec<String>) -> Self {
        self.cache = Some(CacheWrite {
            key: key.into(),
            ttl,
            tags,
        });
        self
    }
}

/// Executes one kind of job.
///
/// Jobs are delivered at least once, so implementations must tolerate being
/// called again with the same payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &serde_json::Value, job: &Job) -> Result<JobOutput, UpstreamError>;

    /// Name of the upstream this handler talks to.
    ///
    /// Handlers with a dependency are called through that dependency's circuit
    /// breaker. `None` runs the handler unguarded (internal maintenance work).
    fn dependency(&self) -> Option<&str> {
        None
    }
}

/// Maps each [`JobKind`] to its handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register(&self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        kinds.sort();
        kinds
    }
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
    dependency: Option<String>,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(serde_json::Value, Job) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<JobOutput, UpstreamError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f, dependency: None }
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependency = Some(name.into());
        self
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, Job) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<JobOutput, UpstreamError>> + Send,
{
    async fn handle(&self, payload: &serde_json::Value, job: &Job) -> Result<JobOutput, UpstreamError> {
        (self.f)(payload.clone(), job.clone()).await
    }

    fn dependency(&self) -> Option<&str> {
        self.dependency.as_deref()
    }
}

//! Event-driven invalidation rules.
//!
//! A strategy maps a domain event name to a key pattern or a set of tags.
//! Targets are templates: `profile:{user_id}` is filled from the event's JSON
//! data, and a strategy whose placeholders cannot all be filled is skipped.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::manager::CacheManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    /// A `*` glob over cache keys.
    Pattern(String),
    Tags(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct InvalidationStrategy {
    pub name: String,
    pub event: String,
    pub target: InvalidationTarget,
    /// Only meaningful for tag targets.
    pub cascade: bool,
    pub delay: Option<Duration>,
}

impl InvalidationStrategy {
    pub fn pattern(name: impl Into<String>, event: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event: event.into(),
            target: InvalidationTarget::Pattern(pattern.into()),
            cascade: false,
            delay: None,
        }
    }

    pub fn tags<I, S>(name: impl Into<String>, event: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            event: event.into(),
            target: InvalidationTarget::Tags(tags.into_iter().map(Into::into).collect()),
            cascade: false,
            delay: None,
        }
    }

    pub fn cascading(mut self) -> Self {
        self.cascade = true;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn resolve(&self, data: &serde_json::Value) -> Option<InvalidationTarget> {
        match &self.target {
            InvalidationTarget::Pattern(p) => fill_template(p, data).map(InvalidationTarget::Pattern),
            InvalidationTarget::Tags(tags) => tags
                .iter()
                .map(|t| fill_template(t, data))
                .collect::<Option<Vec<_>>>()
                .map(InvalidationTarget::Tags),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct InvalidationReport {
    /// Keys removed immediately.
    pub invalidated: usize,
    /// Delayed strategies handed to the runtime.
    pub scheduled: usize,
}

/// Replace each `{field}` with the matching top-level field of `data`.
///
/// Strings are inserted verbatim, numbers and booleans in their JSON form.
/// Returns `None` if a field is missing or not a scalar.
pub fn fill_template(template: &str, data: &serde_json::Value) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return Some(out);
        };
        let field = &after[..close];
        match data.get(field)? {
            serde_json::Value::String(s) => out.push_str(s),
            v @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_)) => out.push_str(&v.to_string()),
            _ => return None,
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Some(out)
}

impl CacheManager {
    pub fn register_strategy(&self, strategy: InvalidationStrategy) {
        info!(strategy = %strategy.name, event = %strategy.event, "registered cache invalidation strategy");
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(strategy.event.clone())
            .or_default()
            .push(strategy);
    }

    /// Run every strategy registered for `event`.
    pub async fn smart_invalidate(self: &Arc<Self>, event: &str, data: &serde_json::Value) -> InvalidationReport {
        let strategies = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned()
            .unwrap_or_default();

        let mut report = InvalidationReport::default();
        for strategy in strategies {
            let Some(target) = strategy.resolve(data) else {
                debug!(strategy = %strategy.name, event, "event data lacks template fields; strategy skipped");
                continue;
            };

            match strategy.delay.filter(|d| !d.is_zero()) {
                Some(delay) => {
                    let cache = Arc::clone(self);
                    let cascade = strategy.cascade;
                    let name = strategy.name.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let count = cache.apply_target(&target, cascade).await;
                        debug!(strategy = %name, count, "delayed invalidation applied");
                    });
                    report.scheduled += 1;
                }
                None => report.invalidated += self.apply_target(&target, strategy.cascade).await,
            }
        }
        report
    }

    async fn apply_target(&self, target: &InvalidationTarget, cascade: bool) -> usize {
        match target {
            InvalidationTarget::Pattern(pattern) => match self.invalidate_by_pattern(pattern).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(error = %e, "invalidation pattern rejected");
                    0
                }
            },
            InvalidationTarget::Tags(tags) => {
                let mut count = 0;
                for tag in tags {
                    count += self.invalidate_by_tag(tag, cascade).await;
                }
                count
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::ManualClock;
    use globset::Glob;
    use proptest::prelude::*;
    use serde_json::json;

    use crate::cache::manager::{CacheConfig, SetOptions, TierFlags};

    fn cache() -> Arc<CacheManager> {
        Arc::new(CacheManager::new(CacheConfig::default(), ManualClock::starting_now()))
    }

    #[test]
    fn fills_placeholders_from_event_data() {
        let data = json!({ "user_id": "alice", "version": 3, "nested": { "a": 1 } });
        assert_eq!(fill_template("profile:{user_id}", &data).as_deref(), Some("profile:alice"));
        assert_eq!(fill_template("v{version}:*", &data).as_deref(), Some("v3:*"));
        assert_eq!(fill_template("static", &data).as_deref(), Some("static"));
        assert_eq!(fill_template("open{brace", &data).as_deref(), Some("open{brace"));
        assert_eq!(fill_template("x:{missing}", &data), None);
        assert_eq!(fill_template("x:{nested}", &data), None);
    }

    #[tokio::test]
    async fn runs_matching_strategies_and_skips_unfillable_ones() {
        let cache = cache();
        cache.set("profile:alice", json!(1), None, SetOptions::default()).await;
        cache.set("posts:alice:1", json!(2), None, SetOptions::tagged(["author:alice"])).await;
        cache.set("profile:bob", json!(3), None, SetOptions::default()).await;

        cache.register_strategy(InvalidationStrategy::pattern("profile", "user.updated", "profile:{user_id}"));
        cache.register_strategy(InvalidationStrategy::tags("posts", "user.updated", ["author:{user_id}"]));
        cache.register_strategy(InvalidationStrategy::pattern("org", "user.updated", "org:{org_id}:*"));

        let report = cache.smart_invalidate("user.updated", &json!({ "user_id": "alice" })).await;
        assert_eq!(report, InvalidationReport { invalidated: 2, scheduled: 0 });
        assert_eq!(cache.get("profile:bob", TierFlags::ALL).await, Some(json!(3)));

        let none = cache.smart_invalidate("unrelated", &json!({})).await;
        assert_eq!(none, InvalidationReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_strategy_runs_later() {
        let cache = cache();
        cache.set("feed:alice", json!(1), None, SetOptions::default()).await;
        cache.register_strategy(
            InvalidationStrategy::pattern("feed", "post.created", "feed:{user_id}")
                .delayed(Duration::from_secs(5)),
        );

        let report = cache.smart_invalidate("post.created", &json!({ "user_id": "alice" })).await;
        assert_eq!(report, InvalidationReport { invalidated: 0, scheduled: 1 });
        assert!(cache.get("feed:alice", TierFlags::ALL).await.is_some());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(cache.get("feed:alice", TierFlags::ALL).await.is_none());
    }

    proptest! {
        #[test]
        fn filled_prefix_pattern_matches_subject_keys(subject in "[a-z0-9_-]{1,16}", suffix in "[a-z0-9:]{0,12}") {
            let pattern = fill_template("profile:{id}*", &json!({ "id": subject })).unwrap();
            let matcher = Glob::new(&pattern).unwrap().compile_matcher();
            let key = format!("profile:{subject}{suffix}");
            prop_assert!(matcher.is_match(&key));
            let other = format!("posts:{}", subject);
            prop_assert!(!matcher.is_match(&other));
        }
    }
}

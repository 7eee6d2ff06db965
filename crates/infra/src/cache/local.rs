//! Bounded in-process cache tier.
//!
//! Eviction is by insertion order: when full, the entry inserted longest ago
//! goes first. Reads do not refresh an entry's position.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use globset::GlobMatcher;

use bulwark_core::chrono_duration;

#[derive(Debug, Clone)]
struct LocalEntry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
    tags: Vec<String>,
    seq: u64,
}

#[derive(Debug)]
pub struct LocalTier {
    capacity: usize,
    entries: HashMap<String, LocalEntry>,
    /// Insertion order as `(key, seq)`; entries whose seq no longer matches
    /// were overwritten or removed and are skipped.
    order: VecDeque<(String, u64)>,
    tags: HashMap<String, HashSet<String>>,
    next_seq: u64,
}

impl LocalTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            tags: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live value for `key`; an expired entry is dropped and not returned.
    pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<serde_json::Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.remove(key);
        }
        None
    }

    pub fn contains(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        self.get(key, now).is_some()
    }

    /// Insert or overwrite. Returns how many entries were evicted.
    pub fn insert(
        &mut self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
        tags: Vec<String>,
        now: DateTime<Utc>,
    ) -> usize {
        self.remove(key);

        let mut evicted = 0;
        while self.entries.len() >= self.capacity {
            let Some((old, seq)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&old).is_some_and(|e| e.seq == seq) {
                self.remove(&old);
                evicted += 1;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        for tag in &tags {
            self.tags.entry(tag.clone()).or_default().insert(key.to_string());
        }
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: now + chrono_duration(ttl),
                tags,
                seq,
            },
        );
        self.order.push_back((key.to_string(), seq));
        self.compact();
        evicted
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        true
    }

    pub fn keys_matching(&self, matcher: &GlobMatcher) -> Vec<String> {
        self.entries
            .keys()
            .filter(|k| matcher.is_match(k.as_str()))
            .cloned()
            .collect()
    }

    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.tags
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop stale order slots once they outnumber live entries.
    fn compact(&mut self) {
        if self.order.len() > self.capacity.saturating_mul(2) {
            let entries = &self.entries;
            self.order
                .retain(|(k, seq)| entries.get(k).is_some_and(|e| e.seq == *seq));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use globset::Glob;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn evicts_in_insertion_order_ignoring_reads() {
        let now = Utc::now();
        let mut tier = LocalTier::new(2);
        tier.insert("a", serde_json::json!(1), TTL, vec![], now);
        tier.insert("b", serde_json::json!(2), TTL, vec![], now);

        // Reading "a" does not protect it.
        assert!(tier.get("a", now).is_some());
        assert_eq!(tier.insert("c", serde_json::json!(3), TTL, vec![], now), 1);

        assert!(tier.get("a", now).is_none());
        assert!(tier.get("b", now).is_some());
        assert!(tier.get("c", now).is_some());
    }

    #[test]
    fn overwrite_moves_key_to_the_back() {
        let now = Utc::now();
        let mut tier = LocalTier::new(2);
        tier.insert("a", serde_json::json!(1), TTL, vec![], now);
        tier.insert("b", serde_json::json!(2), TTL, vec![], now);
        tier.insert("a", serde_json::json!(10), TTL, vec![], now);
        tier.insert("c", serde_json::json!(3), TTL, vec![], now);

        assert_eq!(tier.get("a", now), Some(serde_json::json!(10)));
        assert!(tier.get("b", now).is_none());
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn expired_entries_are_never_returned() {
        let now = Utc::now();
        let mut tier = LocalTier::new(4);
        tier.insert("a", serde_json::json!(1), TTL, vec!["t".into()], now);
        assert!(tier.get("a", now + chrono::Duration::seconds(61)).is_none());
        assert!(tier.is_empty());
        assert!(tier.keys_for_tag("t").is_empty());
    }

    #[test]
    fn tag_and_pattern_lookup() {
        let now = Utc::now();
        let mut tier = LocalTier::new(8);
        tier.insert("profile:alice", serde_json::json!(1), TTL, vec!["user:alice".into()], now);
        tier.insert("posts:alice", serde_json::json!(2), TTL, vec!["user:alice".into()], now);
        tier.insert("profile:bob", serde_json::json!(3), TTL, vec![], now);

        let mut tagged = tier.keys_for_tag("user:alice");
        tagged.sort();
        assert_eq!(tagged, vec!["posts:alice", "profile:alice"]);

        let matcher = Glob::new("profile:*").unwrap().compile_matcher();
        let mut matched = tier.keys_matching(&matcher);
        matched.sort();
        assert_eq!(matched, vec!["profile:alice", "profile:bob"]);
    }

    #[test]
    fn many_overwrites_stay_bounded() {
        let now = Utc::now();
        let mut tier = LocalTier::new(3);
        for i in 0..100 {
            tier.insert("hot", serde_json::json!(i), TTL, vec![], now);
        }
        assert_eq!(tier.len(), 1);
        assert!(tier.order.len() <= 6);
    }
}

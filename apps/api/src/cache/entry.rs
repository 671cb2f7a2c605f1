use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A cached value plus the bookkeeping needed for staleness and tag invalidation.
///
/// `timestamp` is written once when the entry is produced; refreshing an entry
/// always rewrites the whole record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    /// Epoch milliseconds at write time.
    pub timestamp: i64,
    pub tags: BTreeSet<String>,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, timestamp: i64, tags: BTreeSet<String>) -> Self {
        Self {
            data,
            timestamp,
            tags,
        }
    }

    pub fn is_stale(&self, now_ms: i64, ttl: Duration) -> bool {
        now_ms - self.timestamp >= ttl.as_millis() as i64
    }
}

/// Only the tag set of a stored entry; used by tag invalidation, which does not
/// know the payload type.
#[derive(Debug, Deserialize)]
pub(crate) struct EntryTags {
    pub tags: BTreeSet<String>,
}

/// How long past `ttl` a stale-while-revalidate entry stays in the store.
pub const DEFAULT_STALE_GRACE: Duration = Duration::from_secs(3600);

/// Per-call cache policy.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub tags: Vec<String>,
    /// Serve stale data and refresh in the background instead of blocking.
    pub stale_while_revalidate: bool,
    /// Extra store lifetime of SWR entries beyond `ttl`. An entry untouched for
    /// `ttl + stale_grace` is gone and the next read is a plain miss.
    pub stale_grace: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            tags: Vec::new(),
            stale_while_revalidate: true,
            stale_grace: DEFAULT_STALE_GRACE,
        }
    }
}

impl CacheOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[allow(dead_code)]
    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    #[allow(dead_code)]
    pub fn stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }

    /// Store lifetime of an entry written now.
    pub fn store_lifetime(&self) -> Duration {
        if self.stale_while_revalidate {
            self.ttl + self.stale_grace
        } else {
            self.ttl
        }
    }
}

/// What the cache learns from a fetched value beyond the static options.
#[derive(Debug, Default)]
pub struct EntryMeta {
    pub tags: Vec<String>,
    /// Epoch ms after which the value itself is invalid (e.g. a session's
    /// `expires_at`). The store entry never outlives it.
    pub expires_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_is_stale_exactly_at_ttl() {
        let entry = CacheEntry::new("x", 1_000, BTreeSet::new());
        let ttl = Duration::from_secs(5);
        assert!(!entry.is_stale(5_999, ttl));
        assert!(entry.is_stale(6_000, ttl));
    }

    #[test]
    fn test_entry_tags_ignore_payload() {
        let raw = r#"{"data":{"anything":[1,2,3]},"timestamp":1,"tags":["user","session"]}"#;
        let tags: EntryTags = serde_json::from_str(raw).unwrap();
        assert!(tags.tags.contains("user"));
        assert_eq!(tags.tags.len(), 2);
    }

    #[test]
    fn test_options_builder() {
        let opts = CacheOptions::new(Duration::from_secs(30))
            .tag("dashboard")
            .stale_while_revalidate(false);
        assert_eq!(opts.ttl, Duration::from_secs(30));
        assert_eq!(opts.tags, vec!["dashboard".to_string()]);
        assert!(!opts.stale_while_revalidate);
        assert!(CacheOptions::default().stale_while_revalidate);
    }

    #[test]
    fn test_store_lifetime_adds_grace_only_for_swr() {
        let swr = CacheOptions::new(Duration::from_secs(30)).stale_grace(Duration::from_secs(600));
        assert_eq!(swr.store_lifetime(), Duration::from_secs(630));

        let strict = swr.stale_while_revalidate(false);
        assert_eq!(strict.store_lifetime(), Duration::from_secs(30));
    }
}

//! Stale-while-revalidate cache over the key-value store.
//!
//! Entries are stored as JSON `CacheEntry<T>` records. Every tag an entry carries
//! is mirrored into a `tag:{tag}` index scored by the entry's store deadline, so
//! invalidation by tag touches only the keys that were written with it and dead
//! members are pruned on the next write.
//!
//! Availability wins over consistency: any store failure is logged and the
//! caller falls through to the origin. Every entry has a bounded store lifetime
//! (`ttl`, plus `stale_grace` for SWR entries, capped by the value's own expiry).

use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::{KvStore, StoreError};

pub mod entry;
pub mod handlers;
pub mod revalidate;
pub mod stats;

pub use entry::{CacheEntry, CacheOptions, EntryMeta};
pub use stats::CacheStatsSnapshot;

use entry::EntryTags;
use revalidate::InFlight;
use stats::CacheStats;

const TAG_INDEX_PREFIX: &str = "tag:";

fn tag_key(tag: &str) -> String {
    format!("{TAG_INDEX_PREFIX}{tag}")
}

fn no_meta<T>(_: &T) -> EntryMeta {
    EntryMeta::default()
}

fn decode_tags(raw: Option<String>) -> BTreeSet<String> {
    raw.and_then(|raw| serde_json::from_str::<EntryTags>(&raw).ok())
        .map(|entry| entry.tags)
        .unwrap_or_default()
}

/// Error returned by an origin fetch.
pub trait FetchError: Display + Send + 'static {
    /// The origin no longer holds the record. A cached copy of it is dropped
    /// instead of being served until it ages out.
    fn is_gone(&self) -> bool {
        false
    }
}

impl FetchError for sqlx::Error {}

struct Encoded {
    raw: String,
    tags: BTreeSet<String>,
    /// Epoch ms at which the store drops the entry.
    deadline_ms: i64,
}

#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    stats: Arc<CacheStats>,
    inflight: InFlight,
}

impl Cache {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            stats: Arc::new(CacheStats::default()),
            inflight: InFlight::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of background refreshes still running.
    pub fn pending_revalidations(&self) -> usize {
        self.inflight.pending()
    }

    /// Returns the cached value for `key`, calling `fetch` on a miss.
    ///
    /// - fresh entry: returned without calling `fetch`
    /// - stale entry, SWR on: returned immediately; `fetch` runs in a background task
    /// - stale entry, SWR off, or no entry: `fetch` is awaited and its result stored
    pub async fn get_or_fetch<T, F, Fut, E>(
        &self,
        key: &str,
        opts: &CacheOptions,
        fetch: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: FetchError,
    {
        self.get_or_fetch_with(key, opts, fetch, no_meta::<T>).await
    }

    /// Like [`Cache::get_or_fetch`], with tags and an expiry derived from the
    /// fetched value (e.g. the owner and `expires_at` of a session, which are
    /// only known after loading it).
    pub async fn get_or_fetch_with<T, F, Fut, E>(
        &self,
        key: &str,
        opts: &CacheOptions,
        fetch: F,
        describe: fn(&T) -> EntryMeta,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: FetchError,
    {
        if let Some(entry) = self.read::<T>(key).await {
            if !entry.is_stale(self.clock.now_ms(), opts.ttl) {
                self.stats.record_hit();
                return Ok(entry.data);
            }

            if opts.stale_while_revalidate {
                self.stats.record_stale();
                self.spawn_revalidation(key, opts.clone(), fetch, describe);
                return Ok(entry.data);
            }
        }

        self.stats.record_miss();
        let data = fetch().await?;
        let meta = describe(&data);
        self.write(key, &data, opts, meta).await;
        Ok(data)
    }

    /// Writes `data` under `key` with the given policy.
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        opts: &CacheOptions,
    ) -> Result<(), StoreError> {
        self.put_with(key, data, opts, EntryMeta::default()).await
    }

    pub async fn put_with<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        opts: &CacheOptions,
        meta: EntryMeta,
    ) -> Result<(), StoreError> {
        let encoded = self.encode(data, opts, meta)?;
        self.store_encoded(key, encoded).await
    }

    /// Reads the entry at `key` without touching the origin. Staleness is not checked.
    #[cfg(test)]
    pub async fn peek<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        self.read(key).await
    }

    /// Deletes the entry at `key` and its tag index memberships. A background
    /// refresh of `key` already running will not write its result back.
    pub async fn invalidate(&self, key: &str) -> Result<bool, StoreError> {
        let tags = decode_tags(self.store.get(key).await?);
        self.drop_entry(key, &tags).await
    }

    /// Deletes every entry currently tagged with `tag`; returns how many were removed.
    ///
    /// Index members whose entry has since been rewritten without the tag (or
    /// has expired) are dropped from the index and left alone.
    pub async fn revalidate_tag(&self, tag: &str) -> Result<usize, StoreError> {
        let index = tag_key(tag);
        let keys = self.store.index_members(&index).await?;
        let mut removed = 0;

        for key in keys {
            let tags = decode_tags(self.store.get(&key).await?);
            if tags.contains(tag) {
                if self.drop_entry(&key, &tags).await? {
                    removed += 1;
                }
            } else {
                self.store.index_remove(&index, &key).await?;
            }
        }

        debug!(tag, removed, "Revalidated cache tag");
        Ok(removed)
    }

    async fn drop_entry(&self, key: &str, tags: &BTreeSet<String>) -> Result<bool, StoreError> {
        // Flag first: a refresh that checks after this point sees it, one that
        // checked before has already written and the delete below wins.
        self.inflight.cancel(key);
        let removed = self.store.del(key).await?;
        for tag in tags {
            self.store.index_remove(&tag_key(tag), key).await?;
        }
        Ok(removed)
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let raw = match self.store.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                self.stats.record_store_error();
                warn!(key, error = %e, "Cache read failed; falling through to origin");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &str, data: &T, opts: &CacheOptions, meta: EntryMeta) {
        if let Err(e) = self.put_with(key, data, opts, meta).await {
            self.stats.record_store_error();
            warn!(key, error = %e, "Cache write failed");
        }
    }

    fn encode<T: Serialize>(
        &self,
        data: &T,
        opts: &CacheOptions,
        meta: EntryMeta,
    ) -> Result<Encoded, StoreError> {
        let now = self.clock.now_ms();
        let tags: BTreeSet<String> = opts.tags.iter().cloned().chain(meta.tags).collect();
        let lifetime_end = now.saturating_add(opts.store_lifetime().as_millis() as i64);
        let deadline_ms = meta
            .expires_at
            .map_or(lifetime_end, |at| at.min(lifetime_end));

        let entry = CacheEntry::new(data, now, tags);
        let raw = serde_json::to_string(&entry)?;
        Ok(Encoded {
            raw,
            tags: entry.tags,
            deadline_ms,
        })
    }

    async fn store_encoded(&self, key: &str, encoded: Encoded) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let remaining_ms = encoded.deadline_ms.saturating_sub(now).max(0);
        let remaining = Duration::from_millis(remaining_ms as u64);
        self.store.set(key, &encoded.raw, Some(remaining)).await?;

        for tag in &encoded.tags {
            self.store
                .index_add(&tag_key(tag), key, encoded.deadline_ms, now)
                .await?;
        }
        Ok(())
    }

    fn spawn_revalidation<T, F, Fut, E>(
        &self,
        key: &str,
        opts: CacheOptions,
        fetch: F,
        describe: fn(&T) -> EntryMeta,
    ) where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: FetchError,
    {
        let Some(guard) = self.inflight.begin(key) else {
            debug!(key, "Revalidation already in flight");
            return;
        };

        let cache = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let result = fetch().await;
            if guard.is_cancelled() {
                debug!(key = %key, "Entry invalidated during revalidation; discarding result");
                return;
            }

            let data = match result {
                Ok(data) => data,
                Err(e) if e.is_gone() => {
                    cache.stats.record_eviction();
                    if let Err(e) = cache.invalidate(&key).await {
                        cache.stats.record_store_error();
                        warn!(target: "revalidation", key = %key, error = %e, "Failed to evict entry whose origin record is gone");
                    } else {
                        debug!(key = %key, "Origin record gone; evicted cache entry");
                    }
                    return;
                }
                Err(e) => {
                    cache.stats.record_revalidation_failure();
                    warn!(target: "revalidation", key = %key, error = %e, "Background revalidation failed");
                    return;
                }
            };

            let meta = describe(&data);
            let stored = match cache.encode(&data, &opts, meta) {
                Ok(encoded) => cache.store_encoded(&key, encoded).await,
                Err(e) => Err(e),
            };
            match stored {
                Ok(()) if guard.is_cancelled() => {
                    if let Err(e) = cache.invalidate(&key).await {
                        cache.stats.record_store_error();
                        warn!(target: "revalidation", key = %key, error = %e, "Failed to drop entry invalidated mid-refresh");
                    }
                }
                Ok(()) => {
                    cache.stats.record_revalidation();
                    debug!(key = %key, "Revalidated stale cache entry");
                }
                Err(e) => {
                    cache.stats.record_store_error();
                    warn!(target: "revalidation", key = %key, error = %e, "Failed to store revalidated entry");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::FailingStore;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const TTL: Duration = Duration::from_secs(60);

    impl FetchError for String {}

    /// Origin answer for a record that has been deleted.
    #[derive(Debug)]
    struct Gone;

    impl std::fmt::Display for Gone {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("gone")
        }
    }

    impl FetchError for Gone {
        fn is_gone(&self) -> bool {
            true
        }
    }

    fn setup() -> (Arc<ManualClock>, Cache) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (clock.clone(), Cache::new(store, clock))
    }

    fn counting_fetch(
        calls: &Arc<AtomicU32>,
        value: &str,
    ) -> impl FnOnce() -> std::future::Ready<Result<String, String>> + Send + 'static {
        let calls = Arc::clone(calls);
        let value = value.to_string();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value))
        }
    }

    async fn settle(cache: &Cache) {
        while cache.pending_revalidations() > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_cold_key_calls_fetch_once() {
        let (_, cache) = setup();
        let calls = Arc::new(AtomicU32::new(0));

        let value = cache
            .get_or_fetch("k", &CacheOptions::new(TTL), counting_fetch(&calls, "v1"))
            .await
            .unwrap();

        assert_eq!(value, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_does_not_call_fetch() {
        let (clock, cache) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        let opts = CacheOptions::new(TTL);

        cache
            .get_or_fetch("k", &opts, counting_fetch(&calls, "v1"))
            .await
            .unwrap();
        clock.advance_secs(59);
        let value = cache
            .get_or_fetch("k", &opts, counting_fetch(&calls, "v2"))
            .await
            .unwrap();

        assert_eq!(value, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_stale_entry_is_served_while_refreshing_once() {
        let (clock, cache) = setup();
        let opts = CacheOptions::new(TTL);
        let calls = Arc::new(AtomicU32::new(0));
        cache
            .get_or_fetch("k", &opts, counting_fetch(&calls, "old"))
            .await
            .unwrap();
        clock.advance_secs(60);

        let gate = Arc::new(Notify::new());
        let refreshes = Arc::new(AtomicU32::new(0));
        let gated_fetch = || {
            let gate = Arc::clone(&gate);
            let refreshes = Arc::clone(&refreshes);
            move || async move {
                refreshes.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok::<_, String>("new".to_string())
            }
        };

        let first = cache.get_or_fetch("k", &opts, gated_fetch()).await.unwrap();
        let second = cache.get_or_fetch("k", &opts, gated_fetch()).await.unwrap();
        assert_eq!(first, "old");
        assert_eq!(second, "old");
        assert_eq!(cache.pending_revalidations(), 1);

        gate.notify_one();
        settle(&cache).await;

        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        let refreshed = cache
            .get_or_fetch("k", &opts, counting_fetch(&calls, "unused"))
            .await
            .unwrap();
        assert_eq!(refreshed, "new");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().stale_served, 2);
        assert_eq!(cache.stats().revalidations, 1);
    }

    #[tokio::test]
    async fn test_stale_entry_without_swr_fetches_synchronously() {
        let (clock, cache) = setup();
        let opts = CacheOptions::new(TTL).stale_while_revalidate(false);
        let calls = Arc::new(AtomicU32::new(0));

        cache
            .get_or_fetch("k", &opts, counting_fetch(&calls, "old"))
            .await
            .unwrap();
        clock.advance_secs(61);
        let value = cache
            .get_or_fetch("k", &opts, counting_fetch(&calls, "new"))
            .await
            .unwrap();

        assert_eq!(value, "new");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.pending_revalidations(), 0);
    }

    #[tokio::test]
    async fn test_failed_revalidation_keeps_stale_value() {
        let (clock, cache) = setup();
        let opts = CacheOptions::new(TTL);
        let calls = Arc::new(AtomicU32::new(0));
        cache
            .get_or_fetch("k", &opts, counting_fetch(&calls, "old"))
            .await
            .unwrap();
        clock.advance_secs(120);

        let value = cache
            .get_or_fetch("k", &opts, || async {
                Err::<String, _>("origin down".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "old");
        settle(&cache).await;

        assert_eq!(cache.stats().revalidation_failures, 1);
        let entry = cache.peek::<String>("k").await.unwrap();
        assert_eq!(entry.data, "old");
    }

    #[tokio::test]
    async fn test_fetch_error_on_cold_key_is_returned() {
        let (_, cache) = setup();
        let result = cache
            .get_or_fetch("k", &CacheOptions::new(TTL), || async {
                Err::<String, _>("boom".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err(), "boom");
        assert!(cache.peek::<String>("k").await.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_falls_through_to_origin() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = Cache::new(Arc::new(FailingStore), clock);
        let calls = Arc::new(AtomicU32::new(0));
        let opts = CacheOptions::new(TTL);

        for _ in 0..2 {
            let value = cache
                .get_or_fetch("k", &opts, counting_fetch(&calls, "v"))
                .await
                .unwrap();
            assert_eq!(value, "v");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // one failed read and one failed write per call
        assert_eq!(cache.stats().store_errors, 4);
    }

    #[tokio::test]
    async fn test_revalidate_tag_removes_only_tagged_entries() {
        let (_, cache) = setup();
        let user = CacheOptions::new(TTL).tag("user");
        let session = CacheOptions::new(TTL).tag("session");

        cache.put("user:1", &"a", &user).await.unwrap();
        cache.put("user:2", &"b", &user).await.unwrap();
        cache.put("session:x", &"c", &session).await.unwrap();

        let removed = cache.revalidate_tag("user").await.unwrap();

        assert_eq!(removed, 2);
        assert!(cache.peek::<String>("user:1").await.is_none());
        assert!(cache.peek::<String>("user:2").await.is_none());
        assert!(cache.peek::<String>("session:x").await.is_some());
    }

    #[tokio::test]
    async fn test_revalidate_tag_skips_entries_rewritten_without_tag() {
        let (_, cache) = setup();
        cache
            .put("k", &"tagged", &CacheOptions::new(TTL).tag("dashboard"))
            .await
            .unwrap();
        cache
            .put("k", &"untagged", &CacheOptions::new(TTL))
            .await
            .unwrap();

        assert_eq!(cache.revalidate_tag("dashboard").await.unwrap(), 0);
        assert_eq!(cache.peek::<String>("k").await.unwrap().data, "untagged");
        assert!(cache
            .store()
            .index_members("tag:dashboard")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_derived_tags_are_indexed() {
        let (_, cache) = setup();
        let value = cache
            .get_or_fetch_with(
                "session:abc",
                &CacheOptions::new(TTL).tag("session"),
                || async { Ok::<_, String>("u-42".to_string()) },
                |owner: &String| EntryMeta {
                    tags: vec![format!("session-user:{owner}")],
                    expires_at: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(value, "u-42");

        let entry = cache.peek::<String>("session:abc").await.unwrap();
        assert!(entry.tags.contains("session"));
        assert!(entry.tags.contains("session-user:u-42"));
        assert_eq!(cache.revalidate_tag("session-user:u-42").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_swr_entries_expire_in_store() {
        let (clock, cache) = setup();
        cache
            .put(
                "k",
                &"v",
                &CacheOptions::new(TTL).stale_while_revalidate(false),
            )
            .await
            .unwrap();
        clock.advance_secs(60);
        assert!(cache.peek::<String>("k").await.is_none());
    }

    #[tokio::test]
    async fn test_swr_entries_leave_the_store_after_grace() {
        let (clock, cache) = setup();
        let opts = CacheOptions::new(TTL)
            .tag("dashboard")
            .stale_grace(Duration::from_secs(600));
        cache.put("k", &"v", &opts).await.unwrap();

        clock.advance_secs(659);
        assert!(cache.peek::<String>("k").await.is_some());
        clock.advance_secs(1);
        assert!(cache.peek::<String>("k").await.is_none());
        assert!(cache.store().keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entry_never_outlives_its_value_expiry() {
        let (clock, cache) = setup();
        let expires_at = clock.now_ms() + 5_000;
        cache
            .put_with(
                "session:tok",
                &"s",
                &CacheOptions::new(TTL).tag("session"),
                EntryMeta {
                    tags: Vec::new(),
                    expires_at: Some(expires_at),
                },
            )
            .await
            .unwrap();

        clock.advance_secs(5);
        assert!(cache.peek::<String>("session:tok").await.is_none());
        assert!(cache.store().keys("tag:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_removes_key_from_its_tag_indexes() {
        let (_, cache) = setup();
        let opts = CacheOptions::new(TTL).tag("session").tag("session-user:1");
        cache.put("session:tok", &"s", &opts).await.unwrap();
        cache.put("session:other", &"s", &opts).await.unwrap();

        assert!(cache.invalidate("session:tok").await.unwrap());

        for index in ["tag:session", "tag:session-user:1"] {
            assert_eq!(
                cache.store().index_members(index).await.unwrap(),
                vec!["session:other"]
            );
        }
    }

    #[tokio::test]
    async fn test_gone_origin_evicts_stale_entry() {
        let (clock, cache) = setup();
        let opts = CacheOptions::new(TTL).tag("session");
        cache.put("session:tok", &"s", &opts).await.unwrap();
        clock.advance_secs(61);

        let served = cache
            .get_or_fetch("session:tok", &opts, || async { Err::<String, _>(Gone) })
            .await
            .unwrap();
        assert_eq!(served, "s");
        settle(&cache).await;

        assert!(cache.peek::<String>("session:tok").await.is_none());
        assert!(cache.store().index_members("tag:session").await.unwrap().is_empty());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().revalidation_failures, 0);

        let result = cache
            .get_or_fetch("session:tok", &opts, || async { Err::<String, _>(Gone) })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalidation_during_revalidation_discards_refresh() {
        let (clock, cache) = setup();
        let opts = CacheOptions::new(TTL);
        cache.put("k", &"old", &opts).await.unwrap();
        clock.advance_secs(61);

        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        let served = cache
            .get_or_fetch("k", &opts, move || async move {
                release.notified().await;
                Ok::<_, String>("resurrected".to_string())
            })
            .await
            .unwrap();
        assert_eq!(served, "old");
        assert_eq!(cache.pending_revalidations(), 1);

        assert!(cache.invalidate("k").await.unwrap());
        gate.notify_one();
        settle(&cache).await;

        assert!(cache.peek::<String>("k").await.is_none());
        assert_eq!(cache.stats().revalidations, 0);
    }
}

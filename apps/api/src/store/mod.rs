//! Key-value store adapter.
//!
//! Every cache, rate-limit and session operation goes through [`KvStore`].
//! Three backends exist:
//! - `RestStore`: managed Redis-compatible REST API (used in production)
//! - `RedisStore`: native Redis protocol (self-hosted / docker-compose)
//! - `MemoryStore`: process-local fallback when no store is configured
//!
//! All single-key operations are assumed atomic by the backend. No client-side
//! locking or transactions are layered on top.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::StoreBackend;

pub mod memory;
pub mod redis;
pub mod rest;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;
pub use rest::RestStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store returned an error: {0}")]
    Response(String),

    #[error("Failed to decode store value: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),

    #[error("Value at '{0}' is not an integer")]
    NotAnInteger(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes `value`, replacing any previous value and expiry.
    /// `ttl = None` stores the key without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomically increments the integer at `key` (missing keys start at 0).
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Returns true if a key was removed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Glob-style key listing (`*`, `?`, `[...]`). Backends iterate
    /// incrementally rather than with a blocking `KEYS`.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Adds `member` to the index at `key` with the epoch-ms deadline after
    /// which it is dead. In the same atomic step, members already dead at
    /// `now_ms` are pruned and the index is set to expire with its
    /// longest-lived member.
    async fn index_add(
        &self,
        key: &str,
        member: &str,
        deadline_ms: i64,
        now_ms: i64,
    ) -> Result<(), StoreError>;

    /// Every member of the index, dead or alive.
    async fn index_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn index_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Short backend label for logs and the stats endpoint.
    fn backend(&self) -> &'static str;
}

/// Builds the store selected by configuration.
/// Falls back to the in-memory store when no credentials are configured so that
/// rate limiting keeps working in local development.
pub async fn connect(
    backend: &StoreBackend,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match backend {
        StoreBackend::Rest { url, token } => {
            info!("Using REST key-value store at {url}");
            Arc::new(RestStore::new(url.clone(), token.clone())?)
        }
        StoreBackend::Redis { url } => {
            let store = RedisStore::connect(url).await?;
            info!("Redis connection manager initialized");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("No key-value store configured; using in-memory fallback (not shared across processes)");
            Arc::new(MemoryStore::new(clock))
        }
    };
    Ok(store)
}

/// Index maintenance for [`KvStore::index_add`] on Redis-speaking backends.
/// KEYS[1] = index, ARGV = member, deadline ms, now ms.
pub(crate) const INDEX_ADD_SCRIPT: &str = r#"
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[3])
local last = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
if last[2] then
  redis.call('PEXPIREAT', KEYS[1], last[2])
end
return 1
"#;

pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    // Redis rejects zero-second expiries.
    ttl.as_secs().max(1)
}

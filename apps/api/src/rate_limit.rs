//! Fixed-window rate limiting on top of the key-value store.
//!
//! A counter at `ratelimit:{key}` is incremented on every attempt; the first
//! increment of a window sets the key's expiry, and the store drops the key when
//! the window ends.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::store::{KvStore, StoreError};

const KEY_PREFIX: &str = "ratelimit:";

/// What to do when the store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Allow the attempt. For non-sensitive paths (dashboard reads).
    Open,
    /// Deny the attempt. For auth-sensitive paths (signup, verification resend).
    Closed,
}

/// Attempts allowed per window for one action.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub max_attempts: u32,
    pub window: Duration,
    pub on_store_error: FailurePolicy,
}

impl RateLimitRule {
    pub fn new(max_attempts: u32, window_secs: u64, on_store_error: FailurePolicy) -> Self {
        Self {
            max_attempts,
            window: Duration::from_secs(window_secs),
            on_store_error,
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Counts one attempt for `key` and returns whether it is within the limit.
    pub async fn check(&self, key: &str, rule: RateLimitRule) -> bool {
        match self.increment(key, rule.window).await {
            Ok(count) => count <= i64::from(rule.max_attempts),
            Err(e) => {
                let allowed = rule.on_store_error == FailurePolicy::Open;
                if allowed {
                    warn!(key, error = %e, "Rate limit store unavailable; allowing attempt");
                } else {
                    error!(key, error = %e, "Rate limit store unavailable; denying attempt");
                }
                allowed
            }
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let counter_key = format!("{KEY_PREFIX}{key}");
        let count = self.store.incr(&counter_key).await?;
        if count == 1 {
            self.store.expire(&counter_key, window).await?;
        }
        Ok(count)
    }
}

/// Builds the limiter key for an action and identifier, e.g. `signup:a@b.com`.
pub fn action_key(action: &str, identifier: &str) -> String {
    format!("{action}:{}", identifier.trim().to_lowercase())
}

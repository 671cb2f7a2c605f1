use sqlx::PgPool;

use crate::auth::session_cache::SessionCache;
use crate::cache::Cache;
use crate::config::Config;
use crate::rate_limit::RateLimiter;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub cache: Cache,
    pub sessions: SessionCache,
    pub limiter: RateLimiter,
    pub config: Config,
}

mod auth;
mod cache;
mod clock;
mod config;
mod dashboard;
mod db;
mod errors;
mod models;
mod rate_limit;
mod routes;
mod state;
mod store;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::repository::PgAuthRepository;
use crate::auth::session_cache::SessionCache;
use crate::cache::Cache;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::create_pool;
use crate::rate_limit::RateLimiter;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails fast on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Prepdeck API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;

    // Initialize key-value store (REST, Redis, or in-memory fallback)
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = store::connect(&config.store, clock.clone()).await?;
    info!("Key-value store initialized (backend: {})", store.backend());

    let cache = Cache::new(store.clone(), clock);
    let sessions = SessionCache::new(
        cache.clone(),
        Arc::new(PgAuthRepository::new(db.clone())),
        config.session_cache_ttl,
        config.user_cache_ttl,
    );
    let limiter = RateLimiter::new(store);

    // Build app state
    let state = AppState {
        db,
        cache,
        sessions,
        limiter,
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict CORS to the web app origin

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

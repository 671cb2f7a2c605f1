use axum::{extract::State, Json};

use crate::auth::extract::CurrentSession;
use crate::dashboard::stats::{cached_stats, DashboardStats};
use crate::errors::AppError;
use crate::rate_limit::action_key;
use crate::state::AppState;

/// GET /api/v1/dashboard/stats
pub async fn handle_dashboard_stats(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Result<Json<DashboardStats>, AppError> {
    let rule = state.config.dashboard_limit;
    let key = action_key("dashboard", &session.user.id.to_string());
    if !state.limiter.check(&key, rule).await {
        return Err(AppError::RateLimited {
            retry_after_secs: rule.window.as_secs(),
        });
    }

    let stats = cached_stats(
        &state.cache,
        &state.db,
        session.user.id,
        state.config.dashboard_cache_ttl,
    )
    .await?;
    Ok(Json(stats))
}

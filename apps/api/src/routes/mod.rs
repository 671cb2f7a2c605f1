pub mod health;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::auth::handlers as auth;
use crate::cache::handlers as cache;
use crate::dashboard::handlers as dashboard;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Session / user
        .route(
            "/api/v1/session",
            get(auth::handle_get_session).delete(auth::handle_sign_out),
        )
        .route("/api/v1/users/:id", get(auth::handle_get_user))
        .route(
            "/api/v1/users/:id/sessions",
            delete(auth::handle_sign_out_everywhere),
        )
        // Auth (rate limited)
        .route("/api/v1/auth/signup", post(auth::handle_signup))
        .route(
            "/api/v1/auth/resend-verification",
            post(auth::handle_resend_verification),
        )
        .route("/api/v1/auth/verify-email", post(auth::handle_verify_email))
        // Dashboard
        .route(
            "/api/v1/dashboard/stats",
            get(dashboard::handle_dashboard_stats),
        )
        // Cache administration
        .route("/api/v1/cache/revalidate", post(cache::handle_revalidate))
        .route("/api/v1/cache/stats", get(cache::handle_cache_stats))
        .with_state(state)
}

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::extract::{session_token, CurrentSession};
use crate::errors::AppError;
use crate::models::session::SessionRecord;
use crate::models::user::UserSnapshot;
use crate::rate_limit::action_key;
use crate::state::AppState;

const SESSION_LIFETIME_DAYS: i64 = 30;
const VERIFICATION_LIFETIME_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub email: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct InvalidatedSessions {
    pub deleted: u64,
    pub evicted: usize,
}

fn normalize_email(raw: &str) -> Result<String, AppError> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(AppError::Validation(format!("Invalid email address: {raw}"))),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|code| code == "23505")
}

/// GET /api/v1/session
pub async fn handle_get_session(CurrentSession(session): CurrentSession) -> Json<SessionRecord> {
    Json(session)
}

/// DELETE /api/v1/session
pub async fn handle_sign_out(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let token = session_token(&headers).ok_or(AppError::Unauthorized)?;
    state.sessions.repository().delete_session(&token).await?;
    state.sessions.remove_session(&token).await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/users/:id
pub async fn handle_get_user(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<Uuid>,
) -> Result<Json<UserSnapshot>, AppError> {
    if session.user.id != id {
        return Err(AppError::Forbidden);
    }
    let user = state
        .sessions
        .get_user_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {id} not found")))?;
    Ok(Json(user))
}

/// DELETE /api/v1/users/:id/sessions
/// Signs the user out on every device.
pub async fn handle_sign_out_everywhere(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<Uuid>,
) -> Result<Json<InvalidatedSessions>, AppError> {
    if session.user.id != id {
        return Err(AppError::Forbidden);
    }
    let deleted = state.sessions.repository().delete_user_sessions(id).await?;
    let evicted = state.sessions.invalidate_user_sessions(id).await?;
    info!("Signed out user {id} everywhere ({deleted} sessions)");
    Ok(Json(InvalidatedSessions { deleted, evicted }))
}

/// POST /api/v1/auth/signup
pub async fn handle_signup(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> Result<(StatusCode, Json<SessionRecord>), AppError> {
    let email = normalize_email(&req.email)?;
    let rule = state.config.signup_limit;
    if !state.limiter.check(&action_key("signup", &email), rule).await {
        return Err(AppError::RateLimited {
            retry_after_secs: rule.window.as_secs(),
        });
    }

    let repo = state.sessions.repository();
    let user = repo
        .create_user(&email, req.name.as_deref().map(str::trim))
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Validation("An account with this email already exists".to_string())
            } else {
                AppError::Database(e)
            }
        })?;

    let session = repo
        .create_session(&user, chrono::Duration::days(SESSION_LIFETIME_DAYS))
        .await?;
    state.sessions.set_session(&session).await;

    Ok((StatusCode::CREATED, Json(session)))
}

/// POST /api/v1/auth/resend-verification
///
/// Always answers 202 for unknown or already-verified addresses so the endpoint
/// does not reveal which emails are registered. Delivery is handled by the mailer.
pub async fn handle_resend_verification(
    State(state): State<AppState>,
    Json(req): Json<EmailRequest>,
) -> Result<StatusCode, AppError> {
    let email = normalize_email(&req.email)?;
    let rule = state.config.resend_limit;
    if !state.limiter.check(&action_key("resend", &email), rule).await {
        return Err(AppError::RateLimited {
            retry_after_secs: rule.window.as_secs(),
        });
    }

    let token = state
        .sessions
        .repository()
        .rotate_verification_token(
            &email,
            chrono::Duration::hours(VERIFICATION_LIFETIME_HOURS),
        )
        .await?;
    if token.is_some() {
        info!("Issued verification token for {email}");
    }
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/v1/auth/verify-email
pub async fn handle_verify_email(
    State(state): State<AppState>,
    Json(req): Json<VerifyEmailRequest>,
) -> Result<StatusCode, AppError> {
    let email = normalize_email(&req.email)?;
    let user_id = state
        .sessions
        .repository()
        .verify_email(&email, req.token.trim())
        .await?
        .ok_or_else(|| AppError::Validation("Invalid or expired verification token".to_string()))?;

    // Cached snapshots and sessions still say "unverified".
    state.sessions.invalidate_user(user_id).await?;
    state.sessions.invalidate_user_sessions(user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};

use crate::errors::AppError;
use crate::models::session::SessionRecord;
use crate::state::AppState;

const SESSION_COOKIES: &[&str] = &["__Secure-next-auth.session-token", "next-auth.session-token"];

/// Pulls the session token from `Authorization: Bearer` or the NextAuth session cookie.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| SESSION_COOKIES.contains(name) && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Extractor for an authenticated request. Rejects with 401 when the token is
/// missing, unknown, or expired.
pub struct CurrentSession(pub SessionRecord);

#[async_trait]
impl FromRequestParts<AppState> for CurrentSession {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers).ok_or(AppError::Unauthorized)?;
        let record = state
            .sessions
            .get_session(&token)
            .await?
            .ok_or(AppError::Unauthorized)?;
        Ok(CurrentSession(record))
    }
}

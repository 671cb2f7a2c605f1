//! Read-through cache for sessions and user snapshots.
//!
//! Keys: `session:{token}` and `user:{id}`. Sessions are tagged with
//! `session-user:{user_id}` so every session of one user can be dropped at once;
//! user-scoped entries (snapshot, dashboard) carry `user:{id}`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::repository::AuthRepository;
use crate::cache::{Cache, CacheOptions, EntryMeta, FetchError};
use crate::errors::AppError;
use crate::models::session::SessionRecord;
use crate::models::user::UserSnapshot;

pub fn session_key(token: &str) -> String {
    format!("session:{token}")
}

pub fn user_key(id: Uuid) -> String {
    format!("user:{id}")
}

/// Tag carried by every cached session of a user.
pub fn session_user_tag(user_id: Uuid) -> String {
    format!("session-user:{user_id}")
}

/// Tag carried by every user-scoped cache entry.
pub fn user_tag(user_id: Uuid) -> String {
    format!("user:{user_id}")
}

fn session_meta(record: &SessionRecord) -> EntryMeta {
    EntryMeta {
        tags: vec![session_user_tag(record.user.id)],
        expires_at: Some(record.expires_at),
    }
}

fn user_meta(user: &UserSnapshot) -> EntryMeta {
    EntryMeta {
        tags: vec![user_tag(user.id)],
        expires_at: None,
    }
}

/// Origin lookup outcome. Absent rows are not cached, and a cached copy of a
/// row that has disappeared is evicted on its next refresh.
#[derive(Debug, Error)]
enum LookupError {
    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl FetchError for LookupError {
    fn is_gone(&self) -> bool {
        matches!(self, LookupError::NotFound)
    }
}

fn into_option<T>(result: Result<T, LookupError>) -> Result<Option<T>, AppError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(LookupError::NotFound) => Ok(None),
        Err(LookupError::Database(e)) => Err(AppError::Database(e)),
    }
}

#[derive(Clone)]
pub struct SessionCache {
    cache: Cache,
    repo: Arc<dyn AuthRepository>,
    session_opts: CacheOptions,
    user_opts: CacheOptions,
}

impl SessionCache {
    pub fn new(
        cache: Cache,
        repo: Arc<dyn AuthRepository>,
        session_ttl: Duration,
        user_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            repo,
            session_opts: CacheOptions::new(session_ttl).tag("session"),
            user_opts: CacheOptions::new(user_ttl).tag("user"),
        }
    }

    pub fn repository(&self) -> &Arc<dyn AuthRepository> {
        &self.repo
    }

    /// Looks up a session, cache first. Expired sessions are evicted and reported absent.
    pub async fn get_session(&self, token: &str) -> Result<Option<SessionRecord>, AppError> {
        let repo = Arc::clone(&self.repo);
        let lookup = token.to_string();
        let result = self
            .cache
            .get_or_fetch_with(
                &session_key(token),
                &self.session_opts,
                move || async move {
                    repo.find_session(&lookup)
                        .await?
                        .ok_or(LookupError::NotFound)
                },
                session_meta,
            )
            .await;

        let Some(record) = into_option(result)? else {
            return Ok(None);
        };

        if record.is_expired(self.cache.clock().now_ms()) {
            debug!(user_id = %record.user.id, "Session expired; evicting");
            self.remove_session(token).await;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Caches a freshly created session. The entry leaves the store no later
    /// than the session's `expires_at`.
    pub async fn set_session(&self, record: &SessionRecord) {
        if let Err(e) = self
            .cache
            .put_with(
                &session_key(&record.session_token),
                record,
                &self.session_opts,
                session_meta(record),
            )
            .await
        {
            warn!(user_id = %record.user.id, error = %e, "Failed to cache session");
        }
    }

    pub async fn remove_session(&self, token: &str) {
        if let Err(e) = self.cache.invalidate(&session_key(token)).await {
            warn!(error = %e, "Failed to drop cached session");
        }
    }

    pub async fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserSnapshot>, AppError> {
        let repo = Arc::clone(&self.repo);
        let result = self
            .cache
            .get_or_fetch_with(
                &user_key(id),
                &self.user_opts,
                move || async move { repo.find_user(id).await?.ok_or(LookupError::NotFound) },
                user_meta,
            )
            .await;
        into_option(result)
    }

    /// Drops every cached session belonging to `user_id`. Returns how many were removed.
    pub async fn invalidate_user_sessions(&self, user_id: Uuid) -> Result<usize, AppError> {
        let removed = self
            .cache
            .revalidate_tag(&session_user_tag(user_id))
            .await?;
        debug!(%user_id, removed, "Invalidated cached sessions");
        Ok(removed)
    }

    /// Drops the cached snapshot and every other user-scoped entry of `user_id`.
    pub async fn invalidate_user(&self, user_id: Uuid) -> Result<usize, AppError> {
        Ok(self.cache.revalidate_tag(&user_tag(user_id)).await?)
    }
}

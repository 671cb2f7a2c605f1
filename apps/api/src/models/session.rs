use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::user::UserSnapshot;

/// Cached view of a database session. Postgres stays authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user: UserSnapshot,
    pub session_token: String,
    /// Epoch milliseconds.
    pub expires_at: i64,
}

impl SessionRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Row shape of the session + user join.
#[derive(Debug, FromRow)]
pub struct SessionRow {
    pub session_token: String,
    pub expires: DateTime<Utc>,
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub email_verified: bool,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        SessionRecord {
            user: UserSnapshot {
                id: row.user_id,
                email: row.email,
                name: row.name,
                image: row.image,
                email_verified: row.email_verified,
            },
            session_token: row.session_token,
            expires_at: row.expires.timestamp_millis(),
        }
    }
}

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::models::session::{SessionRecord, SessionRow};
use crate::models::user::UserSnapshot;

/// Database-backed account and session lookups (NextAuth schema).
///
/// Carried behind `Arc<dyn AuthRepository>` so the session cache can be tested
/// without Postgres.
#[async_trait]
pub trait AuthRepository: Send + Sync {
    async fn find_session(&self, token: &str) -> Result<Option<SessionRecord>, sqlx::Error>;

    async fn find_user(&self, id: Uuid) -> Result<Option<UserSnapshot>, sqlx::Error>;

    async fn create_user(&self, email: &str, name: Option<&str>)
        -> Result<UserSnapshot, sqlx::Error>;

    async fn create_session(
        &self,
        user: &UserSnapshot,
        lifetime: Duration,
    ) -> Result<SessionRecord, sqlx::Error>;

    async fn delete_session(&self, token: &str) -> Result<(), sqlx::Error>;

    /// Deletes every session row of the user; returns how many were removed.
    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, sqlx::Error>;

    /// Replaces any outstanding verification token for an unverified user.
    /// Returns `None` if no such user exists or the email is already verified.
    async fn rotate_verification_token(
        &self,
        email: &str,
        lifetime: Duration,
    ) -> Result<Option<String>, sqlx::Error>;

    /// Consumes a valid, unexpired token and marks the email verified.
    /// Returns the verified user's id.
    async fn verify_email(&self, email: &str, token: &str) -> Result<Option<Uuid>, sqlx::Error>;
}

#[derive(Clone)]
pub struct PgAuthRepository {
    pool: PgPool,
}

impl PgAuthRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl AuthRepository for PgAuthRepository {
    async fn find_session(&self, token: &str) -> Result<Option<SessionRecord>, sqlx::Error> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT s.session_token, s.expires, u.id AS user_id, u.email, u.name, u.image,
                   (u.email_verified IS NOT NULL) AS email_verified
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.session_token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SessionRecord::from))
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<UserSnapshot>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, email, name, image, (email_verified IS NOT NULL) AS email_verified FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn create_user(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> Result<UserSnapshot, sqlx::Error> {
        let user: UserSnapshot = sqlx::query_as(
            r#"
            INSERT INTO users (id, email, name)
            VALUES ($1, $2, $3)
            RETURNING id, email, name, image, (email_verified IS NOT NULL) AS email_verified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        info!("Created user {}", user.id);
        Ok(user)
    }

    async fn create_session(
        &self,
        user: &UserSnapshot,
        lifetime: Duration,
    ) -> Result<SessionRecord, sqlx::Error> {
        let token = new_token();
        let expires = Utc::now() + lifetime;

        sqlx::query("INSERT INTO sessions (id, session_token, user_id, expires) VALUES ($1, $2, $3, $4)")
            .bind(Uuid::new_v4())
            .bind(&token)
            .bind(user.id)
            .bind(expires)
            .execute(&self.pool)
            .await?;

        Ok(SessionRecord {
            user: user.clone(),
            session_token: token,
            expires_at: expires.timestamp_millis(),
        })
    }

    async fn delete_session(&self, token: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM sessions WHERE session_token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn rotate_verification_token(
        &self,
        email: &str,
        lifetime: Duration,
    ) -> Result<Option<String>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let unverified: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM users WHERE email = $1 AND email_verified IS NULL")
                .bind(email)
                .fetch_optional(&mut *tx)
                .await?;
        if unverified.is_none() {
            return Ok(None);
        }

        sqlx::query("DELETE FROM verification_tokens WHERE identifier = $1")
            .bind(email)
            .execute(&mut *tx)
            .await?;

        let token = new_token();
        sqlx::query(
            "INSERT INTO verification_tokens (identifier, token, expires) VALUES ($1, $2, $3)",
        )
        .bind(email)
        .bind(&token)
        .bind(Utc::now() + lifetime)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(token))
    }

    async fn verify_email(&self, email: &str, token: &str) -> Result<Option<Uuid>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let consumed = sqlx::query(
            "DELETE FROM verification_tokens WHERE identifier = $1 AND token = $2 AND expires > NOW()",
        )
        .bind(email)
        .bind(token)
        .execute(&mut *tx)
        .await?;
        if consumed.rows_affected() == 0 {
            return Ok(None);
        }

        let user_id: Option<Uuid> = sqlx::query_scalar(
            "UPDATE users SET email_verified = NOW() WHERE email = $1 RETURNING id",
        )
        .bind(email)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(user_id)
    }
}

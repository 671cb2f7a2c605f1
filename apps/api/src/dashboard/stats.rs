use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::auth::session_cache::user_tag;
use crate::cache::{Cache, CacheOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DashboardStats {
    pub resume_count: i64,
    pub average_ats_score: Option<f64>,
    pub interview_count: i64,
    pub completed_interviews: i64,
    pub average_interview_score: Option<f64>,
}

pub fn dashboard_key(user_id: Uuid) -> String {
    format!("dashboard:{user_id}")
}

/// Cache policy for a user's dashboard: tagged so a user-wide or dashboard-wide
/// invalidation drops it.
pub fn dashboard_options(user_id: Uuid, ttl: Duration) -> CacheOptions {
    CacheOptions::new(ttl)
        .tag("dashboard")
        .tag(user_tag(user_id))
}

pub async fn load_stats(pool: &PgPool, user_id: Uuid) -> Result<DashboardStats, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM resumes WHERE user_id = $1) AS resume_count,
            (SELECT AVG(ats_score)::float8 FROM resumes
                WHERE user_id = $1 AND ats_score IS NOT NULL) AS average_ats_score,
            (SELECT COUNT(*) FROM mock_interviews WHERE user_id = $1) AS interview_count,
            (SELECT COUNT(*) FROM mock_interviews
                WHERE user_id = $1 AND completed_at IS NOT NULL) AS completed_interviews,
            (SELECT AVG(score)::float8 FROM mock_interviews
                WHERE user_id = $1 AND score IS NOT NULL) AS average_interview_score
        "#,
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
}

/// Stats for `user_id`, served from cache with background refresh when stale.
pub async fn cached_stats(
    cache: &Cache,
    pool: &PgPool,
    user_id: Uuid,
    ttl: Duration,
) -> Result<DashboardStats, sqlx::Error> {
    let pool = pool.clone();
    cache
        .get_or_fetch(
            &dashboard_key(user_id),
            &dashboard_options(user_id, ttl),
            move || async move { load_stats(&pool, user_id).await },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn stats(resumes: i64) -> DashboardStats {
        DashboardStats {
            resume_count: resumes,
            average_ats_score: Some(72.5),
            interview_count: 3,
            completed_interviews: 2,
            average_interview_score: None,
        }
    }

    #[tokio::test]
    async fn test_user_invalidation_drops_dashboard_entry() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = Cache::new(Arc::new(MemoryStore::new(clock.clone())), clock);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let ttl = Duration::from_secs(60);

        cache
            .put(&dashboard_key(alice), &stats(1), &dashboard_options(alice, ttl))
            .await
            .unwrap();
        cache
            .put(&dashboard_key(bob), &stats(2), &dashboard_options(bob, ttl))
            .await
            .unwrap();

        assert_eq!(cache.revalidate_tag(&user_tag(alice)).await.unwrap(), 1);
        assert!(cache
            .peek::<DashboardStats>(&dashboard_key(alice))
            .await
            .is_none());
        assert_eq!(
            cache
                .peek::<DashboardStats>(&dashboard_key(bob))
                .await
                .unwrap()
                .data,
            stats(2)
        );

        assert_eq!(cache.revalidate_tag("dashboard").await.unwrap(), 1);
    }
}

use axum::{extract::State, http::HeaderMap, Json};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::cache::CacheStatsSnapshot;
use crate::errors::AppError;
use crate::state::AppState;

const REVALIDATE_SECRET_HEADER: &str = "x-revalidate-secret";
const NAMESPACES: &[&str] = &["session", "user", "dashboard", "ratelimit"];

#[derive(Debug, Deserialize)]
pub struct RevalidateRequest {
    pub tag: String,
}

#[derive(Debug, Serialize)]
pub struct RevalidateResponse {
    pub tag: String,
    pub removed: usize,
}

#[derive(Debug, Serialize)]
pub struct NamespaceCount {
    pub namespace: &'static str,
    pub keys: usize,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub backend: &'static str,
    pub counters: CacheStatsSnapshot,
    /// `None` when the store could not be listed.
    pub namespaces: Option<Vec<NamespaceCount>>,
}

fn secrets_match(provided: &str, expected: &str) -> bool {
    // Length is not secret; contents are compared in constant time.
    provided.len() == expected.len()
        && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

/// Admits cache administration calls carrying `REVALIDATE_SECRET`.
/// Everything is refused while no secret is configured.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let expected = state
        .config
        .revalidate_secret
        .as_deref()
        .ok_or(AppError::Forbidden)?;
    let provided = headers
        .get(REVALIDATE_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Forbidden)?;
    if secrets_match(provided, expected) {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

/// POST /api/v1/cache/revalidate
pub async fn handle_revalidate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RevalidateRequest>,
) -> Result<Json<RevalidateResponse>, AppError> {
    authorize(&state, &headers)?;

    let tag = req.tag.trim();
    if tag.is_empty() {
        return Err(AppError::Validation("tag must not be empty".to_string()));
    }

    let removed = state.cache.revalidate_tag(tag).await?;
    info!("Revalidated tag '{tag}': {removed} entries removed");
    Ok(Json(RevalidateResponse {
        tag: tag.to_string(),
        removed,
    }))
}

/// GET /api/v1/cache/stats
///
/// Same secret as revalidation: namespace counts walk the keyspace.
pub async fn handle_cache_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CacheStatsResponse>, AppError> {
    authorize(&state, &headers)?;
    let store = state.cache.store();
    let mut namespaces = Vec::with_capacity(NAMESPACES.len());
    for &namespace in NAMESPACES {
        match store.keys(&format!("{namespace}:*")).await {
            Ok(keys) => namespaces.push(NamespaceCount {
                namespace,
                keys: keys.len(),
            }),
            Err(e) => {
                tracing::warn!("Could not list cache keys: {e}");
                return Ok(Json(CacheStatsResponse {
                    backend: store.backend(),
                    counters: state.cache.stats(),
                    namespaces: None,
                }));
            }
        }
    }

    Ok(Json(CacheStatsResponse {
        backend: store.backend(),
        counters: state.cache.stats(),
        namespaces: Some(namespaces),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_match_requires_exact_value() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3creT", "s3cret"));
        assert!(!secrets_match("s3cret-and-more", "s3cret"));
        assert!(!secrets_match("", "s3cret"));
    }
}

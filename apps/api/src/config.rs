use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::rate_limit::{FailurePolicy, RateLimitRule};

/// Which key-value store backs the cache and rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Rest { url: String, token: String },
    Redis { url: String },
    Memory,
}

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub store: StoreBackend,
    pub port: u16,
    pub rust_log: String,
    pub session_cache_ttl: Duration,
    pub user_cache_ttl: Duration,
    pub dashboard_cache_ttl: Duration,
    pub signup_limit: RateLimitRule,
    pub resend_limit: RateLimitRule,
    pub dashboard_limit: RateLimitRule,
    pub revalidate_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let store = match (
            var("UPSTASH_REDIS_REST_URL"),
            var("UPSTASH_REDIS_REST_TOKEN"),
            var("REDIS_URL"),
        ) {
            (Some(url), Some(token), _) => StoreBackend::Rest { url, token },
            (_, _, Some(url)) => StoreBackend::Redis { url },
            _ => StoreBackend::Memory,
        };

        let secs = |key: &str, default: u64| -> Result<Duration> {
            parse_or(var(key), default, key).map(Duration::from_secs)
        };

        let rule = |max_key: &str,
                    max_default: u32,
                    window_key: &str,
                    window_default: u64,
                    policy: FailurePolicy| {
            Ok::<_, anyhow::Error>(RateLimitRule::new(
                parse_or(var(max_key), max_default, max_key)?,
                parse_or(var(window_key), window_default, window_key)?,
                policy,
            ))
        };

        Ok(Config {
            database_url: var("DATABASE_URL")
                .context("Required environment variable 'DATABASE_URL' is not set")?,
            store,
            port: parse_or(var("PORT"), 8080, "PORT")?,
            rust_log: var("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            session_cache_ttl: secs("SESSION_CACHE_TTL_SECS", 300)?,
            user_cache_ttl: secs("USER_CACHE_TTL_SECS", 300)?,
            dashboard_cache_ttl: secs("DASHBOARD_CACHE_TTL_SECS", 60)?,
            // Auth-sensitive actions deny attempts when the store is down.
            signup_limit: rule(
                "SIGNUP_RATE_LIMIT",
                5,
                "SIGNUP_RATE_WINDOW_SECS",
                900,
                FailurePolicy::Closed,
            )?,
            resend_limit: rule(
                "RESEND_RATE_LIMIT",
                3,
                "RESEND_RATE_WINDOW_SECS",
                3600,
                FailurePolicy::Closed,
            )?,
            dashboard_limit: rule(
                "DASHBOARD_RATE_LIMIT",
                60,
                "DASHBOARD_RATE_WINDOW_SECS",
                60,
                FailurePolicy::Open,
            )?,
            revalidate_secret: var("REVALIDATE_SECRET"),
        })
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T, key: &str) -> Result<T> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .ok()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        None => Ok(default),
    }
}

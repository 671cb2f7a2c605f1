// Dashboard: per-user progress figures, read through the cache.

pub mod handlers;
pub mod stats;

// Auth: session/user read-through cache, the Postgres account repository,
// and the handlers for signup, verification and sign-out.

pub mod extract;
pub mod handlers;
pub mod repository;
pub mod session_cache;

//! Runtime services: planning, approval, execution, health, caching,
//! rate limiting, cancellation.

pub mod approval;
pub mod cache;
pub mod cancel;
pub mod executor;
pub mod fleet;
pub mod health;
pub mod jobs;
pub mod plans;
pub mod rate_limit;
pub mod topics;

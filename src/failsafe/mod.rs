//! Failsafe mechanisms: retry, rate limiting, origin health tracking

mod health;
mod rate_limiter;
mod retry;

pub use health::{
    HealthTracker, Observation, OriginRole, OriginStatus, Transition, is_healthy_code,
};
pub use rate_limiter::{RateDecision, RateLimiter};
pub use retry::{RetryPolicy, fetch_with_retry};

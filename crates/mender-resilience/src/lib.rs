//! Resilience primitives guarding calls to unreliable external services.
//!
//! - [`CircuitBreakerRegistry`]: per-service closed/open/half-open breaker
//! - [`RateLimiterRegistry`]: per-service minute/day windows with queue, fail, or delay
//! - [`with_retry`] / [`with_retry_and_verify`]: exponential backoff, optionally
//!   double-checking a reported failure before believing it

pub mod backoff;
pub mod breaker;
pub mod config;
pub mod limiter;
pub mod retry;

pub use backoff::BackoffPolicy;
pub use breaker::{BreakerConfig, BreakerOverrides, CircuitBreakerRegistry, CircuitState, CircuitStatus};
pub use config::{Resilience, ResilienceConfig, ServiceConfig};
pub use limiter::{LimitStrategy, RateLimitConfig, RateLimitStatus, RateLimiterRegistry};
pub use retry::{with_retry, with_retry_and_verify, RetryOptions, RetryPredicate, VerifyOptions};

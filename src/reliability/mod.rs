//! Circuit breaker + retry policy shared by every outbound adapter call.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use retry::{retry, RetryPolicy};

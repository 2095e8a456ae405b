//! Circuit breakers keyed by operation name.
//!
//! A breaker short-circuits *future* calls to a dependency that keeps
//! failing; it never interrupts the retries inside a single call.

mod breaker;

pub use breaker::{
    counts_toward_breaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot,
    CircuitState,
};

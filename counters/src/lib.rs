//! Shared counter store access and fixed-window rate limiting.
//!
//! The [`CounterStore`] trait is the only way the rest of the workspace talks to the
//! low-latency key-value store. [`RateLimiter`] builds fixed-window counters on top of it.

pub mod config;
pub mod memory;
pub mod metrics_defs;
pub mod rate_limiter;
pub mod store;
pub mod window;

pub use rate_limiter::{FailurePolicy, RateLimitDecision, RateLimitSpec, RateLimiter};
pub use store::{CounterStore, Increment, StoreError, bounded};
pub use window::Window;

//! # call-resilience
//!
//! 呼叫编排器的弹性协调层：限流、熔断、背压与重试。
//!
//! Resilience coordination layer for a call-handling orchestrator that depends
//! on several unreliable downstream services (PMS connectors, speech synthesis,
//! media servers, secret stores).
//!
//! ## Overview
//!
//! For every inbound or outbound operation this crate decides whether to admit
//! it, how much concurrent or queued work is allowed, when to stop calling a
//! failing dependency, and how to retry failed calls without amplifying load.
//! It consumes "call succeeded / failed / timed out" signals and hands back
//! "allowed / rejected / must wait" decisions plus wrapping helpers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use call_resilience::{ProtectedCall, ResilienceManager, ResiliencePolicy};
//!
//! #[tokio::main]
//! async fn main() -> call_resilience::Result<()> {
//!     let manager = ResilienceManager::new(ResiliencePolicy::from_env()?, None).await?;
//!
//!     let guest = manager
//!         .execute_protected(
//!             ProtectedCall::new().with_breaker("pms_connector").with_retry("pms"),
//!             || async { Ok::<_, call_resilience::Error>("room 1204") },
//!         )
//!         .await?;
//!     println!("{guest}");
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`store`] | Shared counter store trait, in-memory store, failover wrapper |
//! | [`rate_limit`] | Sliding window, token bucket and fixed window admission |
//! | [`circuit_breaker`] | Per-dependency three-state breaker |
//! | [`backpressure`] | Bounded queue + memory budget with overflow strategies |
//! | [`retry`] | Exponential-backoff retry ladder |
//! | [`policy`] | Static YAML policy and environment profiles |
//! | [`manager`] | Composition root, health and metrics |

pub mod backpressure;
pub mod circuit_breaker;
pub mod manager;
pub mod policy;
pub mod rate_limit;
pub mod retry;
pub mod store;

// Re-export main types for convenience
pub use backpressure::{BackpressureConfig, BackpressureHandler, BackpressureStrategy, TaskHandle};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use manager::{HealthStatus, MetricsSnapshot, ProtectedCall, RateLimitKey, ResilienceManager};
pub use policy::{Environment, ResiliencePolicy};
pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter, RateWindow};
pub use retry::{RetryConfig, RetryLadder};
pub use store::{CounterStore, FailoverStore, MemoryStore};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{BoxError, Error, ErrorContext, FaultKind};

//! 共享计数存储：限流窗口与令牌桶的原子计数后端。
//!
//! # Shared Counter Store
//!
//! Every rate-limit counter lives behind [`CounterStore`]. The store is shared
//! read/write by every process in the deployment, so all counter mutations are
//! single atomic primitives: an increment, a sorted-set operation with expiry,
//! or one of the three scripted read-modify-write operations below. Callers
//! never read a counter and write it back in two steps.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CounterStore`] | Async trait implemented by store clients |
//! | [`MemoryStore`] | Process-local keyspace with TTLs; also the degraded-mode fallback |
//! | [`FailoverStore`] | Primary store with a one-way switch to [`MemoryStore`] on failure |
//!
//! ## Scripted operations
//!
//! - [`CounterStore::sliding_window_hit`]: purge, count, add, compare, roll back on overflow
//! - [`CounterStore::token_bucket_take`]: refill, compare, subtract
//! - [`CounterStore::fixed_window_hit`]: increment (expiry on first hit), compare, decrement on overflow

mod failover;
mod memory;

pub use failover::FailoverStore;
pub use memory::MemoryStore;

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of a window-counting script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    pub allowed: bool,
    /// Count observed after adding this hit (before any rollback).
    pub count: u64,
}

/// Outcome of a token-bucket script.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketTake {
    pub allowed: bool,
    /// Tokens left in the bucket after this take.
    pub tokens: f64,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Round-trip to verify connectivity.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<i64>>;
    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<()>;
    /// Increment, applying `ttl_on_create` only when the key did not exist.
    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> Result<i64>;
    async fn decr(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Enumerate keys matching a glob pattern (`*` and `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
    async fn delete_many(&self, keys: &[String]) -> Result<usize>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<usize>;
    async fn zcard(&self, key: &str) -> Result<usize>;

    async fn sliding_window_hit(
        &self,
        key: &str,
        now: f64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowHit>;

    async fn token_bucket_take(
        &self,
        key: &str,
        now: f64,
        capacity: f64,
        refill_per_sec: f64,
        requested: f64,
    ) -> Result<BucketTake>;

    async fn fixed_window_hit(&self, key: &str, window: Duration, limit: u64) -> Result<WindowHit>;

    /// Release the connection. Only the resilience manager calls this.
    async fn close(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Translate a store glob into an anchored regex.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re).map_err(|e| {
        crate::Error::configuration_with_context(
            format!("invalid key pattern '{}'", pattern),
            crate::ErrorContext::new()
                .with_details(e.to_string())
                .with_source("counter_store"),
        )
    })
}

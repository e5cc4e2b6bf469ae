//! Primary store with a process-local fallback.

use super::{BucketTake, CounterStore, MemoryStore, WindowHit};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Route a call to the primary store while it is healthy, otherwise to the
/// local store. A primary failure flips the store into degraded mode.
macro_rules! failover {
    ($self:ident, $store:ident => $call:expr) => {{
        if let Some($store) = $self.active() {
            match $call.await {
                Ok(v) => return Ok(v),
                Err(e) => $self.degrade(&e),
            }
        }
        let $store = &$self.local;
        $call.await
    }};
}

/// Counter store that never fails callers because the shared store is down.
///
/// Counting becomes process-local after the first primary failure; the
/// failure is logged once. [`FailoverStore::try_reconnect`] switches back.
pub struct FailoverStore {
    primary: Option<Arc<dyn CounterStore>>,
    local: MemoryStore,
    degraded: AtomicBool,
}

impl FailoverStore {
    pub fn new(primary: Option<Arc<dyn CounterStore>>) -> Self {
        let degraded = primary.is_none();
        Self {
            primary,
            local: MemoryStore::new(),
            degraded: AtomicBool::new(degraded),
        }
    }

    /// Process-local only; used when no shared store is configured.
    pub fn local_only() -> Self {
        Self::new(None)
    }

    /// Ping the primary; on failure start in degraded mode.
    pub async fn connect(primary: Option<Arc<dyn CounterStore>>) -> Self {
        let store = Self::new(primary);
        if let Some(primary) = store.primary.as_ref() {
            match primary.ping().await {
                Ok(()) => info!(store = primary.name(), "Connected to shared counter store"),
                Err(e) => store.degrade(&e),
            }
        }
        store
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// True when a primary store is configured and currently in use.
    pub fn is_connected(&self) -> bool {
        self.primary.is_some() && !self.is_degraded()
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Re-check the primary and leave degraded mode if it answers.
    pub async fn try_reconnect(&self) -> bool {
        let Some(primary) = self.primary.as_ref() else {
            return false;
        };
        if !self.is_degraded() {
            return true;
        }
        match primary.ping().await {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
                info!(store = primary.name(), "Shared counter store reachable again");
                true
            }
            Err(_) => false,
        }
    }

    fn active(&self) -> Option<&Arc<dyn CounterStore>> {
        if self.is_degraded() {
            None
        } else {
            self.primary.as_ref()
        }
    }

    fn degrade(&self, err: &Error) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                error = %err,
                "Shared counter store unavailable; counting is process-local until reconnect"
            );
        }
    }
}

#[async_trait]
impl CounterStore for FailoverStore {
    async fn ping(&self) -> Result<()> {
        match self.primary.as_ref() {
            Some(p) => p.ping().await,
            None => Err(Error::store_with_context(
                "no shared counter store configured",
                crate::ErrorContext::new().with_source("failover_store"),
            )),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        failover!(self, s => s.get(key))
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<()> {
        failover!(self, s => s.set(key, value, ttl))
    }

    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> Result<i64> {
        failover!(self, s => s.incr(key, ttl_on_create))
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        failover!(self, s => s.decr(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        failover!(self, s => s.expire(key, ttl))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        failover!(self, s => s.delete(key))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        failover!(self, s => s.keys(pattern))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        failover!(self, s => s.delete_many(keys))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool> {
        failover!(self, s => s.zadd(key, score, member))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        failover!(self, s => s.zrem(key, member))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        failover!(self, s => s.zremrangebyscore(key, min, max))
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        failover!(self, s => s.zcard(key))
    }

    async fn sliding_window_hit(
        &self,
        key: &str,
        now: f64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowHit> {
        failover!(self, s => s.sliding_window_hit(key, now, window, limit))
    }

    async fn token_bucket_take(
        &self,
        key: &str,
        now: f64,
        capacity: f64,
        refill_per_sec: f64,
        requested: f64,
    ) -> Result<BucketTake> {
        failover!(self, s => s.token_bucket_take(key, now, capacity, refill_per_sec, requested))
    }

    async fn fixed_window_hit(&self, key: &str, window: Duration, limit: u64) -> Result<WindowHit> {
        failover!(self, s => s.fixed_window_hit(key, window, limit))
    }

    async fn close(&self) -> Result<()> {
        if let Some(primary) = self.primary.as_ref() {
            primary.close().await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "failover"
    }
}

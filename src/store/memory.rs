//! Process-local counter store.

use super::{glob_to_regex, BucketTake, CounterStore, WindowHit};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Bucket { tokens: f64, last_refill: f64 },
    /// Sorted by score; members are unique.
    ZSet(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }
}

/// In-memory keyspace with TTL support.
///
/// A single lock guards the whole keyspace, so each trait call (including the
/// scripted ones) is atomic with respect to every other call on this store.
/// Expired keys are dropped when touched, and the whole keyspace is swept at
/// most once per [`SWEEP_INTERVAL`] on the next call after it elapses.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    next_sweep: Mutex<Option<Instant>>,
    member_seq: AtomicU64,
}

/// Minimum time between full expiry sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut map = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let mut next = self.next_sweep.lock().unwrap_or_else(|p| p.into_inner());
        match *next {
            Some(at) if now < at => {}
            Some(_) => {
                let before = map.len();
                map.retain(|_, e| !e.is_expired());
                let purged = before - map.len();
                if purged > 0 {
                    trace!(purged, remaining = map.len(), "Swept expired counter keys");
                }
                *next = Some(now + SWEEP_INTERVAL);
            }
            None => *next = Some(now + SWEEP_INTERVAL),
        }
        map
    }

    /// Live (unexpired) entry for `key`, purging it if it has expired.
    fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        if map.get(key).map(Entry::is_expired).unwrap_or(false) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    fn zset<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> &'a mut Vec<(f64, String)> {
        let needs_reset = match Self::live(map, key) {
            Some(Entry {
                value: Value::ZSet(_),
                ..
            }) => false,
            _ => true,
        };
        if needs_reset {
            map.insert(key.to_string(), Entry::new(Value::ZSet(Vec::new()), None));
        }
        match map.get_mut(key).map(|e| &mut e.value) {
            Some(Value::ZSet(set)) => set,
            _ => unreachable!("zset entry inserted above"),
        }
    }

    fn insert_sorted(set: &mut Vec<(f64, String)>, score: f64, member: String) {
        let idx = set.partition_point(|(s, _)| *s <= score);
        set.insert(idx, (score, member));
    }

    /// Number of live keys (testing and diagnostics).
    pub fn len(&self) -> usize {
        let mut map = self.lock();
        map.retain(|_, e| !e.is_expired());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut map = self.lock();
        Ok(match Self::live(&mut map, key) {
            Some(Entry {
                value: Value::Int(v),
                ..
            }) => Some(*v),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<()> {
        self.lock()
            .insert(key.to_string(), Entry::new(Value::Int(value), ttl));
        Ok(())
    }

    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> Result<i64> {
        let mut map = self.lock();
        if let Some(Entry {
            value: Value::Int(v),
            ..
        }) = Self::live(&mut map, key)
        {
            *v += 1;
            return Ok(*v);
        }
        map.insert(key.to_string(), Entry::new(Value::Int(1), ttl_on_create));
        Ok(1)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut map = self.lock();
        if let Some(Entry {
            value: Value::Int(v),
            ..
        }) = Self::live(&mut map, key)
        {
            *v -= 1;
            return Ok(*v);
        }
        map.insert(key.to_string(), Entry::new(Value::Int(-1), None));
        Ok(-1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let re = glob_to_regex(pattern)?;
        let mut map = self.lock();
        map.retain(|_, e| !e.is_expired());
        let mut keys: Vec<String> = map.keys().filter(|k| re.is_match(k)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut map = self.lock();
        Ok(keys.iter().filter(|k| map.remove(k.as_str()).is_some()).count())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool> {
        let mut map = self.lock();
        let set = Self::zset(&mut map, key);
        let existed = if let Some(pos) = set.iter().position(|(_, m)| m == member) {
            set.remove(pos);
            true
        } else {
            false
        };
        Self::insert_sorted(set, score, member.to_string());
        Ok(!existed)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut map = self.lock();
        if let Some(Entry {
            value: Value::ZSet(set),
            ..
        }) = Self::live(&mut map, key)
        {
            if let Some(pos) = set.iter().position(|(_, m)| m == member) {
                set.remove(pos);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        let mut map = self.lock();
        if let Some(Entry {
            value: Value::ZSet(set),
            ..
        }) = Self::live(&mut map, key)
        {
            let before = set.len();
            set.retain(|(s, _)| *s < min || *s > max);
            return Ok(before - set.len());
        }
        Ok(0)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let mut map = self.lock();
        Ok(match Self::live(&mut map, key) {
            Some(Entry {
                value: Value::ZSet(set),
                ..
            }) => set.len(),
            _ => 0,
        })
    }

    async fn sliding_window_hit(
        &self,
        key: &str,
        now: f64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowHit> {
        let member = format!("{:.6}-{}", now, self.member_seq.fetch_add(1, Ordering::Relaxed));
        let mut map = self.lock();
        let set = Self::zset(&mut map, key);

        let cutoff = now - window.as_secs_f64();
        set.retain(|(s, _)| *s > cutoff);
        Self::insert_sorted(set, now, member.clone());
        let count = set.len() as u64;

        let allowed = count <= limit;
        if !allowed {
            if let Some(pos) = set.iter().position(|(_, m)| *m == member) {
                set.remove(pos);
            }
        }
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + window);
        }
        Ok(WindowHit { allowed, count })
    }

    async fn token_bucket_take(
        &self,
        key: &str,
        now: f64,
        capacity: f64,
        refill_per_sec: f64,
        requested: f64,
    ) -> Result<BucketTake> {
        let mut map = self.lock();
        let (mut tokens, last_refill) = match Self::live(&mut map, key) {
            Some(Entry {
                value: Value::Bucket {
                    tokens,
                    last_refill,
                },
                ..
            }) => (*tokens, *last_refill),
            _ => (capacity, now),
        };

        let elapsed = (now - last_refill).max(0.0);
        tokens = (tokens + elapsed * refill_per_sec).min(capacity);

        let allowed = tokens >= requested;
        if allowed {
            tokens -= requested;
        }

        // Idle buckets expire once they would be full again anyway.
        let ttl = if refill_per_sec > 0.0 {
            Duration::from_secs_f64((capacity / refill_per_sec).max(1.0) * 2.0)
        } else {
            Duration::from_secs(3600)
        };
        map.insert(
            key.to_string(),
            Entry::new(
                Value::Bucket {
                    tokens,
                    last_refill: now,
                },
                Some(ttl),
            ),
        );
        Ok(BucketTake { allowed, tokens })
    }

    async fn fixed_window_hit(&self, key: &str, window: Duration, limit: u64) -> Result<WindowHit> {
        let mut map = self.lock();
        let count = match Self::live(&mut map, key) {
            Some(Entry {
                value: Value::Int(v),
                ..
            }) => {
                *v += 1;
                *v
            }
            _ => {
                map.insert(key.to_string(), Entry::new(Value::Int(1), Some(window)));
                1
            }
        };
        let count = count.max(0) as u64;
        let allowed = count <= limit;
        if !allowed {
            if let Some(Entry {
                value: Value::Int(v),
                ..
            }) = map.get_mut(key)
            {
                *v -= 1;
            }
        }
        Ok(WindowHit { allowed, count })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

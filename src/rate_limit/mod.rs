//! 限流模块：基于共享计数存储的三窗口准入控制。
//!
//! # Rate Limiter
//!
//! Admission decision per (client, route, window). A request resolves the first
//! matching [`RateLimitRule`] (or the policy default) and is then evaluated
//! against the minute, hour and day windows in that order. The first window
//! whose post-increment count exceeds its ceiling denies immediately; its own
//! increment is rolled back and later windows are not evaluated.
//!
//! Counting happens inside the [`CounterStore`](crate::store::CounterStore) as a
//! single scripted operation, so concurrent processes sharing the store see
//! correct aggregate counts without any process-local locking.
//!
//! ```rust
//! use call_resilience::rate_limit::{RateLimiter, RateLimitConfig, RateLimitPolicy};
//! use call_resilience::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> call_resilience::Result<()> {
//! let policy = RateLimitPolicy {
//!     default: RateLimitConfig::new().with_requests_per_minute(5),
//!     ..Default::default()
//! };
//! let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), policy)?;
//! let result = limiter.check("client-1", "/api/calls", Some("POST"), None).await;
//! assert!(result.allowed);
//! assert_eq!(result.remaining, 4);
//! # Ok(())
//! # }
//! ```

mod config;

pub use config::{RateAlgorithm, RateLimitConfig, RateLimitPolicy, RateLimitRule, RateWindow};

use crate::store::CounterStore;
use crate::{Error, ErrorContext, Result};
use regex::Regex;
use serde::Serialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of one admission check. Ephemeral.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Usage in the reported window, including this request.
    pub current_usage: u64,
    /// Ceiling of the reported window; `None` when no window applied.
    pub limit: Option<u64>,
    pub remaining: u64,
    /// Unix time (seconds) when the reported window frees capacity.
    pub reset_time: f64,
    /// Set on denial.
    pub retry_after: Option<u64>,
    /// Window that denied the request.
    pub limit_type: Option<RateWindow>,
}

impl RateLimitResult {
    fn unlimited(now: f64) -> Self {
        Self {
            allowed: true,
            current_usage: 0,
            limit: None,
            remaining: u64::MAX,
            reset_time: now,
            retry_after: None,
            limit_type: None,
        }
    }

    /// Convert a denial into [`Error::AdmissionDenied`].
    pub fn into_result(self) -> Result<Self> {
        match (self.allowed, self.limit_type) {
            (false, Some(window)) => Err(Error::AdmissionDenied {
                limit_type: window,
                retry_after: self.retry_after.unwrap_or_else(|| window.retry_after()),
            }),
            _ => Ok(self),
        }
    }
}

/// Wall-clock seconds derived from a monotonic anchor.
///
/// Store timestamps must be comparable across processes (Unix time) while
/// staying monotonic inside one process; the tokio clock keeps tests
/// deterministic under paused time.
#[derive(Debug, Clone, Copy)]
struct WindowClock {
    wall_anchor: f64,
    mono_anchor: Instant,
}

impl WindowClock {
    fn new() -> Self {
        let wall_anchor = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            wall_anchor,
            mono_anchor: Instant::now(),
        }
    }

    fn now(&self) -> f64 {
        self.wall_anchor + self.mono_anchor.elapsed().as_secs_f64()
    }
}

#[derive(Debug)]
struct CompiledRule {
    path: Regex,
    method: Option<String>,
    caller_class: Option<String>,
    config: RateLimitConfig,
}

impl CompiledRule {
    fn compile(index: usize, rule: RateLimitRule) -> Result<Self> {
        let path = Regex::new(&format!("^(?:{})", rule.path_pattern)).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid path pattern '{}'", rule.path_pattern),
                ErrorContext::new()
                    .with_field_path(format!("rate_limiting.rules[{}].path_pattern", index))
                    .with_details(e.to_string())
                    .with_source("rate_limiter"),
            )
        })?;
        Ok(Self {
            path,
            method: rule.method.map(|m| m.to_ascii_uppercase()),
            caller_class: rule.caller_class,
            config: rule.config,
        })
    }

    fn matches(&self, path: &str, method: Option<&str>, caller_class: Option<&str>) -> bool {
        if !self.path.is_match(path) {
            return false;
        }
        if let Some(ref want) = self.method {
            match method {
                Some(m) if m.eq_ignore_ascii_case(want) => {}
                _ => return false,
            }
        }
        if let Some(ref want) = self.caller_class {
            if caller_class != Some(want.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Per-window evaluation outcome.
#[derive(Debug, Clone, Copy)]
struct WindowOutcome {
    allowed: bool,
    count: u64,
    limit: u64,
    remaining: u64,
    reset_time: f64,
}

/// Store-backed rate limiter.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    enabled: bool,
    default: RateLimitConfig,
    rules: Vec<CompiledRule>,
    clock: WindowClock,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, policy: RateLimitPolicy) -> Result<Self> {
        let rules = policy
            .rules
            .into_iter()
            .enumerate()
            .map(|(i, r)| CompiledRule::compile(i, r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            store,
            enabled: policy.enabled,
            default: policy.default,
            rules,
            clock: WindowClock::new(),
        })
    }

    /// Register another rule after the existing ones.
    pub fn with_rule(mut self, rule: RateLimitRule) -> Result<Self> {
        let index = self.rules.len();
        self.rules.push(CompiledRule::compile(index, rule)?);
        Ok(self)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Config that applies to a request: first matching rule, else the default.
    pub fn resolve(
        &self,
        path: &str,
        method: Option<&str>,
        caller_class: Option<&str>,
    ) -> &RateLimitConfig {
        self.rules
            .iter()
            .find(|r| r.matches(path, method, caller_class))
            .map(|r| &r.config)
            .unwrap_or(&self.default)
    }

    /// Admission check for one request.
    pub async fn check(
        &self,
        client_id: &str,
        path: &str,
        method: Option<&str>,
        caller_class: Option<&str>,
    ) -> RateLimitResult {
        let now = self.clock.now();
        if !self.enabled {
            return RateLimitResult::unlimited(now);
        }

        let config = self.resolve(path, method, caller_class);
        if config.bypass_internal && caller_class == Some("internal") {
            return RateLimitResult::unlimited(now);
        }

        // Most restrictive passing window is the one reported on success.
        let mut reported: Option<(RateWindow, WindowOutcome)> = None;

        for window in RateWindow::ALL {
            let Some(limit) = config.ceiling(window) else {
                continue;
            };
            let key = Self::window_key(client_id, path, config.algorithm, window);
            let outcome = match self.hit(config, &key, window, limit, now).await {
                Ok(o) => o,
                Err(e) => {
                    // Fail open: a broken store must not reject every request.
                    warn!(error = %e, key = %key, "Rate limit check failed; admitting request");
                    continue;
                }
            };

            if !outcome.allowed {
                debug!(
                    client_id = client_id,
                    path = path,
                    limit_type = window.as_str(),
                    count = outcome.count,
                    limit = outcome.limit,
                    "Rate limit exceeded"
                );
                return RateLimitResult {
                    allowed: false,
                    current_usage: outcome.count,
                    limit: Some(outcome.limit),
                    remaining: 0,
                    reset_time: outcome.reset_time,
                    retry_after: Some(window.retry_after()),
                    limit_type: Some(window),
                };
            }

            let tighter = reported
                .map(|(_, r)| outcome.remaining < r.remaining)
                .unwrap_or(true);
            if tighter {
                reported = Some((window, outcome));
            }
        }

        match reported {
            Some((_, o)) => RateLimitResult {
                allowed: true,
                current_usage: o.count,
                limit: Some(o.limit),
                remaining: o.remaining,
                reset_time: o.reset_time,
                retry_after: None,
                limit_type: None,
            },
            None => RateLimitResult::unlimited(now),
        }
    }

    /// Like [`check`](Self::check), but a denial is returned as [`Error::AdmissionDenied`].
    pub async fn check_or_deny(
        &self,
        client_id: &str,
        path: &str,
        method: Option<&str>,
        caller_class: Option<&str>,
    ) -> Result<RateLimitResult> {
        self.check(client_id, path, method, caller_class)
            .await
            .into_result()
    }

    /// Delete a client's counters, for every path or only `path`.
    pub async fn reset_client_limits(&self, client_id: &str, path: Option<&str>) -> Result<usize> {
        let pattern = match path {
            Some(p) => format!("rl:{}:{}:*", key_segment(client_id), key_segment(p)),
            None => format!("rl:{}:*", key_segment(client_id)),
        };
        let keys = self.store.keys(&pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete_many(&keys).await?;
        debug!(client_id = client_id, removed = removed, "Reset client rate limits");
        Ok(removed)
    }

    fn window_key(
        client_id: &str,
        path: &str,
        algorithm: RateAlgorithm,
        window: RateWindow,
    ) -> String {
        format!(
            "rl:{}:{}:{}:{}",
            key_segment(client_id),
            key_segment(path),
            algorithm.key_suffix(),
            window.key_suffix()
        )
    }

    async fn hit(
        &self,
        config: &RateLimitConfig,
        key: &str,
        window: RateWindow,
        limit: u64,
        now: f64,
    ) -> Result<WindowOutcome> {
        let window_secs = window.secs() as f64;
        match config.algorithm {
            RateAlgorithm::SlidingWindow => {
                let hit = self
                    .store
                    .sliding_window_hit(key, now, window.duration(), limit)
                    .await?;
                Ok(WindowOutcome {
                    allowed: hit.allowed,
                    count: hit.count,
                    limit,
                    remaining: limit.saturating_sub(hit.count),
                    reset_time: now + window_secs,
                })
            }
            RateAlgorithm::TokenBucket => {
                let capacity = (limit + u64::from(config.burst_size)) as f64;
                let refill = limit as f64 / window_secs;
                let take = self
                    .store
                    .token_bucket_take(key, now, capacity, refill, 1.0)
                    .await?;
                let remaining = take.tokens.floor().max(0.0) as u64;
                let used = (capacity - take.tokens).ceil().max(0.0) as u64;
                let until_next = if take.tokens >= 1.0 {
                    0.0
                } else {
                    (1.0 - take.tokens) / refill
                };
                Ok(WindowOutcome {
                    allowed: take.allowed,
                    count: if take.allowed { used } else { used + 1 },
                    limit: capacity as u64,
                    remaining,
                    reset_time: now + until_next,
                })
            }
            RateAlgorithm::FixedWindow => {
                let bucket = (now / window_secs).floor() as u64;
                let bucket_key = format!("{}:{}", key, bucket);
                let hit = self
                    .store
                    .fixed_window_hit(&bucket_key, window.duration(), limit)
                    .await?;
                Ok(WindowOutcome {
                    allowed: hit.allowed,
                    count: hit.count,
                    limit,
                    remaining: limit.saturating_sub(hit.count),
                    reset_time: (bucket + 1) as f64 * window_secs,
                })
            }
        }
    }
}

/// Percent-encode the characters that separate key segments or act as glob
/// wildcards, so a client or path prefix never matches a longer one.
fn key_segment(raw: &str) -> Cow<'_, str> {
    const RESERVED: [char; 7] = ['%', ':', '*', '?', '[', ']', '\\'];
    if !raw.contains(&RESERVED[..]) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        if RESERVED.contains(&ch) {
            out.push_str(&format!("%{:02X}", ch as u32));
        } else {
            out.push(ch);
        }
    }
    Cow::Owned(out)
}

//! Retry ladder
//!
//! Re-runs a failed dependency call with capped exponential backoff. Only
//! failures classified as transient are retried; everything else surfaces on
//! the first attempt wrapped as [`Error::ExternalService`].

use crate::error::{Error, FaultKind};
use crate::policy::duration_from_secs;
use crate::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub exponential_base: f64,
    /// Add up to 10% random delay on top of each backoff.
    pub jitter: bool,
    pub retryable_exceptions: Vec<String>,
    /// Wins over `retryable_exceptions` when a kind is in both.
    pub non_retryable_exceptions: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 60.0,
            exponential_base: 2.0,
            jitter: true,
            retryable_exceptions: ["timeout", "connection", "upstream_unavailable"]
                .into_iter()
                .map(String::from)
                .collect(),
            non_retryable_exceptions: [
                "dependency_unavailable",
                "admission_denied",
                "capacity_exceeded",
                "cancelled",
                "validation",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay_secs = d.as_secs_f64();
        self
    }

    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay_secs = d.as_secs_f64();
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_exceptions = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_non_retryable<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_retryable_exceptions = kinds.into_iter().map(Into::into).collect();
        self
    }
}

/// Whether an HTTP-like status is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

#[derive(Debug, Clone)]
pub struct RetryLadder {
    cfg: RetryConfig,
}

impl RetryLadder {
    pub fn new(cfg: RetryConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.cfg
    }

    /// Classify a failure. Cancellation is never retried.
    pub fn should_retry<E: FaultKind + ?Sized>(&self, err: &E) -> bool {
        if err.is_cancellation() {
            return false;
        }
        let kind = err.kind();
        if self.cfg.non_retryable_exceptions.iter().any(|k| **k == *kind) {
            return false;
        }
        if self.cfg.retryable_exceptions.iter().any(|k| **k == *kind) {
            return true;
        }
        err.http_status().map(is_retryable_status).unwrap_or(false)
    }

    /// Backoff before attempt `attempt` (1-based), without jitter.
    ///
    /// The first attempt never waits; attempt n waits
    /// `min(max_delay, base_delay * exponential_base^(n-1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let raw = self.cfg.base_delay_secs * self.cfg.exponential_base.powi((attempt - 1) as i32);
        duration_from_secs(raw.min(self.cfg.max_delay_secs))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.cfg.jitter || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * 0.1;
        delay + Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=spread))
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    pub async fn run<F, Fut, T, E>(&self, service: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: FaultKind + std::error::Error + Send + Sync + 'static,
    {
        let max_attempts = self.cfg.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(service, attempt, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if err.is_cancellation() {
                return Err(Error::Cancelled {
                    operation: service.to_string(),
                });
            }

            if !self.should_retry(&err) {
                debug!(service, attempt, kind = %err.kind(), "Non-retryable failure");
                return Err(exhausted(service, attempt, err));
            }
            if attempt >= max_attempts {
                warn!(service, attempts = attempt, kind = %err.kind(), error = %err, "Retries exhausted");
                return Err(exhausted(service, attempt, err));
            }

            attempt += 1;
            let delay = self.jittered(self.delay_for_attempt(attempt));
            debug!(
                service,
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind(),
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn exhausted<E>(service: &str, attempts: u32, cause: E) -> Error
where
    E: FaultKind + std::error::Error + Send + Sync + 'static,
{
    Error::ExternalService {
        service: service.to_string(),
        attempts,
        kind: cause.kind().into_owned(),
        source: Box::new(cause),
    }
}

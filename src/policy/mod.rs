//! 静态策略：启动时加载一次的限流规则、熔断器、背压与重试配置。
//!
//! # Static Policy
//!
//! A [`ResiliencePolicy`] is the YAML document the manager is built from:
//!
//! ```yaml
//! rate_limiting:
//!   enabled: true
//!   default: { requests_per_minute: 60 }
//!   rules:
//!     - path_pattern: "/webhooks/"
//!       config: { requests_per_minute: 300, algorithm: fixed_window }
//! circuit_breakers:
//!   pms_connector: { failure_threshold: 5, recovery_timeout_secs: 60 }
//! backpressure:
//!   audio_processing: { max_queue_size: 500, strategy: drop_oldest }
//! retries:
//!   pms: { max_attempts: 3, base_delay_secs: 1.0 }
//! ```
//!
//! Every field is optional. The profile named by `RESILIENCE_ENV` is applied
//! on top (see [`Environment`]), and the result is validated as a whole.

mod environment;

pub use environment::{Environment, ENV_VAR};

use crate::backpressure::{BackpressureConfig, BackpressureStrategy};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limit::{RateAlgorithm, RateLimitConfig, RateLimitPolicy, RateLimitRule};
use crate::retry::RetryConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variable pointing at a policy YAML file.
pub const POLICY_PATH_VAR: &str = "RESILIENCE_POLICY_PATH";

/// Retry class used when a service has no class of its own.
pub const DEFAULT_RETRY_CLASS: &str = "default";

const TOO_LONG: &str = "must be between 0 and one year (seconds)";

/// Upper bound for every `*_secs` policy field (one year).
pub const MAX_DURATION_SECS: f64 = 365.0 * 24.0 * 3_600.0;

/// Policy seconds as a `Duration`, clamped to `[0, MAX_DURATION_SECS]`.
pub(crate) fn duration_from_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.min(MAX_DURATION_SECS))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResiliencePolicy {
    pub rate_limiting: RateLimitPolicy,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerConfig>,
    pub backpressure: BTreeMap<String, BackpressureConfig>,
    /// Retry settings per service class.
    pub retries: BTreeMap<String, RetryConfig>,
    /// Template for breakers created on demand for unlisted names.
    pub default_circuit_breaker: CircuitBreakerConfig,
    /// Template for handlers created on demand for unlisted names.
    pub default_backpressure: BackpressureConfig,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        let rate_limiting = RateLimitPolicy {
            enabled: true,
            default: RateLimitConfig::default(),
            rules: vec![
                RateLimitRule::new(
                    "/health",
                    RateLimitConfig::new()
                        .with_requests_per_minute(0)
                        .with_requests_per_hour(0)
                        .with_requests_per_day(0),
                ),
                RateLimitRule::new(
                    "/webhooks/",
                    RateLimitConfig::new()
                        .with_requests_per_minute(300)
                        .with_requests_per_hour(10_000)
                        .with_requests_per_day(100_000)
                        .with_algorithm(RateAlgorithm::FixedWindow),
                ),
                RateLimitRule::new(
                    "/api/v1/calls",
                    RateLimitConfig::new()
                        .with_requests_per_minute(30)
                        .with_requests_per_hour(500)
                        .with_requests_per_day(5_000)
                        .with_burst_size(5)
                        .with_algorithm(RateAlgorithm::TokenBucket),
                )
                .with_method("POST"),
            ],
        };

        let transient = ["timeout", "connection", "upstream_unavailable"];
        let breaker = |name: &str, failures: u32, recovery: f64, successes: u32, timeout: f64| {
            let cfg = CircuitBreakerConfig {
                name: name.to_string(),
                failure_threshold: failures,
                recovery_timeout_secs: recovery,
                success_threshold: successes,
                timeout_secs: timeout,
                expected_exceptions: Vec::new(),
            };
            (name.to_string(), cfg.with_expected_exceptions(transient))
        };
        let circuit_breakers = BTreeMap::from([
            breaker("pms_connector", 5, 60.0, 3, 30.0),
            breaker("tts_service", 3, 30.0, 2, 10.0),
            breaker("media_server", 3, 30.0, 2, 5.0),
            breaker("secret_store", 5, 120.0, 3, 10.0),
        ]);

        let handler = |name: &str, queue: usize, memory: f64, strategy, timeout: f64, task: f64| {
            (
                name.to_string(),
                BackpressureConfig {
                    max_queue_size: queue,
                    max_memory_mb: memory,
                    strategy,
                    timeout_secs: timeout,
                    task_memory_mb: task,
                    ..BackpressureConfig::default()
                },
            )
        };
        let backpressure = BTreeMap::from([
            handler("audio_processing", 500, 256.0, BackpressureStrategy::DropOldest, 10.0, 2.0),
            handler("tts_synthesis", 200, 512.0, BackpressureStrategy::Adaptive, 30.0, 4.0),
            handler("webhook_delivery", 1_000, 128.0, BackpressureStrategy::Block, 5.0, 0.1),
        ]);

        let retry = |attempts: u32, base: f64, max: f64| RetryConfig {
            max_attempts: attempts,
            base_delay_secs: base,
            max_delay_secs: max,
            ..RetryConfig::default()
        };
        let retries = BTreeMap::from([
            ("pms".to_string(), retry(3, 1.0, 30.0)),
            ("tts".to_string(), retry(2, 0.5, 5.0)),
            ("webhook".to_string(), retry(5, 2.0, 300.0)),
            (DEFAULT_RETRY_CLASS.to_string(), RetryConfig::default()),
        ]);

        Self {
            rate_limiting,
            circuit_breakers,
            backpressure,
            retries,
            default_circuit_breaker: CircuitBreakerConfig::default(),
            default_backpressure: BackpressureConfig::default(),
        }
    }
}

impl ResiliencePolicy {
    /// Parse a YAML policy document. Missing sections keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut policy: Self = serde_yaml::from_str(yaml)?;
        policy.normalize();
        Ok(policy)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Load the effective policy for this process.
    ///
    /// Reads `RESILIENCE_POLICY_PATH` if set (built-in defaults otherwise),
    /// applies the `RESILIENCE_ENV` profile, and validates the result.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var(POLICY_PATH_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        let env = Environment::from_env();
        let policy = env.apply(&base);
        policy.validate()?;
        info!(
            environment = env.as_str(),
            rules = policy.rate_limiting.rules.len(),
            breakers = policy.circuit_breakers.len(),
            handlers = policy.backpressure.len(),
            "Loaded resilience policy"
        );
        Ok(policy)
    }

    /// Map keys name the breakers.
    fn normalize(&mut self) {
        for (name, cfg) in self.circuit_breakers.iter_mut() {
            cfg.name = name.clone();
        }
    }

    /// Config for breaker `name`, from the policy or the default template.
    pub fn breaker_config(&self, name: &str) -> CircuitBreakerConfig {
        match self.circuit_breakers.get(name) {
            Some(cfg) => cfg.clone(),
            None => CircuitBreakerConfig {
                name: name.to_string(),
                ..self.default_circuit_breaker.clone()
            },
        }
    }

    pub fn backpressure_config(&self, name: &str) -> BackpressureConfig {
        self.backpressure
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_backpressure.clone())
    }

    /// Retry settings for `class`, falling back to the `default` class.
    pub fn retry_config(&self, class: &str) -> RetryConfig {
        self.retries
            .get(class)
            .or_else(|| self.retries.get(DEFAULT_RETRY_CLASS))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn scale_rate_limits(&mut self, factor: f64) {
        let rl = &mut self.rate_limiting;
        rl.default = rl.default.scaled(factor);
        for rule in rl.rules.iter_mut() {
            rule.config = rule.config.scaled(factor);
        }
    }

    pub(crate) fn scale_backpressure(&mut self, factor: f64) {
        self.default_backpressure = self.default_backpressure.scaled(factor);
        for cfg in self.backpressure.values_mut() {
            *cfg = cfg.scaled(factor);
        }
    }

    pub(crate) fn scale_breakers(&mut self, threshold_factor: f64, recovery_factor: f64) {
        let scale = |cfg: &mut CircuitBreakerConfig| {
            cfg.failure_threshold =
                ((cfg.failure_threshold as f64) * threshold_factor).round().max(1.0) as u32;
            cfg.recovery_timeout_secs *= recovery_factor;
        };
        scale(&mut self.default_circuit_breaker);
        for cfg in self.circuit_breakers.values_mut() {
            scale(cfg);
        }
    }

    /// Every problem in the policy, as `(field_path, message)`.
    ///
    /// Durations must lie in `[0, MAX_DURATION_SECS]`.
    pub fn problems(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut push = |path: String, msg: &str| out.push((path, msg.to_string()));

        for (i, rule) in self.rate_limiting.rules.iter().enumerate() {
            let path = format!("rate_limiting.rules[{}]", i);
            if let Err(e) = regex::Regex::new(&rule.path_pattern) {
                push(format!("{}.path_pattern", path), &format!("invalid regex: {}", e));
            }
            if rule.method.as_deref().map(str::is_empty).unwrap_or(false) {
                push(format!("{}.method", path), "must not be empty");
            }
        }

        let breakers = std::iter::once(("default_circuit_breaker".to_string(), &self.default_circuit_breaker))
            .chain(
                self.circuit_breakers
                    .iter()
                    .map(|(name, cfg)| (format!("circuit_breakers.{}", name), cfg)),
            );
        for (path, cfg) in breakers {
            if cfg.failure_threshold == 0 {
                push(format!("{}.failure_threshold", path), "must be at least 1");
            }
            if cfg.success_threshold == 0 {
                push(format!("{}.success_threshold", path), "must be at least 1");
            }
            if !(0.0..=MAX_DURATION_SECS).contains(&cfg.recovery_timeout_secs) {
                push(format!("{}.recovery_timeout_secs", path), TOO_LONG);
            }
            if !(cfg.timeout_secs.is_finite() && cfg.timeout_secs <= MAX_DURATION_SECS) {
                push(format!("{}.timeout_secs", path), "must be a number of at most one year");
            }
        }

        let handlers = std::iter::once(("default_backpressure".to_string(), &self.default_backpressure))
            .chain(
                self.backpressure
                    .iter()
                    .map(|(name, cfg)| (format!("backpressure.{}", name), cfg)),
            );
        for (path, cfg) in handlers {
            if cfg.max_queue_size == 0 {
                push(format!("{}.max_queue_size", path), "must be at least 1");
            }
            if !(cfg.max_memory_mb > 0.0) {
                push(format!("{}.max_memory_mb", path), "must be positive");
            }
            if !(0.0..=MAX_DURATION_SECS).contains(&cfg.timeout_secs) {
                push(format!("{}.timeout_secs", path), TOO_LONG);
            }
            for (field, ratio) in [
                ("warning_threshold", cfg.warning_threshold),
                ("adaptive_threshold", cfg.adaptive_threshold),
            ] {
                if !(ratio > 0.0 && ratio <= 1.0) {
                    push(format!("{}.{}", path, field), "must be in (0, 1]");
                }
            }
            if !(cfg.task_memory_mb >= 0.0) {
                push(format!("{}.task_memory_mb", path), "must be non-negative");
            }
        }

        for (class, cfg) in &self.retries {
            let path = format!("retries.{}", class);
            if cfg.max_attempts == 0 {
                push(format!("{}.max_attempts", path), "must be at least 1");
            }
            if !(0.0..=MAX_DURATION_SECS).contains(&cfg.base_delay_secs) {
                push(format!("{}.base_delay_secs", path), TOO_LONG);
            }
            if !(cfg.max_delay_secs >= cfg.base_delay_secs) {
                push(format!("{}.max_delay_secs", path), "must be at least base_delay_secs");
            } else if cfg.max_delay_secs > MAX_DURATION_SECS {
                push(format!("{}.max_delay_secs", path), TOO_LONG);
            }
            if !(cfg.exponential_base >= 1.0) {
                push(format!("{}.exponential_base", path), "must be at least 1.0");
            }
        }

        out
    }

    /// Fail with every problem at once; the context points at the first.
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        let Some((first_path, _)) = problems.first() else {
            return Ok(());
        };
        let details = problems
            .iter()
            .map(|(path, msg)| format!("{}: {}", path, msg))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::configuration_with_context(
            format!("{} invalid policy value(s)", problems.len()),
            ErrorContext::new()
                .with_field_path(first_path.clone())
                .with_details(details)
                .with_source("policy_validator"),
        ))
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One of the three nested rate windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateWindow {
    #[serde(rename = "requests_per_minute")]
    Minute,
    #[serde(rename = "requests_per_hour")]
    Hour,
    #[serde(rename = "requests_per_day")]
    Day,
}

impl RateWindow {
    /// Evaluation order: narrowest window first.
    pub const ALL: [RateWindow; 3] = [RateWindow::Minute, RateWindow::Hour, RateWindow::Day];

    pub fn duration(self) -> Duration {
        Duration::from_secs(self.secs())
    }

    pub fn secs(self) -> u64 {
        match self {
            RateWindow::Minute => 60,
            RateWindow::Hour => 3_600,
            RateWindow::Day => 86_400,
        }
    }

    /// Coarse retry hint returned with a denial in this window.
    pub fn retry_after(self) -> u64 {
        match self {
            RateWindow::Minute => 60,
            RateWindow::Hour => 300,
            RateWindow::Day => 3_600,
        }
    }

    /// Key suffix used in the counter store.
    pub fn key_suffix(self) -> &'static str {
        match self {
            RateWindow::Minute => "minute",
            RateWindow::Hour => "hour",
            RateWindow::Day => "day",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RateWindow::Minute => "requests_per_minute",
            RateWindow::Hour => "requests_per_hour",
            RateWindow::Day => "requests_per_day",
        }
    }
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counting algorithm, selected per config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateAlgorithm {
    /// Exact: one timestamp per admitted request, purged as it leaves the window.
    #[default]
    SlidingWindow,
    /// Continuous refill at `ceiling / window` tokens per second.
    TokenBucket,
    /// One counter per aligned window; may admit up to 2x at boundaries.
    FixedWindow,
}

impl RateAlgorithm {
    /// Key segment; each algorithm stores a different value type.
    pub fn key_suffix(self) -> &'static str {
        match self {
            RateAlgorithm::SlidingWindow => "sliding",
            RateAlgorithm::TokenBucket => "bucket",
            RateAlgorithm::FixedWindow => "fixed",
        }
    }
}

/// Ceilings for the three nested windows.
///
/// A ceiling `<= 0` disables that window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: i64,
    pub requests_per_hour: i64,
    pub requests_per_day: i64,
    /// Extra token-bucket capacity above the window ceiling.
    pub burst_size: u32,
    pub algorithm: RateAlgorithm,
    /// Skip every check for callers of class "internal".
    pub bypass_internal: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1_000,
            requests_per_day: 10_000,
            burst_size: 10,
            algorithm: RateAlgorithm::SlidingWindow,
            bypass_internal: true,
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requests_per_minute(mut self, n: i64) -> Self {
        self.requests_per_minute = n;
        self
    }

    pub fn with_requests_per_hour(mut self, n: i64) -> Self {
        self.requests_per_hour = n;
        self
    }

    pub fn with_requests_per_day(mut self, n: i64) -> Self {
        self.requests_per_day = n;
        self
    }

    pub fn with_burst_size(mut self, n: u32) -> Self {
        self.burst_size = n;
        self
    }

    pub fn with_algorithm(mut self, algorithm: RateAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_bypass_internal(mut self, bypass: bool) -> Self {
        self.bypass_internal = bypass;
        self
    }

    /// Active ceiling for `window`, or `None` when that window is disabled.
    pub fn ceiling(&self, window: RateWindow) -> Option<u64> {
        let raw = match window {
            RateWindow::Minute => self.requests_per_minute,
            RateWindow::Hour => self.requests_per_hour,
            RateWindow::Day => self.requests_per_day,
        };
        (raw > 0).then_some(raw as u64)
    }

    /// Multiply every enabled ceiling, keeping at least 1.
    pub fn scaled(&self, factor: f64) -> Self {
        let scale = |n: i64| {
            if n <= 0 {
                n
            } else {
                ((n as f64) * factor).round().max(1.0) as i64
            }
        };
        Self {
            requests_per_minute: scale(self.requests_per_minute),
            requests_per_hour: scale(self.requests_per_hour),
            requests_per_day: scale(self.requests_per_day),
            ..self.clone()
        }
    }
}

/// Predicate selecting a [`RateLimitConfig`] for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Regex matched against the start of the request path.
    pub path_pattern: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub caller_class: Option<String>,
    #[serde(default)]
    pub config: RateLimitConfig,
}

impl RateLimitRule {
    pub fn new(path_pattern: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            path_pattern: path_pattern.into(),
            method: None,
            caller_class: None,
            config,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_caller_class(mut self, class: impl Into<String>) -> Self {
        self.caller_class = Some(class.into());
        self
    }
}

/// Rate limiting section of the static policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    /// Applied when no rule matches.
    pub default: RateLimitConfig,
    /// Evaluated in order; first match wins.
    pub rules: Vec<RateLimitRule>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            default: RateLimitConfig::default(),
            rules: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_ceilings() {
        let cfg = RateLimitConfig::new()
            .with_requests_per_minute(0)
            .with_requests_per_hour(-1)
            .with_requests_per_day(5);
        assert_eq!(cfg.ceiling(RateWindow::Minute), None);
        assert_eq!(cfg.ceiling(RateWindow::Hour), None);
        assert_eq!(cfg.ceiling(RateWindow::Day), Some(5));
    }

    #[test]
    fn test_scaled_keeps_disabled_and_minimum() {
        let cfg = RateLimitConfig::new()
            .with_requests_per_minute(1)
            .with_requests_per_hour(0)
            .with_requests_per_day(100);
        let tight = cfg.scaled(0.2);
        assert_eq!(tight.requests_per_minute, 1);
        assert_eq!(tight.requests_per_hour, 0);
        assert_eq!(tight.requests_per_day, 20);
    }

    #[test]
    fn test_window_names_and_retry_hints() {
        assert_eq!(RateWindow::Minute.to_string(), "requests_per_minute");
        assert_eq!(RateWindow::Minute.retry_after(), 60);
        assert_eq!(RateWindow::Hour.retry_after(), 300);
        assert_eq!(RateWindow::Day.retry_after(), 3600);
    }

    #[test]
    fn test_policy_deserializes_from_yaml() {
        let yaml = r#"
enabled: true
default:
  requests_per_minute: 30
rules:
  - path_pattern: "/webhooks/"
    method: POST
    config:
      requests_per_minute: 120
      algorithm: token_bucket
"#;
        let policy: RateLimitPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.default.requests_per_minute, 30);
        assert_eq!(policy.default.requests_per_hour, 1_000);
        assert_eq!(policy.rules.len(), 1);
        assert_eq!(policy.rules[0].method.as_deref(), Some("POST"));
        assert_eq!(policy.rules[0].config.algorithm, RateAlgorithm::TokenBucket);
    }
}

use crate::policy::duration_from_secs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What to do with a submission that would overflow the queue or memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Evict the queue head to make room.
    DropOldest,
    /// Reject the new task.
    DropNewest,
    /// Wait for space until the submission timeout.
    Block,
    /// Pick between drop_oldest and block from observed pressure.
    #[default]
    Adaptive,
}

impl BackpressureStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::DropNewest => "drop_newest",
            Self::Block => "block",
            Self::Adaptive => "adaptive",
        }
    }
}

impl FromStr for BackpressureStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop_oldest" => Ok(Self::DropOldest),
            "drop_newest" => Ok(Self::DropNewest),
            "block" => Ok(Self::Block),
            "adaptive" => Ok(Self::Adaptive),
            _ => Err(format!(
                "Invalid backpressure strategy '{}'. Valid values: 'drop_oldest', 'drop_newest', 'block', 'adaptive'",
                s
            )),
        }
    }
}

impl fmt::Display for BackpressureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub max_queue_size: usize,
    pub max_memory_mb: f64,
    pub strategy: BackpressureStrategy,
    /// How long a blocked submission waits for space.
    pub timeout_secs: f64,
    /// Queue or memory ratio at which a warning is logged.
    pub warning_threshold: f64,
    /// Both ratios below this make adaptive mode prefer blocking.
    pub adaptive_threshold: f64,
    /// Memory estimate charged per task when the caller gives none.
    pub task_memory_mb: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            max_memory_mb: 512.0,
            strategy: BackpressureStrategy::Adaptive,
            timeout_secs: 30.0,
            warning_threshold: 0.8,
            adaptive_threshold: 0.7,
            task_memory_mb: 1.0,
        }
    }
}

impl BackpressureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn with_max_memory_mb(mut self, mb: f64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn with_strategy(mut self, strategy: BackpressureStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_warning_threshold(mut self, ratio: f64) -> Self {
        self.warning_threshold = ratio;
        self
    }

    pub fn with_adaptive_threshold(mut self, ratio: f64) -> Self {
        self.adaptive_threshold = ratio;
        self
    }

    pub fn with_task_memory_mb(mut self, mb: f64) -> Self {
        self.task_memory_mb = mb;
        self
    }

    pub fn timeout(&self) -> Duration {
        duration_from_secs(self.timeout_secs)
    }

    /// Shrink queue and memory bounds, keeping at least one slot.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            max_queue_size: ((self.max_queue_size as f64) * factor).round().max(1.0) as usize,
            max_memory_mb: self.max_memory_mb * factor,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "drop_oldest".parse::<BackpressureStrategy>().unwrap(),
            BackpressureStrategy::DropOldest
        );
        assert_eq!(
            "BLOCK".parse::<BackpressureStrategy>().unwrap(),
            BackpressureStrategy::Block
        );
        let err = "lifo".parse::<BackpressureStrategy>().unwrap_err();
        assert!(err.contains("Invalid backpressure strategy 'lifo'"));
    }

    #[test]
    fn test_strategy_display_matches_serde() {
        for s in [
            BackpressureStrategy::DropOldest,
            BackpressureStrategy::DropNewest,
            BackpressureStrategy::Block,
            BackpressureStrategy::Adaptive,
        ] {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, format!("\"{}\"", s));
        }
    }

    #[test]
    fn test_scaled_bounds() {
        let cfg = BackpressureConfig::new()
            .with_max_queue_size(100)
            .with_max_memory_mb(1000.0)
            .scaled(0.7);
        assert_eq!(cfg.max_queue_size, 70);
        assert!((cfg.max_memory_mb - 700.0).abs() < 1e-9);

        let tiny = BackpressureConfig::new().with_max_queue_size(1).scaled(0.1);
        assert_eq!(tiny.max_queue_size, 1);
    }
}

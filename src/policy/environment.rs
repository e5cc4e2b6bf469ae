use super::ResiliencePolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment variable selecting the deployment profile.
pub const ENV_VAR: &str = "RESILIENCE_ENV";

/// Deployment profile. Each applies uniform multipliers to a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
    #[default]
    Default,
}

impl Environment {
    /// Read [`ENV_VAR`]; unset or unknown values select `Default`.
    pub fn from_env() -> Self {
        std::env::var(ENV_VAR)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Development => "development",
            Environment::Default => "default",
        }
    }

    /// Scale `policy` for this profile.
    ///
    /// - production: rate ceilings x0.8, queue/memory bounds x0.7, breaker recovery x1.5
    /// - development: rate ceilings x1.5, breaker failure thresholds x2, breaker recovery x0.5
    pub fn apply(self, policy: &ResiliencePolicy) -> ResiliencePolicy {
        let mut out = policy.clone();
        match self {
            Environment::Production => {
                out.scale_rate_limits(0.8);
                out.scale_backpressure(0.7);
                out.scale_breakers(1.0, 1.5);
            }
            Environment::Development => {
                out.scale_rate_limits(1.5);
                out.scale_breakers(2.0, 0.5);
            }
            Environment::Default => {}
        }
        out
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            "default" | "" => Ok(Self::Default),
            other => Err(format!("Unknown environment '{}'", other)),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

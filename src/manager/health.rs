use crate::backpressure::BackpressureStats;
use crate::circuit_breaker::{CircuitBreakerStats, CircuitState};
use serde::Serialize;
use std::collections::BTreeMap;

/// Overall verdict for the monitoring layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    /// Serving, but with reduced guarantees (process-local counting, open
    /// breakers, pressured queues).
    Degraded,
    /// Shut down, or every known dependency is short-circuited.
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    /// A shared store is configured and in use.
    pub connected: bool,
    /// Counting is process-local.
    pub degraded: bool,
    pub has_primary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub rate_limiting_enabled: bool,
    pub rate_limit_rules: usize,
    pub circuit_breakers: usize,
    pub backpressure_handlers: usize,
}

/// Health view: store connectivity, component enablement, per-breaker and
/// per-handler state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: OverallHealth,
    pub store: StoreHealth,
    pub components: ComponentStatus,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStats>,
    pub backpressure: BTreeMap<String, BackpressureStats>,
    pub uptime_secs: f64,
    pub is_shutdown: bool,
}

/// Sums over every breaker and handler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricTotals {
    pub breaker_requests: u64,
    pub breaker_failures: u64,
    pub breaker_successes: u64,
    pub breaker_rejections: u64,
    pub open_breakers: usize,
    pub tasks_processed: u64,
    pub tasks_dropped: u64,
    pub tasks_blocked: u64,
    pub tasks_queued: usize,
}

/// Metrics view in the same shape as [`HealthStatus`], plus totals.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Unix time (seconds) the snapshot was taken.
    pub timestamp: f64,
    pub store: StoreHealth,
    pub components: ComponentStatus,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStats>,
    pub backpressure: BTreeMap<String, BackpressureStats>,
    pub totals: MetricTotals,
}

impl MetricTotals {
    pub(crate) fn collect(
        breakers: &BTreeMap<String, CircuitBreakerStats>,
        handlers: &BTreeMap<String, BackpressureStats>,
    ) -> Self {
        let mut totals = Self::default();
        for b in breakers.values() {
            totals.breaker_requests += b.total_requests;
            totals.breaker_failures += b.total_failures;
            totals.breaker_successes += b.total_successes;
            totals.breaker_rejections += b.total_rejections;
            if b.state == CircuitState::Open {
                totals.open_breakers += 1;
            }
        }
        for h in handlers.values() {
            totals.tasks_processed += h.processed;
            totals.tasks_dropped += h.dropped;
            totals.tasks_blocked += h.blocked;
            totals.tasks_queued += h.queue_size;
        }
        totals
    }
}

/// Derive the overall verdict.
pub(crate) fn assess(
    is_shutdown: bool,
    store: &StoreHealth,
    breakers: &BTreeMap<String, CircuitBreakerStats>,
    handlers: &BTreeMap<String, (BackpressureStats, f64)>,
) -> OverallHealth {
    if is_shutdown {
        return OverallHealth::Unhealthy;
    }
    let open = breakers
        .values()
        .filter(|b| b.state == CircuitState::Open)
        .count();
    if !breakers.is_empty() && open == breakers.len() {
        return OverallHealth::Unhealthy;
    }
    let breaker_trouble = breakers.values().any(|b| b.state != CircuitState::Closed);
    let pressured = handlers.values().any(|(stats, warning)| {
        stats.queue_ratio >= *warning || stats.memory_ratio >= *warning
    });
    if (store.has_primary && store.degraded) || breaker_trouble || pressured {
        OverallHealth::Degraded
    } else {
        OverallHealth::Healthy
    }
}

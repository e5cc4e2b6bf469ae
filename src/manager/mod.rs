//! 弹性管理器：组合根，按名称持有限流器、熔断器、背压处理器与重试配置。
//!
//! # Resilience Manager
//!
//! Owns exactly one [`RateLimiter`], one [`CircuitBreaker`] per dependency
//! name and one [`BackpressureHandler`] per operation name, all built from a
//! [`ResiliencePolicy`]. Names missing from the policy are created on first
//! request from the policy's templates. Instances are process-local and live
//! until [`ResilienceManager::shutdown`].
//!
//! A protected call flows through the layers in this order:
//!
//! ```text
//! rate limiter ─▶ backpressure admission ─▶ retry ladder ─▶ circuit breaker ─▶ op
//! ```
//!
//! Each retry attempt passes the breaker gate, so attempt outcomes feed the
//! breaker's counters and an open breaker ends the ladder early.

mod health;
mod registry;

pub use health::{
    ComponentStatus, HealthStatus, MetricTotals, MetricsSnapshot, OverallHealth, StoreHealth,
};
pub use registry::Registry;

use crate::backpressure::BackpressureHandler;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{Error, FaultKind};
use crate::policy::ResiliencePolicy;
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::retry::RetryLadder;
use crate::store::{CounterStore, FailoverStore};
use crate::Result;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rate-limit identity of the request behind a protected call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitKey {
    pub client_id: String,
    pub path: String,
    pub method: Option<String>,
    pub caller_class: Option<String>,
}

impl RateLimitKey {
    pub fn new(client_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            path: path.into(),
            method: None,
            caller_class: None,
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

/// Which protections [`ResilienceManager::execute_protected`] applies.
#[derive(Debug, Clone, Default)]
pub struct ProtectedCall {
    pub rate_limit: Option<RateLimitKey>,
    /// Circuit breaker name.
    pub breaker: Option<String>,
    /// Retry class name.
    pub retry_class: Option<String>,
    /// Backpressure handler name.
    pub backpressure: Option<String>,
    /// Task id for the backpressure queue; a UUID is generated when absent.
    pub task_id: Option<String>,
    pub memory_mb: Option<f64>,
}

impl ProtectedCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limit(mut self, key: RateLimitKey) -> Self {
        self.rate_limit = Some(key);
        self
    }

    pub fn with_breaker(mut self, name: impl Into<String>) -> Self {
        self.breaker = Some(name.into());
        self
    }

    pub fn with_retry(mut self, class: impl Into<String>) -> Self {
        self.retry_class = Some(class.into());
        self
    }

    pub fn with_backpressure(mut self, name: impl Into<String>) -> Self {
        self.backpressure = Some(name.into());
        self
    }

    pub fn with_task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn with_memory_estimate(mut self, mb: f64) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    fn service_name(&self) -> String {
        self.breaker
            .clone()
            .or_else(|| self.retry_class.clone())
            .or_else(|| self.backpressure.clone())
            .unwrap_or_else(|| "protected_call".to_string())
    }
}

pub struct ResilienceManager {
    policy: ResiliencePolicy,
    store: Arc<FailoverStore>,
    rate_limiter: RateLimiter,
    breakers: Registry<CircuitBreaker>,
    handlers: Registry<BackpressureHandler>,
    started_at: Instant,
    shut_down: AtomicBool,
}

impl ResilienceManager {
    /// Validate `policy`, connect to `store` (degrading to process-local
    /// counting if it does not answer), and build every configured component.
    pub async fn new(
        policy: ResiliencePolicy,
        store: Option<Arc<dyn CounterStore>>,
    ) -> Result<Self> {
        policy.validate()?;
        let store = Arc::new(FailoverStore::connect(store).await);
        let rate_limiter = RateLimiter::new(
            Arc::clone(&store) as Arc<dyn CounterStore>,
            policy.rate_limiting.clone(),
        )?;

        let manager = Self {
            policy,
            store,
            rate_limiter,
            breakers: Registry::new(),
            handlers: Registry::new(),
            started_at: Instant::now(),
            shut_down: AtomicBool::new(false),
        };
        let breaker_names: Vec<String> = manager.policy.circuit_breakers.keys().cloned().collect();
        for name in &breaker_names {
            manager.get_or_create_circuit_breaker(name);
        }
        let handler_names: Vec<String> = manager.policy.backpressure.keys().cloned().collect();
        for name in &handler_names {
            manager.get_or_create_backpressure_handler(name);
        }

        info!(
            store_connected = manager.store.is_connected(),
            rate_limiting = manager.rate_limiter.is_enabled(),
            rules = manager.rate_limiter.rule_count(),
            breakers = manager.breakers.len(),
            handlers = manager.handlers.len(),
            "Resilience manager initialized"
        );
        Ok(manager)
    }

    /// Build from the environment-selected policy.
    pub async fn from_env(store: Option<Arc<dyn CounterStore>>) -> Result<Self> {
        Self::new(ResiliencePolicy::from_env()?, store).await
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn store(&self) -> &FailoverStore {
        &self.store
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub async fn check_rate_limit(
        &self,
        client_id: &str,
        path: &str,
        method: Option<&str>,
        caller_class: Option<&str>,
    ) -> RateLimitResult {
        self.rate_limiter
            .check(client_id, path, method, caller_class)
            .await
    }

    pub fn get_circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    /// Breaker for `name`; repeated calls return the same instance.
    pub fn get_or_create_circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_insert_with(name, || {
            debug!(breaker = name, "Creating circuit breaker");
            CircuitBreaker::new(self.policy.breaker_config(name))
        })
    }

    pub fn get_backpressure_handler(&self, name: &str) -> Option<Arc<BackpressureHandler>> {
        self.handlers.get(name)
    }

    /// Handler for `name`; repeated calls return the same instance.
    pub fn get_or_create_backpressure_handler(&self, name: &str) -> Arc<BackpressureHandler> {
        self.handlers.get_or_insert_with(name, || {
            debug!(handler = name, "Creating backpressure handler");
            BackpressureHandler::new(name, self.policy.backpressure_config(name))
        })
    }

    pub fn retry_ladder(&self, class: &str) -> RetryLadder {
        RetryLadder::new(self.policy.retry_config(class))
    }

    /// Run `op` through breaker `name`.
    pub async fn call_with_breaker<F, Fut, T, E>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: FaultKind + std::error::Error + Send + Sync + 'static,
    {
        self.ensure_running(name)?;
        self.get_or_create_circuit_breaker(name).call(op).await
    }

    /// Run `op` under the retry settings of `class`.
    pub async fn call_with_retry<F, Fut, T, E>(&self, class: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: FaultKind + std::error::Error + Send + Sync + 'static,
    {
        self.ensure_running(class)?;
        self.retry_ladder(class).run(class, op).await
    }

    /// Apply every protection named in `call` around `op`.
    ///
    /// With a backpressure handler the work runs as a queued task; dropping the
    /// returned future cancels that task.
    pub async fn execute_protected<F, Fut, T, E>(&self, call: ProtectedCall, op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: FaultKind + std::error::Error + Send + Sync + 'static,
    {
        let service = call.service_name();
        self.ensure_running(&service)?;

        if let Some(key) = call.rate_limit.as_ref() {
            self.rate_limiter
                .check_or_deny(
                    &key.client_id,
                    &key.path,
                    key.method.as_deref(),
                    key.caller_class.as_deref(),
                )
                .await?;
        }

        let breaker = call
            .breaker
            .as_deref()
            .map(|name| self.get_or_create_circuit_breaker(name));
        let ladder = call.retry_class.as_deref().map(|class| self.retry_ladder(class));
        let work = run_guarded(breaker, ladder, service, op);

        match call.backpressure.as_deref() {
            Some(name) => {
                let handler = self.get_or_create_backpressure_handler(name);
                let task_id = call
                    .task_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let handle = match call.memory_mb {
                    Some(mb) => handler.submit_with_estimate(task_id, mb, work).await?,
                    None => handler.submit(task_id, work).await?,
                };
                handle.join().await?
            }
            None => work.await,
        }
    }

    fn ensure_running(&self, operation: &str) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Cancelled {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    fn store_health(&self) -> StoreHealth {
        StoreHealth {
            connected: self.store.is_connected(),
            degraded: self.store.is_degraded(),
            has_primary: self.store.has_primary(),
        }
    }

    fn component_status(&self) -> ComponentStatus {
        ComponentStatus {
            rate_limiting_enabled: self.rate_limiter.is_enabled(),
            rate_limit_rules: self.rate_limiter.rule_count(),
            circuit_breakers: self.breakers.len(),
            backpressure_handlers: self.handlers.len(),
        }
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let store = self.store_health();
        let circuit_breakers: BTreeMap<_, _> = self
            .breakers
            .entries()
            .into_iter()
            .map(|(name, b)| (name, b.snapshot()))
            .collect();
        let handler_stats: BTreeMap<_, _> = self
            .handlers
            .entries()
            .into_iter()
            .map(|(name, h)| (name, (h.stats(), h.config().warning_threshold)))
            .collect();
        let is_shutdown = self.is_shutdown();
        let status = health::assess(is_shutdown, &store, &circuit_breakers, &handler_stats);

        HealthStatus {
            status,
            store,
            components: self.component_status(),
            circuit_breakers,
            backpressure: handler_stats
                .into_iter()
                .map(|(name, (stats, _))| (name, stats))
                .collect(),
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            is_shutdown,
        }
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let circuit_breakers: BTreeMap<_, _> = self
            .breakers
            .entries()
            .into_iter()
            .map(|(name, b)| (name, b.snapshot()))
            .collect();
        let backpressure: BTreeMap<_, _> = self
            .handlers
            .entries()
            .into_iter()
            .map(|(name, h)| (name, h.stats()))
            .collect();
        let totals = MetricTotals::collect(&circuit_breakers, &backpressure);
        MetricsSnapshot {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
            store: self.store_health(),
            components: self.component_status(),
            circuit_breakers,
            backpressure,
            totals,
        }
    }

    /// Force every breaker closed. Returns how many were reset.
    pub fn reset_all_circuit_breakers(&self) -> usize {
        let breakers = self.breakers.entries();
        for (_, breaker) in &breakers {
            breaker.reset();
        }
        info!(count = breakers.len(), "Reset all circuit breakers");
        breakers.len()
    }

    pub async fn reset_client_limits(&self, client_id: &str, path: Option<&str>) -> Result<usize> {
        self.rate_limiter.reset_client_limits(client_id, path).await
    }

    /// Drain every backpressure handler and close the store. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers = self.handlers.entries();
        join_all(handlers.iter().map(|(_, handler)| handler.shutdown())).await;
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close counter store");
        }
        info!("Resilience manager shut down");
    }
}

/// Retry ladder around a breaker-gated call, either layer optional.
async fn run_guarded<F, Fut, T, E>(
    breaker: Option<Arc<CircuitBreaker>>,
    ladder: Option<RetryLadder>,
    service: String,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: FaultKind + std::error::Error + Send + Sync + 'static,
{
    match (breaker, ladder) {
        (Some(breaker), Some(ladder)) => {
            ladder
                .run(&service, || {
                    let attempt = op();
                    let breaker = Arc::clone(&breaker);
                    async move { breaker.call(move || attempt).await }
                })
                .await
        }
        (Some(breaker), None) => breaker.call(op).await,
        (None, Some(ladder)) => ladder.run(&service, op).await,
        (None, None) => match op().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_cancellation() => Err(Error::Cancelled { operation: service }),
            Err(e) => Err(Error::upstream(e)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::{BackpressureConfig, BackpressureStrategy};
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::rate_limit::RateLimitConfig;
    use crate::retry::RetryConfig;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn policy() -> ResiliencePolicy {
        let mut policy = ResiliencePolicy::default();
        policy.rate_limiting.rules.clear();
        policy.rate_limiting.default = RateLimitConfig::new().with_requests_per_minute(2);
        policy.circuit_breakers.insert(
            "pms_connector".into(),
            CircuitBreakerConfig::new("pms_connector")
                .with_failure_threshold(2)
                .with_recovery_timeout(Duration::from_secs(30)),
        );
        policy.retries.insert(
            "pms".into(),
            RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(10))
                .with_jitter(false),
        );
        policy
    }

    #[tokio::test]
    async fn test_prebuilds_policy_components() {
        let manager = ResilienceManager::new(policy(), None).await.unwrap();
        assert!(manager.get_circuit_breaker("tts_service").is_some());
        assert!(manager.get_backpressure_handler("audio_processing").is_some());
        assert!(manager.get_circuit_breaker("billing").is_none());
        assert!(!manager.store().has_primary());
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let manager = ResilienceManager::new(policy(), None).await.unwrap();
        let first = manager.get_or_create_circuit_breaker("billing");
        first.record_failure();
        let second = manager.get_or_create_circuit_breaker("billing");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.snapshot().total_failures, 1);

        let h1 = manager.get_or_create_backpressure_handler("transcription");
        let h2 = manager.get_or_create_backpressure_handler("transcription");
        assert!(Arc::ptr_eq(&h1, &h2));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_policy_rejected() {
        let mut bad = policy();
        bad.backpressure.insert(
            "broken".into(),
            BackpressureConfig::new().with_max_queue_size(0),
        );
        let err = ResilienceManager::new(bad, None).await.err().unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_attempts_feed_breaker() {
        let manager = ResilienceManager::new(policy(), None).await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = manager
            .execute_protected(
                ProtectedCall::new().with_breaker("pms_connector").with_retry("pms"),
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(Error::Timeout {
                            operation: "pms.lookup".into(),
                            after: Duration::from_secs(1),
                        })
                    }
                },
            )
            .await
            .unwrap_err();

        // Two counted failures open the breaker; the third attempt is short-circuited.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            err,
            Error::ExternalService { attempts: 3, ref kind, .. } if kind == "dependency_unavailable"
        ));
        assert_eq!(err.http_status(), 503);
        let breaker = manager.get_circuit_breaker("pms_connector").unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_first() {
        let manager = ResilienceManager::new(policy(), None).await.unwrap();
        let call = || {
            ProtectedCall::new().with_rate_limit(RateLimitKey::new("caller-7", "/api/v1/transfer"))
        };
        for _ in 0..2 {
            manager
                .execute_protected(call(), || async { Ok::<_, Error>(1) })
                .await
                .unwrap();
        }
        let err = manager
            .execute_protected(call(), || async { Ok::<_, Error>(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { retry_after: 60, .. }));
        assert_eq!(err.http_status(), 429);

        // minute, hour and day counters
        assert_eq!(manager.reset_client_limits("caller-7", None).await.unwrap(), 3);
        manager
            .execute_protected(call(), || async { Ok::<_, Error>(1) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_backpressure_runs_work_as_task() {
        let mut p = policy();
        p.backpressure.insert(
            "webhook_delivery".into(),
            BackpressureConfig::new()
                .with_strategy(BackpressureStrategy::DropNewest)
                .with_max_queue_size(4),
        );
        let manager = ResilienceManager::new(p, None).await.unwrap();
        let value = manager
            .execute_protected(
                ProtectedCall::new()
                    .with_backpressure("webhook_delivery")
                    .with_task_id("hook-1"),
                || async { Ok::<_, Error>("sent") },
            )
            .await
            .unwrap();
        assert_eq!(value, "sent");
        let stats = manager
            .get_backpressure_handler("webhook_delivery")
            .unwrap()
            .stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.queue_size, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let manager = ResilienceManager::new(policy(), None).await.unwrap();
        assert_eq!(manager.get_health_status().status, OverallHealth::Healthy);

        let breaker = manager.get_or_create_circuit_breaker("pms_connector");
        breaker.record_failure();
        breaker.record_failure();
        let health = manager.get_health_status();
        assert_eq!(health.status, OverallHealth::Degraded);
        assert_eq!(health.circuit_breakers["pms_connector"].state, CircuitState::Open);

        let metrics = manager.get_metrics();
        assert_eq!(metrics.totals.open_breakers, 1);
        assert_eq!(metrics.totals.breaker_failures, 2);
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["circuit_breakers"]["pms_connector"]["state"], "open");

        assert_eq!(manager.reset_all_circuit_breakers(), manager.breakers.len());
        assert_eq!(manager.get_health_status().status, OverallHealth::Healthy);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = ResilienceManager::new(policy(), None).await.unwrap();
        manager.shutdown().await;
        manager.shutdown().await;
        assert!(manager.is_shutdown());
        assert_eq!(manager.get_health_status().status, OverallHealth::Unhealthy);
        let err = manager
            .call_with_breaker("pms_connector", || async { Ok::<_, Error>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}

//! End-to-end scenarios through the public API: policy document in,
//! admission and failure decisions out.

use async_trait::async_trait;
use call_resilience::rate_limit::RateWindow;
use call_resilience::store::{BucketTake, WindowHit};
use call_resilience::{
    CircuitState, CounterStore, Error, FaultKind, MemoryStore, ProtectedCall, RateLimitKey,
    ResilienceManager, ResiliencePolicy,
};
use std::borrow::Cow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
enum PmsError {
    #[error("connection reset by peer")]
    Connection,
    #[error("reservation not found")]
    NotFound,
}

impl FaultKind for PmsError {
    fn kind(&self) -> Cow<'_, str> {
        Cow::Borrowed(match self {
            PmsError::Connection => "connection",
            PmsError::NotFound => "validation",
        })
    }

    fn http_status(&self) -> Option<u16> {
        match self {
            PmsError::Connection => None,
            PmsError::NotFound => Some(404),
        }
    }
}

/// Shared store that never answers.
struct OfflineStore;

fn offline() -> Error {
    Error::store_with_context(
        "connection refused",
        call_resilience::ErrorContext::new().with_source("offline_store"),
    )
}

#[async_trait]
impl CounterStore for OfflineStore {
    async fn ping(&self) -> call_resilience::Result<()> {
        Err(offline())
    }
    async fn get(&self, _: &str) -> call_resilience::Result<Option<i64>> {
        Err(offline())
    }
    async fn set(&self, _: &str, _: i64, _: Option<Duration>) -> call_resilience::Result<()> {
        Err(offline())
    }
    async fn incr(&self, _: &str, _: Option<Duration>) -> call_resilience::Result<i64> {
        Err(offline())
    }
    async fn decr(&self, _: &str) -> call_resilience::Result<i64> {
        Err(offline())
    }
    async fn expire(&self, _: &str, _: Duration) -> call_resilience::Result<bool> {
        Err(offline())
    }
    async fn delete(&self, _: &str) -> call_resilience::Result<bool> {
        Err(offline())
    }
    async fn keys(&self, _: &str) -> call_resilience::Result<Vec<String>> {
        Err(offline())
    }
    async fn delete_many(&self, _: &[String]) -> call_resilience::Result<usize> {
        Err(offline())
    }
    async fn zadd(&self, _: &str, _: f64, _: &str) -> call_resilience::Result<bool> {
        Err(offline())
    }
    async fn zrem(&self, _: &str, _: &str) -> call_resilience::Result<bool> {
        Err(offline())
    }
    async fn zremrangebyscore(&self, _: &str, _: f64, _: f64) -> call_resilience::Result<usize> {
        Err(offline())
    }
    async fn zcard(&self, _: &str) -> call_resilience::Result<usize> {
        Err(offline())
    }
    async fn sliding_window_hit(
        &self,
        _: &str,
        _: f64,
        _: Duration,
        _: u64,
    ) -> call_resilience::Result<WindowHit> {
        Err(offline())
    }
    async fn token_bucket_take(
        &self,
        _: &str,
        _: f64,
        _: f64,
        _: f64,
        _: f64,
    ) -> call_resilience::Result<BucketTake> {
        Err(offline())
    }
    async fn fixed_window_hit(
        &self,
        _: &str,
        _: Duration,
        _: u64,
    ) -> call_resilience::Result<WindowHit> {
        Err(offline())
    }
    async fn close(&self) -> call_resilience::Result<()> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "offline"
    }
}

const POLICY: &str = r#"
rate_limiting:
  enabled: true
  default:
    requests_per_minute: 5
    requests_per_hour: 1000
    requests_per_day: 10000
    algorithm: sliding_window
circuit_breakers:
  media_server:
    failure_threshold: 2
    recovery_timeout_secs: 30
    success_threshold: 1
    timeout_secs: 5
    expected_exceptions: [timeout, connection]
backpressure:
  webhook_delivery:
    max_queue_size: 4
    max_memory_mb: 16
    strategy: drop_newest
retries:
  pms:
    max_attempts: 3
    base_delay_secs: 1.0
    max_delay_secs: 10.0
    jitter: false
"#;

async fn manager(store: Option<Arc<dyn CounterStore>>) -> ResilienceManager {
    let policy = ResiliencePolicy::from_yaml(POLICY).unwrap();
    ResilienceManager::new(policy, store).await.unwrap()
}

#[tokio::test]
async fn test_counts_are_shared_through_the_store() {
    let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
    let a = manager(Some(Arc::clone(&store))).await;
    let b = manager(Some(Arc::clone(&store))).await;
    assert!(a.store().is_connected());

    let mut remaining = Vec::new();
    for m in [&a, &a, &a, &b, &b] {
        let res = m.check_rate_limit("client-1", "/api/v1/guests", None, None).await;
        assert!(res.allowed);
        remaining.push(res.remaining);
    }
    assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

    let denied = a.check_rate_limit("client-1", "/api/v1/guests", None, None).await;
    assert!(!denied.allowed);
    assert_eq!(denied.limit_type, Some(RateWindow::Minute));
    assert_eq!(denied.retry_after, Some(60));

    // A reset through one instance is visible to the other.
    assert_eq!(b.reset_client_limits("client-1", None).await.unwrap(), 3);
    assert!(a.check_rate_limit("client-1", "/api/v1/guests", None, None).await.allowed);
}

#[tokio::test]
async fn test_offline_store_degrades_to_local_counting() {
    let m = manager(Some(Arc::new(OfflineStore))).await;
    assert!(m.store().is_degraded());
    assert!(!m.store().is_connected());

    let mut admitted = 0;
    for _ in 0..8 {
        if m.check_rate_limit("client-2", "/api/v1/guests", None, None).await.allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);

    let health = m.get_health_status();
    assert_eq!(
        serde_json::to_value(&health).unwrap()["status"],
        serde_json::json!("degraded")
    );
    assert!(health.store.degraded);
    assert!(health.store.has_primary);
}

#[tokio::test]
async fn test_no_store_is_not_degraded_health() {
    let m = manager(None).await;
    let health = m.get_health_status();
    assert!(!health.store.connected);
    assert_eq!(
        serde_json::to_value(&health).unwrap()["status"],
        serde_json::json!("healthy")
    );
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_recovers() {
    let m = manager(None).await;
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        let err = m
            .call_with_breaker("media_server", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PmsError::Connection)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "connection");
    }
    let breaker = m.get_circuit_breaker("media_server").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    // Open: rejected without invoking the operation.
    let rejected = {
        let calls = Arc::clone(&calls);
        m.call_with_breaker("media_server", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, PmsError>(())
        })
        .await
        .unwrap_err()
    };
    assert!(matches!(rejected, Error::DependencyUnavailable { .. }));
    assert_eq!(rejected.http_status(), 503);
    assert_eq!(rejected.retry_after(), Some(30));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::advance(Duration::from_secs(30)).await;
    m.call_with_breaker("media_server", || async { Ok::<_, PmsError>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);

    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.total_failures, 2);
    assert_eq!(snapshot.total_rejections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_failure_runs_once() {
    let m = manager(None).await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let err = m
        .call_with_retry("pms", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PmsError::NotFound)
            }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    match err {
        Error::ExternalService {
            ref service,
            attempts,
            ref kind,
            ..
        } => {
            assert_eq!(service, "pms");
            assert_eq!(attempts, 1);
            assert_eq!(kind, "validation");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_protected_call_uses_every_layer() {
    let m = manager(None).await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let call = ProtectedCall::new()
        .with_rate_limit(RateLimitKey::new("pms-gateway", "/api/v1/guests"))
        .with_breaker("media_server")
        .with_retry("pms")
        .with_backpressure("webhook_delivery")
        .with_task_id("lookup-1204");

    let room = m
        .execute_protected(call, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(PmsError::Connection)
                } else {
                    Ok("1204")
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(room, "1204");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let breaker = m.get_circuit_breaker("media_server").unwrap().snapshot();
    assert_eq!(breaker.total_failures, 1);
    assert_eq!(breaker.total_successes, 1);

    let handler = m.get_backpressure_handler("webhook_delivery").unwrap();
    assert_eq!(handler.queue_size(), 0);
    assert_eq!(handler.stats().processed, 1);

    let usage = m.check_rate_limit("pms-gateway", "/api/v1/guests", None, None).await;
    assert_eq!(usage.current_usage, 2);
}

#[tokio::test]
async fn test_rejected_admission_never_runs_the_operation() {
    let m = manager(None).await;
    for _ in 0..5 {
        m.check_rate_limit("noisy", "/api/v1/guests", None, None).await;
    }

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let err = m
        .execute_protected(
            ProtectedCall::new()
                .with_rate_limit(RateLimitKey::new("noisy", "/api/v1/guests"))
                .with_breaker("media_server"),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, PmsError>(())
                }
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AdmissionDenied { .. }));
    assert_eq!(err.http_status(), 429);
    assert_eq!(err.retry_after(), Some(60));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        m.get_circuit_breaker("media_server").unwrap().snapshot().total_requests,
        0
    );
}

#[tokio::test]
async fn test_invalid_document_names_the_field() {
    let yaml = r#"
circuit_breakers:
  tts_service:
    failure_threshold: 0
"#;
    let policy = ResiliencePolicy::from_yaml(yaml).unwrap();
    let err = match ResilienceManager::new(policy, None).await {
        Ok(_) => panic!("zero failure threshold accepted"),
        Err(e) => e,
    };
    let ctx = err.context().unwrap();
    assert_eq!(
        ctx.field_path.as_deref(),
        Some("circuit_breakers.tts_service.failure_threshold")
    );
    assert_eq!(ctx.source.as_deref(), Some("policy_validator"));
}

#[tokio::test]
async fn test_calls_after_shutdown_are_cancelled() {
    let m = manager(None).await;
    m.shutdown().await;
    m.shutdown().await;

    let err = m
        .call_with_breaker("media_server", || async { Ok::<_, PmsError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
    assert_eq!(
        serde_json::to_value(m.get_health_status()).unwrap()["status"],
        serde_json::json!("unhealthy")
    );
}

//! 熔断器：按依赖名称跟踪失败并短路对故障依赖的调用。
//!
//! # Circuit Breaker
//!
//! Per-dependency, three-state gate:
//!
//! ```text
//! Closed ──(failure_count >= failure_threshold)──▶ Open
//! Open ──(recovery_timeout elapsed, next call)──▶ HalfOpen
//! HalfOpen ──(success_count >= success_threshold)──▶ Closed
//! HalfOpen ──(any counted failure)──▶ Open (recovery clock restarts)
//! ```
//!
//! Half-open admits exactly one in-flight trial at a time. The trial slot is
//! claimed atomically with the Open → HalfOpen transition and released when the
//! trial completes or its future is dropped; concurrent callers are rejected as
//! if the breaker were still open.
//!
//! State is process-local.

use crate::error::{Error, FaultKind};
use crate::policy::duration_from_secs;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Dependency name used in logs and errors.
    pub name: String,
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Per-call deadline; `<= 0` disables it.
    pub timeout_secs: f64,
    /// Failure kinds that count toward the breaker. Empty counts every kind.
    pub expected_exceptions: Vec<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
            success_threshold: 3,
            timeout_secs: 30.0,
            expected_exceptions: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_expected_exceptions<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_exceptions = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn recovery_timeout(&self) -> Duration {
        duration_from_secs(self.recovery_timeout_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0.0).then(|| duration_from_secs(self.timeout_secs))
    }

    /// Whether a failure of `kind` counts toward the breaker.
    pub fn counts(&self, kind: &str) -> bool {
        self.expected_exceptions.is_empty() || self.expected_exceptions.iter().any(|k| k == kind)
    }
}

/// Serializable view of a breaker for health and metrics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
    /// Seconds since the last counted failure.
    pub last_failure_secs_ago: Option<f64>,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
}

impl State {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_failure: None,
            trial_in_flight: false,
            total_requests: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejections: 0,
        }
    }
}

/// Slot held by the single half-open trial; releases it on drop.
struct TrialPermit<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        self.breaker.lock().trial_in_flight = false;
    }
}

pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open_remaining(&self, st: &State) -> Option<Duration> {
        if st.state != CircuitState::Open {
            return None;
        }
        let opened_at = st.opened_at?;
        self.cfg.recovery_timeout().checked_sub(opened_at.elapsed())
    }

    /// Gate one call. `Ok(Some(_))` means the caller is the half-open trial.
    fn admit(&self) -> Result<Option<TrialPermit<'_>>> {
        let mut st = self.lock();
        st.total_requests += 1;
        match st.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let recovered = st
                    .opened_at
                    .map(|at| at.elapsed() >= self.cfg.recovery_timeout())
                    .unwrap_or(true);
                if recovered && !st.trial_in_flight {
                    self.transition(&mut st, CircuitState::HalfOpen);
                    st.trial_in_flight = true;
                    drop(st);
                    Ok(Some(TrialPermit { breaker: self }))
                } else {
                    st.total_rejections += 1;
                    let retry_in = self.open_remaining(&st);
                    Err(self.unavailable(retry_in))
                }
            }
            CircuitState::HalfOpen => {
                if st.trial_in_flight {
                    st.total_rejections += 1;
                    Err(self.unavailable(None))
                } else {
                    st.trial_in_flight = true;
                    drop(st);
                    Ok(Some(TrialPermit { breaker: self }))
                }
            }
        }
    }

    fn unavailable(&self, retry_in: Option<Duration>) -> Error {
        Error::DependencyUnavailable {
            name: self.cfg.name.clone(),
            retry_in,
        }
    }

    fn transition(&self, st: &mut State, to: CircuitState) {
        let from = st.state;
        st.state = to;
        match to {
            CircuitState::Closed => {
                st.failure_count = 0;
                st.success_count = 0;
                st.opened_at = None;
                info!(breaker = %self.cfg.name, from = from.as_str(), "Circuit closed");
            }
            CircuitState::HalfOpen => {
                st.failure_count = 0;
                st.success_count = 0;
                info!(breaker = %self.cfg.name, "Circuit half-open; admitting one trial call");
            }
            CircuitState::Open => {
                st.success_count = 0;
                st.opened_at = Some(Instant::now());
                warn!(
                    breaker = %self.cfg.name,
                    from = from.as_str(),
                    failures = st.failure_count,
                    recovery_timeout_secs = self.cfg.recovery_timeout_secs,
                    "Circuit opened"
                );
            }
        }
    }

    /// Run `op` through the breaker, bounded by the configured timeout.
    ///
    /// Open circuits reject without invoking `op`. Timeouts and counted failure
    /// kinds are recorded as failures; cancellations and other kinds leave the
    /// breaker untouched.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: FaultKind + std::error::Error + Send + Sync + 'static,
    {
        let trial = self.admit()?;

        let outcome = match self.cfg.timeout() {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(res) => res,
                Err(_) => {
                    self.record_failure();
                    return Err(Error::Timeout {
                        operation: self.cfg.name.clone(),
                        after: limit,
                    });
                }
            },
            None => op().await,
        };

        match outcome {
            Ok(value) => {
                self.settle_success(trial.is_some());
                Ok(value)
            }
            Err(e) if e.is_cancellation() => Err(Error::Cancelled {
                operation: self.cfg.name.clone(),
            }),
            Err(e) => {
                if self.cfg.counts(&e.kind()) {
                    self.record_failure();
                }
                Err(Error::upstream(e))
            }
        }
    }

    /// Record a success observed outside [`CircuitBreaker::call`].
    ///
    /// The caller owns admission here, so a half-open circuit counts it toward
    /// `success_threshold`.
    pub fn record_success(&self) {
        self.settle_success(true);
    }

    /// Only the holder of the trial permit moves a half-open circuit; late
    /// successes from calls admitted while closed are totalled but ignored.
    fn settle_success(&self, is_trial: bool) {
        let mut st = self.lock();
        st.total_successes += 1;
        match st.state {
            CircuitState::Closed => st.failure_count = 0,
            CircuitState::HalfOpen if !is_trial => {}
            CircuitState::HalfOpen => {
                st.success_count += 1;
                if st.success_count >= self.cfg.success_threshold {
                    self.transition(&mut st, CircuitState::Closed);
                }
            }
            // Late result from a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut st = self.lock();
        st.total_failures += 1;
        st.last_failure = Some(Instant::now());
        match st.state {
            CircuitState::Closed => {
                st.failure_count = st.failure_count.saturating_add(1);
                if st.failure_count >= self.cfg.failure_threshold {
                    self.transition(&mut st, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                st.failure_count = st.failure_count.saturating_add(1);
                self.transition(&mut st, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Time until an open circuit admits its trial.
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let st = self.lock();
        self.open_remaining(&st)
    }

    /// Force the circuit closed. Lifetime totals are kept.
    pub fn reset(&self) {
        let mut st = self.lock();
        st.trial_in_flight = false;
        if st.state != CircuitState::Closed {
            self.transition(&mut st, CircuitState::Closed);
        } else {
            st.failure_count = 0;
            st.success_count = 0;
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerStats {
        let st = self.lock();
        CircuitBreakerStats {
            name: self.cfg.name.clone(),
            state: st.state,
            failure_count: st.failure_count,
            success_count: st.success_count,
            failure_threshold: self.cfg.failure_threshold,
            success_threshold: self.cfg.success_threshold,
            total_requests: st.total_requests,
            total_failures: st.total_failures,
            total_successes: st.total_successes,
            total_rejections: st.total_rejections,
            last_failure_secs_ago: st.last_failure.map(|at| at.elapsed().as_secs_f64()),
            open_remaining_ms: self
                .open_remaining(&st)
                .map(|d| d.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    enum DepError {
        #[error("connection refused")]
        Connection,
        #[error("bad request")]
        Validation,
        #[error("cancelled")]
        Cancelled,
    }

    impl FaultKind for DepError {
        fn kind(&self) -> Cow<'_, str> {
            Cow::Borrowed(match self {
                DepError::Connection => "connection",
                DepError::Validation => "validation",
                DepError::Cancelled => "cancelled",
            })
        }
        fn is_cancellation(&self) -> bool {
            matches!(self, DepError::Cancelled)
        }
    }

    fn breaker(failures: u32, recovery_secs: u64, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new("pms_connector")
                .with_failure_threshold(failures)
                .with_recovery_timeout(Duration::from_secs(recovery_secs))
                .with_success_threshold(successes),
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.call(|| async { Err::<(), _>(DepError::Connection) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<()> {
        cb.call(|| async { Ok::<(), DepError>(()) }).await
    }

    #[test]
    fn test_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout(), Duration::from_secs(60));
        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
        assert!(config.counts("anything"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_scenario() {
        let cb = breaker(3, 5, 2);
        let invoked = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, Err(Error::Upstream { .. })));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        let rejected = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), DepError>(())
            })
            .await;
        assert!(matches!(rejected, Err(Error::DependencyUnavailable { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);

        let stats = cb.snapshot();
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.total_requests, 6);
        assert_eq!(stats.total_failures, 3);
        assert_eq!(stats.total_successes, 2);
        assert_eq!(stats.total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_clock() {
        let cb = breaker(1, 10, 2);
        fail(&cb).await.unwrap_err();
        assert!(cb.is_open());

        tokio::time::advance(Duration::from_secs(10)).await;
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        let remaining = cb.time_until_half_open().unwrap();
        assert_eq!(remaining, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(matches!(
            succeed(&cb).await,
            Err(Error::DependencyUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 5, 1);
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.snapshot().failure_count, 2);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.snapshot().failure_count, 0);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unexpected_kinds_do_not_count() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new("tts_service")
                .with_failure_threshold(2)
                .with_expected_exceptions(["connection", "timeout"]),
        );
        for _ in 0..5 {
            let err = cb
                .call(|| async { Err::<(), _>(DepError::Validation) })
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "validation");
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert!(cb.is_open());
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_failure() {
        let cb = breaker(1, 5, 1);
        let err = cb
            .call(|| async { Err::<(), _>(DepError::Cancelled) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new("media_server")
                .with_failure_threshold(1)
                .with_timeout(Duration::from_millis(100))
                .with_expected_exceptions(["connection"]),
        );
        let err = cb
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<(), DepError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(cb.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_in_half_open() {
        let cb = Arc::new(breaker(1, 5, 1));
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(5)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async move {
                    let _ = rx.await;
                    Ok::<(), DepError>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(matches!(
            succeed(&cb).await,
            Err(Error::DependencyUnavailable { .. })
        ));

        tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_half_open() {
        let cb = Arc::new(breaker(1, 5, 1));

        let (slow_tx, slow_rx) = tokio::sync::oneshot::channel::<()>();
        let slow_cb = cb.clone();
        let slow = tokio::spawn(async move {
            slow_cb
                .call(|| async move {
                    let _ = slow_rx.await;
                    Ok::<(), DepError>(())
                })
                .await
        });
        tokio::task::yield_now().await;

        fail(&cb).await.unwrap_err();
        assert!(cb.is_open());
        tokio::time::advance(Duration::from_secs(5)).await;

        let (trial_tx, trial_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async move {
                    let _ = trial_rx.await;
                    Ok::<(), DepError>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        slow_tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.snapshot().total_successes, 1);

        trial_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_manual_success_counts_in_half_open() {
        let cb = breaker(1, 0, 1);
        cb.record_failure();
        assert!(cb.is_open());
        assert!(cb.admit().unwrap().is_some());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let cb = breaker(1, 5, 1);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(5)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call(|| futures::future::pending::<std::result::Result<(), DepError>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.snapshot().total_failures, 1);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_closes_and_keeps_totals() {
        let cb = breaker(1, 60, 1);
        fail(&cb).await.unwrap_err();
        assert!(cb.is_open());
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().total_failures, 1);
        succeed(&cb).await.unwrap();
    }
}

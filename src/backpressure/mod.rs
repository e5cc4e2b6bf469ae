//! 背压控制：有界队列与内存预算，保护重负载/流式操作。
//!
//! # Backpressure
//!
//! A [`BackpressureHandler`] guards one heavy operation (audio processing, TTS
//! synthesis, webhook fan-out). Every accepted task runs on its own tokio task
//! and occupies a queue slot plus a memory estimate until it finishes. When a
//! submission would overflow either bound, the configured
//! [`BackpressureStrategy`] decides:
//!
//! | Strategy | On overflow |
//! |----------|-------------|
//! | `drop_oldest` | evict the queue head (aborting its worker), then accept |
//! | `drop_newest` | reject the new task |
//! | `block` | wait for space until `timeout_secs`, then reject |
//! | `adaptive` | `drop_oldest` under memory pressure, otherwise `block` |
//!
//! Rejections are returned as [`Error::CapacityExceeded`](crate::Error::CapacityExceeded),
//! never panics.

mod config;

pub use config::{BackpressureConfig, BackpressureStrategy};

use crate::{Error, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Most recent completions kept for the latency mean.
const LATENCY_SAMPLES: usize = 1_000;
/// Memory ratio above which adaptive mode starts evicting.
const ADAPTIVE_MEMORY_CEILING: f64 = 0.95;
/// Minimum time between two adaptive strategy switches.
const ADAPTIVE_COOLDOWN: Duration = Duration::from_secs(10);
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Adaptive choice for the given pressure.
///
/// Memory above 95% forces `drop_oldest`; both ratios under `threshold` fall
/// back to `block`; anything in between keeps the current choice.
pub fn adaptive_choice(
    queue_ratio: f64,
    memory_ratio: f64,
    threshold: f64,
    current: BackpressureStrategy,
) -> BackpressureStrategy {
    if memory_ratio > ADAPTIVE_MEMORY_CEILING {
        BackpressureStrategy::DropOldest
    } else if queue_ratio < threshold && memory_ratio < threshold {
        BackpressureStrategy::Block
    } else {
        current
    }
}

enum OverflowAction {
    EvictOldest,
    RejectNew,
    Wait,
}

fn overflow_action(configured: BackpressureStrategy, adaptive: BackpressureStrategy) -> OverflowAction {
    match configured {
        BackpressureStrategy::DropOldest => OverflowAction::EvictOldest,
        BackpressureStrategy::DropNewest => OverflowAction::RejectNew,
        BackpressureStrategy::Block => OverflowAction::Wait,
        BackpressureStrategy::Adaptive => match adaptive {
            BackpressureStrategy::DropOldest => OverflowAction::EvictOldest,
            _ => OverflowAction::Wait,
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackpressureStats {
    pub name: String,
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub memory_usage_mb: f64,
    pub max_memory_mb: f64,
    pub queue_ratio: f64,
    pub memory_ratio: f64,
    pub processed: u64,
    pub dropped: u64,
    pub blocked: u64,
    pub avg_processing_time_ms: f64,
    pub strategy: BackpressureStrategy,
    /// Strategy currently acting on overflow; differs from `strategy` only in adaptive mode.
    pub effective_strategy: BackpressureStrategy,
    pub is_shutdown: bool,
}

struct Slot {
    task_id: String,
    seq: u64,
    memory_mb: f64,
    abort: AbortHandle,
}

struct QueueState {
    queue: VecDeque<Slot>,
    memory_mb: f64,
    next_seq: u64,
    processed: u64,
    dropped: u64,
    blocked: u64,
    latencies_ms: VecDeque<f64>,
    adaptive: BackpressureStrategy,
    last_switch: Option<Instant>,
    warned: bool,
    closed: bool,
}

struct Shared {
    name: String,
    cfg: BackpressureConfig,
    state: Mutex<QueueState>,
    space: Notify,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ratios(&self, st: &QueueState) -> (f64, f64) {
        let queue_ratio = if self.cfg.max_queue_size == 0 {
            1.0
        } else {
            st.queue.len() as f64 / self.cfg.max_queue_size as f64
        };
        let memory_ratio = if self.cfg.max_memory_mb <= 0.0 {
            1.0
        } else {
            st.memory_mb / self.cfg.max_memory_mb
        };
        (queue_ratio, memory_ratio)
    }

    /// Re-run the adaptive decision, honoring the switch cooldown.
    fn reevaluate(&self, st: &mut QueueState) {
        if self.cfg.strategy != BackpressureStrategy::Adaptive {
            return;
        }
        let (queue_ratio, memory_ratio) = self.ratios(st);
        let choice = adaptive_choice(
            queue_ratio,
            memory_ratio,
            self.cfg.adaptive_threshold,
            st.adaptive,
        );
        if choice == st.adaptive {
            return;
        }
        let cooled = st
            .last_switch
            .map(|at| at.elapsed() >= ADAPTIVE_COOLDOWN)
            .unwrap_or(true);
        if cooled {
            info!(
                handler = %self.name,
                from = %st.adaptive,
                to = %choice,
                queue_ratio,
                memory_ratio,
                "Adaptive backpressure switched strategy"
            );
            st.adaptive = choice;
            st.last_switch = Some(Instant::now());
        }
    }

    /// Remove a finished or abandoned task's slot. `latency` is set only on completion.
    fn release(&self, seq: u64, latency: Option<Duration>) {
        {
            let mut st = self.lock();
            if let Some(pos) = st.queue.iter().position(|s| s.seq == seq) {
                if let Some(slot) = st.queue.remove(pos) {
                    st.memory_mb = (st.memory_mb - slot.memory_mb).max(0.0);
                }
                if let Some(latency) = latency {
                    st.processed += 1;
                    if st.latencies_ms.len() == LATENCY_SAMPLES {
                        st.latencies_ms.pop_front();
                    }
                    st.latencies_ms.push_back(latency.as_secs_f64() * 1_000.0);
                }
            }
        }
        self.space.notify_waiters();
    }
}

/// Held by a running worker; frees its slot however the worker ends.
struct SlotGuard {
    shared: Arc<Shared>,
    seq: u64,
    started: Instant,
    armed: bool,
}

impl SlotGuard {
    fn finish(mut self) {
        self.armed = false;
        self.shared.release(self.seq, Some(self.started.elapsed()));
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release(self.seq, None);
        }
    }
}

/// Handle to an accepted task.
///
/// Dropping the handle (or the future awaiting [`TaskHandle::join`]) cancels
/// the worker; use [`TaskHandle::detach`] to let it run unobserved.
pub struct TaskHandle<T> {
    task_id: String,
    handle: Option<JoinHandle<T>>,
}

impl<T> TaskHandle<T> {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the task's output. Evicted or shut-down tasks yield `Cancelled`.
    pub async fn join(mut self) -> Result<T> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(Error::Cancelled {
                operation: self.task_id.clone(),
            });
        };
        let outcome = handle.await;
        self.handle = None;
        match outcome {
            Ok(value) => Ok(value),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(Error::Cancelled {
                operation: self.task_id.clone(),
            }),
        }
    }

    pub fn abort(&self) {
        if let Some(handle) = self.handle.as_ref() {
            handle.abort();
        }
    }

    pub fn detach(mut self) {
        self.handle = None;
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub struct BackpressureHandler {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl BackpressureHandler {
    pub fn new(name: impl Into<String>, cfg: BackpressureConfig) -> Self {
        let state = QueueState {
            queue: VecDeque::new(),
            memory_mb: 0.0,
            next_seq: 0,
            processed: 0,
            dropped: 0,
            blocked: 0,
            latencies_ms: VecDeque::with_capacity(LATENCY_SAMPLES),
            adaptive: BackpressureStrategy::Block,
            last_switch: None,
            warned: false,
            closed: false,
        };
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                cfg,
                state: Mutex::new(state),
                space: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            monitor: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.shared.cfg
    }

    pub fn queue_size(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn memory_usage_mb(&self) -> f64 {
        self.shared.lock().memory_mb
    }

    /// Task ids currently holding a slot, oldest first.
    pub fn active_tasks(&self) -> Vec<String> {
        self.shared
            .lock()
            .queue
            .iter()
            .map(|s| s.task_id.clone())
            .collect()
    }

    pub fn effective_strategy(&self) -> BackpressureStrategy {
        let st = self.shared.lock();
        self.effective(&st)
    }

    fn effective(&self, st: &QueueState) -> BackpressureStrategy {
        match self.shared.cfg.strategy {
            BackpressureStrategy::Adaptive => st.adaptive,
            other => other,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().closed
    }

    /// Submit with the configured per-task memory estimate.
    pub async fn submit<F, T>(&self, task_id: impl Into<String>, task: F) -> Result<TaskHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let estimate = self.shared.cfg.task_memory_mb;
        self.submit_with_estimate(task_id, estimate, task).await
    }

    pub async fn submit_with_estimate<F, T>(
        &self,
        task_id: impl Into<String>,
        memory_mb: f64,
        task: F,
    ) -> Result<TaskHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let task_id = task_id.into();
        let memory_mb = memory_mb.max(0.0);
        self.ensure_monitor();
        let deadline = Instant::now() + self.shared.cfg.timeout();

        loop {
            let notified = self.shared.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut evicted = Vec::new();
            {
                let mut st = self.shared.lock();
                if st.closed {
                    return Err(self.rejected(&st, "handler is shut down"));
                }
                self.warn_if_pressured(&mut st);

                if !self.fits(&st, memory_mb) {
                    self.shared.reevaluate(&mut st);
                    match overflow_action(self.shared.cfg.strategy, st.adaptive) {
                        OverflowAction::RejectNew => {
                            st.dropped += 1;
                            debug!(handler = %self.shared.name, task_id = %task_id, "Dropped newest task");
                            return Err(self.rejected(&st, "queue full; newest task dropped"));
                        }
                        OverflowAction::EvictOldest => {
                            while !self.fits(&st, memory_mb) {
                                let Some(slot) = st.queue.pop_front() else {
                                    break;
                                };
                                st.memory_mb = (st.memory_mb - slot.memory_mb).max(0.0);
                                st.dropped += 1;
                                debug!(handler = %self.shared.name, evicted = %slot.task_id, "Dropped oldest task");
                                evicted.push(slot.abort);
                            }
                            if !self.fits(&st, memory_mb) {
                                st.dropped += 1;
                                drop(st);
                                abort_all(evicted);
                                return Err(Error::CapacityExceeded {
                                    operation: self.shared.name.clone(),
                                    strategy: BackpressureStrategy::DropOldest,
                                    reason: format!(
                                        "task estimate {:.1}MB exceeds memory budget {:.1}MB",
                                        memory_mb, self.shared.cfg.max_memory_mb
                                    ),
                                });
                            }
                        }
                        OverflowAction::Wait => {}
                    }
                }

                if self.fits(&st, memory_mb) {
                    let handle = self.spawn_locked(&mut st, task_id, memory_mb, task);
                    drop(st);
                    abort_all(evicted);
                    return Ok(handle);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let mut st = self.shared.lock();
                    st.blocked += 1;
                    debug!(handler = %self.shared.name, task_id = %task_id, "Submission timed out waiting for space");
                    return Err(self.rejected(&st, "timed out waiting for queue space"));
                }
                _ = self.shared.shutdown.cancelled() => {
                    let st = self.shared.lock();
                    return Err(self.rejected(&st, "handler is shut down"));
                }
            }
        }
    }

    fn fits(&self, st: &QueueState, memory_mb: f64) -> bool {
        st.queue.len() < self.shared.cfg.max_queue_size
            && st.memory_mb + memory_mb <= self.shared.cfg.max_memory_mb
    }

    fn rejected(&self, st: &QueueState, reason: &str) -> Error {
        Error::CapacityExceeded {
            operation: self.shared.name.clone(),
            strategy: self.effective(st),
            reason: reason.to_string(),
        }
    }

    fn warn_if_pressured(&self, st: &mut QueueState) {
        let (queue_ratio, memory_ratio) = self.shared.ratios(st);
        let threshold = self.shared.cfg.warning_threshold;
        if queue_ratio >= threshold || memory_ratio >= threshold {
            if !st.warned {
                st.warned = true;
                warn!(
                    handler = %self.shared.name,
                    queue_ratio,
                    memory_ratio,
                    "Backpressure threshold reached"
                );
            }
        } else {
            st.warned = false;
        }
    }

    fn spawn_locked<F, T>(
        &self,
        st: &mut QueueState,
        task_id: String,
        memory_mb: f64,
        task: F,
    ) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let seq = st.next_seq;
        st.next_seq += 1;
        let guard = SlotGuard {
            shared: Arc::clone(&self.shared),
            seq,
            started: Instant::now(),
            armed: true,
        };
        let handle = tokio::spawn(async move {
            let output = task.await;
            guard.finish();
            output
        });
        st.queue.push_back(Slot {
            task_id: task_id.clone(),
            seq,
            memory_mb,
            abort: handle.abort_handle(),
        });
        st.memory_mb += memory_mb;
        TaskHandle {
            task_id,
            handle: Some(handle),
        }
    }

    /// Start the adaptive monitor on first use.
    fn ensure_monitor(&self) {
        if self.shared.cfg.strategy != BackpressureStrategy::Adaptive {
            return;
        }
        let mut monitor = self.monitor.lock().unwrap_or_else(|p| p.into_inner());
        if monitor.is_some() || self.shared.shutdown.is_cancelled() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *monitor = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(MONITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let mut st = shared.lock();
                        shared.reevaluate(&mut st);
                    }
                }
            }
        }));
    }

    pub fn stats(&self) -> BackpressureStats {
        let st = self.shared.lock();
        let (queue_ratio, memory_ratio) = self.shared.ratios(&st);
        let avg_processing_time_ms = if st.latencies_ms.is_empty() {
            0.0
        } else {
            st.latencies_ms.iter().sum::<f64>() / st.latencies_ms.len() as f64
        };
        BackpressureStats {
            name: self.shared.name.clone(),
            queue_size: st.queue.len(),
            max_queue_size: self.shared.cfg.max_queue_size,
            memory_usage_mb: st.memory_mb,
            max_memory_mb: self.shared.cfg.max_memory_mb,
            queue_ratio,
            memory_ratio,
            processed: st.processed,
            dropped: st.dropped,
            blocked: st.blocked,
            avg_processing_time_ms,
            strategy: self.shared.cfg.strategy,
            effective_strategy: self.effective(&st),
            is_shutdown: st.closed,
        }
    }

    /// Cancel every in-flight worker, drain the queue, and stop the monitor.
    pub async fn shutdown(&self) {
        let aborts = {
            let mut st = self.shared.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.memory_mb = 0.0;
            st.queue.drain(..).map(|s| s.abort).collect::<Vec<_>>()
        };
        let cancelled = aborts.len();
        self.shared.shutdown.cancel();
        abort_all(aborts);
        self.shared.space.notify_waiters();

        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
        info!(handler = %self.shared.name, cancelled, "Backpressure handler shut down");
    }
}

impl Drop for BackpressureHandler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

fn abort_all(handles: Vec<AbortHandle>) {
    for handle in handles {
        handle.abort();
    }
}

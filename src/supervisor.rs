//! Supervised periodic task runner.
//!
//! Drives the client's background loops (heartbeat, registry fetch, host
//! refresh) on a fixed cadence while enforcing a per-tick timeout. A tick
//! that overruns its timeout widens the schedule exponentially up to a
//! bound instead of piling up concurrent invocations; one successful run
//! snaps the schedule back to the base interval.
//!
//! At most one invocation of the wrapped callable is in flight per
//! supervisor. Ticks submit to a shared [`WorkerPool`]; a saturated pool
//! rejects the tick without touching the schedule.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::sync::TryAcquireError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Semaphore-bounded pool shared by supervised tasks.
///
/// The pool does not own threads; it bounds how many supervised callables
/// may run concurrently across all supervisors that share it.
#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    /// Create a pool admitting at most `capacity` concurrent callables.
    pub fn new(capacity: usize) -> Arc<Self> {
        debug_assert!(capacity > 0, "worker pool capacity must be positive");
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Number of callables that could start right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Total capacity of the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn try_submit(&self) -> Result<OwnedSemaphorePermit, TryAcquireError> {
        Arc::clone(&self.semaphore).try_acquire_owned()
    }
}

/// Outcome counters for one supervised task.
///
/// Plain atomics; read them through [`TimedSupervisorTask::metrics`].
#[derive(Debug, Default)]
struct TaskMetrics {
    success: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of a task's outcome counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskMetricsSnapshot {
    /// Ticks whose callable completed within the timeout.
    pub success: u64,
    /// Ticks cancelled after exceeding the timeout.
    pub timeouts: u64,
    /// Ticks rejected because the worker pool was saturated.
    pub rejected: u64,
    /// Ticks whose callable returned an error or panicked.
    pub failures: u64,
}

struct Inner {
    name: String,
    pool: Arc<WorkerPool>,
    task: TaskFn,
    timeout_ms: u64,
    max_delay_ms: u64,
    delay_ms: AtomicU64,
    metrics: TaskMetrics,
    cancel: CancellationToken,
}

/// A periodic task supervised with a per-tick timeout and exponential
/// back-off.
///
/// The first tick runs one base interval after [`spawn`](Self::spawn);
/// each subsequent tick runs one current delay after the previous tick
/// finished. The current delay starts at the base timeout, doubles
/// (bounded) on every timed-out tick, and resets on success.
pub struct TimedSupervisorTask {
    inner: Arc<Inner>,
    join: JoinHandle<()>,
}

impl TimedSupervisorTask {
    /// Spawn the supervision loop.
    ///
    /// `timeout` is both the base schedule interval and the per-tick bound
    /// on the callable; `exp_backoff_bound` caps the widened delay at
    /// `timeout * exp_backoff_bound`.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        pool: Arc<WorkerPool>,
        timeout: Duration,
        exp_backoff_bound: u32,
        task: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        debug_assert!(exp_backoff_bound >= 1, "back-off bound must be at least 1");
        let timeout_ms = timeout.as_millis() as u64;
        let inner = Arc::new(Inner {
            name: name.into(),
            pool,
            task: Arc::new(move || -> TaskFuture { Box::pin(task()) }),
            timeout_ms,
            max_delay_ms: timeout_ms.saturating_mul(u64::from(exp_backoff_bound.max(1))),
            delay_ms: AtomicU64::new(timeout_ms),
            metrics: TaskMetrics::default(),
            cancel: CancellationToken::new(),
        });

        let loop_inner = Arc::clone(&inner);
        let join = tokio::spawn(async move {
            loop {
                let delay = Duration::from_millis(loop_inner.delay_ms.load(Ordering::Relaxed));
                tokio::select! {
                    _ = loop_inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                loop_inner.tick().await;
            }
            debug!(name = %loop_inner.name, "supervision ended");
        });

        Self { inner, join }
    }

    /// Cancel the next scheduled tick. An in-flight callable finishes its
    /// tick (bounded by the timeout) before the loop exits.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Current outcome counters.
    pub fn metrics(&self) -> TaskMetricsSnapshot {
        let m = &self.inner.metrics;
        TaskMetricsSnapshot {
            success: m.success.load(Ordering::Relaxed),
            timeouts: m.timeouts.load(Ordering::Relaxed),
            rejected: m.rejected.load(Ordering::Relaxed),
            failures: m.failures.load(Ordering::Relaxed),
        }
    }

    /// Delay before the next tick.
    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.inner.delay_ms.load(Ordering::Relaxed))
    }

    /// Wait for the supervision loop to exit after cancellation.
    pub async fn join(self) {
        self.cancel();
        let _ = self.join.await;
    }
}

impl Inner {
    async fn tick(&self) {
        let permit = match self.pool.try_submit() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(name = %self.name, "worker pool saturated, tick rejected");
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let future = (self.task)();
        let mut worker = tokio::spawn(async move {
            let _permit = permit;
            future.await
        });

        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), &mut worker).await {
            Ok(Ok(Ok(()))) => {
                self.delay_ms.store(self.timeout_ms, Ordering::Relaxed);
                self.metrics.success.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Ok(Err(error))) => {
                warn!(name = %self.name, error = %error, "supervised task failed");
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(join_error)) => {
                warn!(name = %self.name, error = %join_error, "supervised task panicked");
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                warn!(
                    name = %self.name,
                    timeout_ms = self.timeout_ms,
                    "supervised task timed out"
                );
                self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                let current = self.delay_ms.load(Ordering::Relaxed);
                let widened = current.saturating_mul(2).min(self.max_delay_ms);
                let _ = self.delay_ms.compare_exchange(
                    current,
                    widened,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
        }

        // A timed-out callable must not outlive its tick.
        worker.abort();
    }
}
